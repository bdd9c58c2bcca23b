//! Read-only ext4 driver.
//!
//! Supports rev 0/1 ext2/3/4 volumes with extent-mapped files, which has
//! been the mkfs default since Linux 2.6.23. Everything a bootloader does
//! not need is refused rather than approximated: writes, journal replay,
//! encrypted or inline files, extent trees with interior nodes, and
//! volumes carrying `INCOMPAT_64BIT` (whose group descriptors outgrow the
//! 32-byte layout decoded here) all surface [`BootError::Unsupported`].

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::pod_read_unaligned;
use log::{debug, info};

use crate::errors::{BootError, BootResult};
use crate::fs::VolumeRead;

pub mod dir;
pub mod extent;
pub mod inode;
pub mod sb;

use dir::DirRecords;
use extent::leaf_extents;
use inode::{Inode, ROOT_INODE};
use sb::{GroupDescriptor, IncompatFeatures, Superblock, GROUP_DESC_SIZE, SUPERBLOCK_OFFSET};

/// A mounted ext4 volume over a byte-addressable source.
pub struct Ext4Volume<R> {
    source: R,
    sb: Superblock,
}

impl<R: VolumeRead> Ext4Volume<R> {
    /// Checks the superblock magic without mounting.
    ///
    /// A volume too small to hold the superblock is simply not ext4; real
    /// I/O failures propagate.
    pub fn probe(source: &R) -> BootResult<bool> {
        let mut magic = [0u8; 2];
        match source.read_at(SUPERBLOCK_OFFSET + 0x38, &mut magic) {
            Ok(()) => Ok(u16::from_le_bytes(magic) == sb::EXT4_SIGNATURE),
            Err(BootError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reads and validates the superblock, taking ownership of the source.
    ///
    /// # Errors
    ///
    /// `VolumeCorrupted` on a bad magic, `Unsupported` when the volume
    /// advertises `INCOMPAT_64BIT`.
    pub fn mount(source: R) -> BootResult<Self> {
        let mut raw = vec![0u8; core::mem::size_of::<Superblock>()];
        source.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let sb: Superblock = pod_read_unaligned(&raw);

        if !sb.magic_valid() {
            return Err(BootError::VolumeCorrupted);
        }

        // 64-bit volumes use larger group descriptors; decoding them with
        // the 32-byte layout would mis-address every inode table past
        // group 0, so they are refused outright.
        if sb.incompat().contains(IncompatFeatures::IS_64BIT) {
            debug!(target: "ext4", "volume has INCOMPAT_64BIT, refusing");
            return Err(BootError::Unsupported);
        }

        info!(
            target: "ext4",
            "mounted volume label='{}' blk_size={} inodes={}",
            label(&sb.s_volume_name),
            sb.block_size(),
            sb.s_inodes_count,
        );

        Ok(Self { source, sb })
    }

    /// Resolves `path` (either separator, absolute from the root) to an
    /// inode.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing component, `Unsupported`/`VolumeCorrupted`
    /// from the underlying reads.
    pub fn resolve(&self, path: &str) -> BootResult<(u32, Inode)> {
        let mut ino = ROOT_INODE;
        let mut inode = self.read_inode(ino)?;

        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            if !inode.is_dir() {
                return Err(BootError::NotFound);
            }

            let data = self.inode_data(&inode)?;
            ino = dir::lookup(&data, component.as_bytes()).ok_or(BootError::NotFound)?;
            inode = self.read_inode(ino)?;
        }

        Ok((ino, inode))
    }

    /// Reads a regular file in full.
    pub fn read_file(&self, path: &str) -> BootResult<Vec<u8>> {
        let (_, inode) = self.resolve(path)?;
        if !inode.is_regular() {
            return Err(BootError::NotFound);
        }

        self.inode_data(&inode)
    }

    /// Whether `path` resolves to a directory.
    pub fn dir_exists(&self, path: &str) -> BootResult<bool> {
        match self.resolve(path) {
            Ok((_, inode)) => Ok(inode.is_dir()),
            Err(BootError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Lists the entry names of a directory, excluding `.` and `..`.
    pub fn list_dir(&self, path: &str) -> BootResult<Vec<String>> {
        let (_, inode) = self.resolve(path)?;
        if !inode.is_dir() {
            return Err(BootError::NotFound);
        }

        let data = self.inode_data(&inode)?;
        Ok(DirRecords::new(&data)
            .filter(|record| record.name != b"." && record.name != b"..")
            .map(|record| String::from_utf8_lossy(record.name).into_owned())
            .collect())
    }

    /// Loads an inode structure from its table.
    fn read_inode(&self, ino: u32) -> BootResult<Inode> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(BootError::VolumeCorrupted);
        }

        let group = u64::from((ino - 1) / self.sb.s_inodes_per_group);
        let index = u64::from((ino - 1) % self.sb.s_inodes_per_group);

        let mut raw_desc = [0u8; GROUP_DESC_SIZE as usize];
        self.source
            .read_at(self.sb.group_desc_offset(group), &mut raw_desc)?;
        let desc: GroupDescriptor = pod_read_unaligned(&raw_desc);

        let inode_offset = u64::from(desc.bg_inode_table_lo) * self.sb.block_size()
            + index * u64::from(self.sb.inode_size());

        // Larger on-disk inodes only append fields; the 128-byte core is
        // all the read path decodes.
        let mut raw_inode = [0u8; core::mem::size_of::<Inode>()];
        self.source.read_at(inode_offset, &mut raw_inode)?;

        Ok(pod_read_unaligned(&raw_inode))
    }

    /// Reads the full content of an extent-mapped inode.
    fn inode_data(&self, inode: &Inode) -> BootResult<Vec<u8>> {
        let flags = inode.flags();
        if flags.intersects(inode::InodeFlags::ENCRYPT | inode::InodeFlags::INLINE_DATA)
            || !flags.contains(inode::InodeFlags::EXTENTS)
        {
            return Err(BootError::Unsupported);
        }

        let size = usize::try_from(inode.size()).map_err(|_| BootError::OutOfResources)?;
        let block_size = self.sb.block_size();
        let mut data = vec![0u8; size];

        for ext in leaf_extents(&inode.i_block)? {
            let logical = u64::from(ext.ee_block) * block_size;
            if logical >= size as u64 {
                return Err(BootError::VolumeCorrupted);
            }

            // The last extent is truncated to the file's remaining size.
            let want = u64::min(ext.len_blocks() * block_size, size as u64 - logical);
            let dst = &mut data[logical as usize..(logical + want) as usize];
            self.source.read_at(ext.start_block() * block_size, dst)?;
        }

        Ok(data)
    }
}

/// NUL-padded label bytes as text, for the mount log line.
fn label(raw: &[u8; 16]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::bytes_of;
    use extent::{Extent, ExtentHeader, EXT4_EXT_MAGIC};

    const BLOCK: usize = 1024;

    struct MemDisk(Vec<u8>);

    impl VolumeRead for MemDisk {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::errors::CanFail {
            let start = offset as usize;
            let end = start + buf.len();
            if end > self.0.len() {
                return Err(BootError::NotFound);
            }
            buf.copy_from_slice(&self.0[start..end]);
            Ok(())
        }
    }

    fn dir_record(inode: u32, name: &[u8], rec_len: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&inode.to_le_bytes());
        bytes.extend_from_slice(&rec_len.to_le_bytes());
        bytes.push(name.len() as u8);
        bytes.push(2);
        bytes.extend_from_slice(name);
        bytes.resize(usize::from(rec_len), 0);
        bytes
    }

    fn extent_area(extents: &[Extent]) -> [u8; 60] {
        let header = ExtentHeader {
            eh_magic: EXT4_EXT_MAGIC,
            eh_entries: extents.len() as u16,
            eh_max: 4,
            eh_depth: 0,
            eh_generation: 0,
        };
        let mut area = [0u8; 60];
        area[..12].copy_from_slice(bytes_of(&header));
        for (i, ext) in extents.iter().enumerate() {
            area[12 + i * 12..24 + i * 12].copy_from_slice(bytes_of(ext));
        }
        area
    }

    fn test_inode(mode: u16, size: u32, extents: &[Extent]) -> Inode {
        let mut inode: Inode = bytemuck::Zeroable::zeroed();
        inode.i_mode = mode;
        inode.i_size_lo = size;
        inode.i_flags = inode::InodeFlags::EXTENTS.bits();
        inode.i_block = extent_area(extents);
        inode
    }

    fn one_extent(start: u32, len: u16) -> [Extent; 1] {
        [Extent {
            ee_block: 0,
            ee_len: len,
            ee_start_hi: 0,
            ee_start_lo: start,
        }]
    }

    /// 64-block image: superblock, one group, inode table at block 5, root
    /// dir at block 10 with `/boot` at block 11 holding `vmlinuz` (blocks
    /// 12-13, 1500 bytes).
    fn build_image(incompat_extra: u32) -> MemDisk {
        let mut image = vec![0u8; 64 * BLOCK];

        let mut sb: Superblock = bytemuck::Zeroable::zeroed();
        sb.s_inodes_count = 32;
        sb.s_blocks_count_lo = 64;
        sb.s_first_data_block = 1;
        sb.s_log_block_size = 0;
        sb.s_blocks_per_group = 64;
        sb.s_inodes_per_group = 16;
        sb.s_magic = sb::EXT4_SIGNATURE;
        sb.s_rev_level = 1;
        sb.s_inode_size = 128;
        sb.s_feature_incompat =
            (IncompatFeatures::EXTENTS | IncompatFeatures::FILETYPE).bits() | incompat_extra;
        sb.s_volume_name[..4].copy_from_slice(b"test");
        image[1024..2048].copy_from_slice(bytes_of(&sb));

        let mut desc: GroupDescriptor = bytemuck::Zeroable::zeroed();
        desc.bg_inode_table_lo = 5;
        image[2048..2048 + 32].copy_from_slice(bytes_of(&desc));

        let table = 5 * BLOCK;
        let root = test_inode(0x41ED, BLOCK as u32, &one_extent(10, 1));
        image[table + 128..table + 256].copy_from_slice(bytes_of(&root));
        let boot = test_inode(0x41ED, BLOCK as u32, &one_extent(11, 1));
        image[table + 10 * 128..table + 11 * 128].copy_from_slice(bytes_of(&boot));
        let vmlinuz = test_inode(0x81A4, 1500, &one_extent(12, 2));
        image[table + 11 * 128..table + 12 * 128].copy_from_slice(bytes_of(&vmlinuz));

        let mut root_dir = Vec::new();
        root_dir.extend(dir_record(2, b".", 12));
        root_dir.extend(dir_record(2, b"..", 12));
        root_dir.extend(dir_record(11, b"boot", (BLOCK - 24) as u16));
        image[10 * BLOCK..11 * BLOCK].copy_from_slice(&root_dir);

        let mut boot_dir = Vec::new();
        boot_dir.extend(dir_record(11, b".", 12));
        boot_dir.extend(dir_record(2, b"..", 12));
        boot_dir.extend(dir_record(12, b"vmlinuz", (BLOCK - 24) as u16));
        image[11 * BLOCK..12 * BLOCK].copy_from_slice(&boot_dir);

        for i in 0..1500 {
            image[12 * BLOCK + i] = (i % 251) as u8;
        }

        MemDisk(image)
    }

    #[test]
    fn probe_sees_magic() {
        assert!(Ext4Volume::probe(&build_image(0)).unwrap());
        assert!(!Ext4Volume::probe(&MemDisk(vec![0u8; 4 * BLOCK])).unwrap());
        // Shorter than the superblock itself: not ext4, not an error.
        assert!(!Ext4Volume::probe(&MemDisk(vec![0u8; 512])).unwrap());
    }

    #[test]
    fn resolves_root_to_inode_two() {
        let vol = Ext4Volume::mount(build_image(0)).unwrap();
        let (ino, inode) = vol.resolve("/").unwrap();
        assert_eq!(ino, ROOT_INODE);
        assert!(inode.is_dir());
    }

    #[test]
    fn reads_file_across_extent_truncation() {
        let vol = Ext4Volume::mount(build_image(0)).unwrap();
        let data = vol.read_file("/boot/vmlinuz").unwrap();
        assert_eq!(data.len(), 1500);
        assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn separator_style_is_irrelevant() {
        let vol = Ext4Volume::mount(build_image(0)).unwrap();
        let forward = vol.resolve("/boot/vmlinuz").unwrap().0;
        let backward = vol.resolve("\\boot\\vmlinuz").unwrap().0;
        assert_eq!(forward, backward);
    }

    #[test]
    fn missing_component_is_not_found() {
        let vol = Ext4Volume::mount(build_image(0)).unwrap();
        assert!(matches!(
            vol.read_file("/boot/initrd.img").err(),
            Some(BootError::NotFound)
        ));
    }

    #[test]
    fn lists_directories() {
        let vol = Ext4Volume::mount(build_image(0)).unwrap();
        assert!(vol.dir_exists("/boot").unwrap());
        assert!(!vol.dir_exists("/loader").unwrap());
        assert_eq!(vol.list_dir("/boot").unwrap(), ["vmlinuz"]);
    }

    #[test]
    fn refuses_64bit_volumes() {
        let err = Ext4Volume::mount(build_image(IncompatFeatures::IS_64BIT.bits())).err();
        assert!(matches!(err, Some(BootError::Unsupported)));
    }
}

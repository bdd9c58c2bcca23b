//! ext4 inode structure.
//!
//! Only the rev 0 core (first 128 bytes) is decoded; larger on-disk inodes
//! carry extended attributes and finer timestamps past that point, none of
//! which matter to a read-only boot-time path.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Inode number of the filesystem root directory.
pub const ROOT_INODE: u32 = 2;

bitflags! {
    /// Inode flags (`i_flags`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct InodeFlags: u32 {
        /// File content is encrypted.
        const ENCRYPT = 0x800;

        /// File uses an extent tree instead of the legacy block map.
        const EXTENTS = 0x8_0000;

        /// File data is stored inline in `i_block`.
        const INLINE_DATA = 0x1000_0000;
    }
}

/// File-type bits of `i_mode`.
const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;

/// On-disk ext4 inode, 128-byte core.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    /// File mode: type and permission bits.
    pub i_mode: u16,

    pub i_uid: u16,

    /// File size, low 32 bits.
    pub i_size_lo: u32,

    pub i_atime: u32,

    pub i_ctime: u32,

    pub i_mtime: u32,

    pub i_dtime: u32,

    pub i_gid: u16,

    pub i_links_count: u16,

    pub i_blocks_lo: u32,

    pub i_flags: u32,

    pub i_osd1: u32,

    /// Block map or extent tree, depending on [`InodeFlags::EXTENTS`].
    pub i_block: [u8; 60],

    pub i_generation: u32,

    pub i_file_acl_lo: u32,

    /// File size, high 32 bits.
    pub i_size_high: u32,

    pub i_obso_faddr: u32,

    pub i_osd2: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<Inode>() == 128);

impl Inode {
    /// Full 64-bit file size.
    pub fn size(&self) -> u64 {
        (u64::from(self.i_size_high) << 32) | u64::from(self.i_size_lo)
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.i_flags)
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.i_mode & S_IFMT == S_IFREG
    }
}

//! ext4 extent-tree structures.
//!
//! Extent-mapped files are the default since ext4 replaced the indirect
//! block map. The boot-time reader handles depth-0 trees only: all leaf
//! extents live directly in the inode's `i_block` area. Deeper trees (more
//! than four fragments) surface `Unsupported` rather than being walked.

use bytemuck::{pod_read_unaligned, Pod, Zeroable};

use crate::errors::{BootError, BootResult};

/// Magic number opening every extent node.
pub const EXT4_EXT_MAGIC: u16 = 0xF30A;

/// `ee_len` values above this mark the extent as uninitialized; the real
/// length is the value minus this bias.
pub const EXT_INIT_MAX_LEN: u16 = 32768;

/// Header shared by all extent-tree nodes.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentHeader {
    /// Magic, [`EXT4_EXT_MAGIC`].
    pub eh_magic: u16,

    /// Number of valid entries following the header.
    pub eh_entries: u16,

    /// Maximum number of entries that fit in this node.
    pub eh_max: u16,

    /// Depth of this node: 0 means entries are leaf [`Extent`]s.
    pub eh_depth: u16,

    pub eh_generation: u32,
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() == 12);

/// Leaf extent: maps `ee_len` logical blocks starting at `ee_block` onto
/// physical blocks starting at `(ee_start_hi << 32) | ee_start_lo`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Extent {
    /// First logical block covered by this extent.
    pub ee_block: u32,

    /// Length in blocks, biased by [`EXT_INIT_MAX_LEN`] when uninitialized.
    pub ee_len: u16,

    /// Physical start block, high 16 bits.
    pub ee_start_hi: u16,

    /// Physical start block, low 32 bits.
    pub ee_start_lo: u32,
}

const _: () = assert!(core::mem::size_of::<Extent>() == 12);

impl Extent {
    /// Physical block this extent starts at.
    pub fn start_block(&self) -> u64 {
        (u64::from(self.ee_start_hi) << 32) | u64::from(self.ee_start_lo)
    }

    /// Length in blocks with the uninitialized bias removed.
    pub fn len_blocks(&self) -> u64 {
        if self.ee_len > EXT_INIT_MAX_LEN {
            u64::from(self.ee_len - EXT_INIT_MAX_LEN)
        } else {
            u64::from(self.ee_len)
        }
    }
}

/// Decodes the depth-0 extent list embedded in an inode's `i_block` area.
///
/// # Errors
///
/// `VolumeCorrupted` on a bad node magic or an entry count that overflows
/// the inode area; `Unsupported` when the tree has interior nodes.
pub fn leaf_extents(i_block: &[u8; 60]) -> BootResult<impl Iterator<Item = Extent> + '_> {
    let header: ExtentHeader =
        pod_read_unaligned(&i_block[..core::mem::size_of::<ExtentHeader>()]);

    if header.eh_magic != EXT4_EXT_MAGIC {
        return Err(BootError::VolumeCorrupted);
    }
    if header.eh_depth != 0 {
        return Err(BootError::Unsupported);
    }

    let entries = usize::from(header.eh_entries);
    // i_block holds the header plus at most four leaf extents.
    if entries > 4 {
        return Err(BootError::VolumeCorrupted);
    }

    Ok((0..entries).map(|i| {
        let start = core::mem::size_of::<ExtentHeader>() + i * core::mem::size_of::<Extent>();
        pod_read_unaligned(&i_block[start..start + core::mem::size_of::<Extent>()])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::bytes_of;

    fn block_with(header: ExtentHeader, extents: &[Extent]) -> [u8; 60] {
        let mut area = [0u8; 60];
        area[..12].copy_from_slice(bytes_of(&header));
        for (i, ext) in extents.iter().enumerate() {
            area[12 + i * 12..24 + i * 12].copy_from_slice(bytes_of(ext));
        }
        area
    }

    #[test]
    fn decodes_leaf_extents() {
        let area = block_with(
            ExtentHeader {
                eh_magic: EXT4_EXT_MAGIC,
                eh_entries: 2,
                eh_max: 4,
                eh_depth: 0,
                eh_generation: 0,
            },
            &[
                Extent {
                    ee_block: 0,
                    ee_len: 8,
                    ee_start_hi: 1,
                    ee_start_lo: 0x10,
                },
                Extent {
                    ee_block: 8,
                    ee_len: EXT_INIT_MAX_LEN + 3,
                    ee_start_hi: 0,
                    ee_start_lo: 0x20,
                },
            ],
        );

        let extents: alloc::vec::Vec<Extent> = leaf_extents(&area).unwrap().collect();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].start_block(), 0x1_0000_0010);
        assert_eq!(extents[0].len_blocks(), 8);
        assert_eq!(extents[1].len_blocks(), 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let area = block_with(
            ExtentHeader {
                eh_magic: 0x1234,
                eh_entries: 0,
                eh_max: 4,
                eh_depth: 0,
                eh_generation: 0,
            },
            &[],
        );
        assert!(matches!(
            leaf_extents(&area).err(),
            Some(BootError::VolumeCorrupted)
        ));
    }

    #[test]
    fn rejects_interior_nodes() {
        let area = block_with(
            ExtentHeader {
                eh_magic: EXT4_EXT_MAGIC,
                eh_entries: 1,
                eh_max: 4,
                eh_depth: 1,
                eh_generation: 0,
            },
            &[],
        );
        assert!(matches!(
            leaf_extents(&area).err(),
            Some(BootError::Unsupported)
        ));
    }
}

//! ext4 superblock and block-group descriptor structures.
//!
//! The superblock stores the volume geometry (block size, inode size,
//! inodes per group) everything else is derived from. Only the fields the
//! read path needs are interpreted; the rest of the 1024-byte structure is
//! carried as opaque padding.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Byte offset of the primary superblock from the start of the partition.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Magic number identifying an ext2/3/4 superblock.
pub const EXT4_SIGNATURE: u16 = 0xEF53;

/// Size of a block-group descriptor without the `INCOMPAT_64BIT` feature.
pub const GROUP_DESC_SIZE: u64 = 32;

/// Inode size on rev 0 filesystems, which predate `s_inode_size`.
pub const REV0_INODE_SIZE: u16 = 128;

bitflags! {
    /// Incompatible feature set: the volume must not be touched unless
    /// every set flag is understood.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
        const EXTENTS = 0x0040;
        const IS_64BIT = 0x0080;
        const MMP = 0x0100;
        const FLEX_BG = 0x0200;
        const EA_INODE = 0x0400;
        const DIRDATA = 0x1000;
        const CSUM_SEED = 0x2000;
        const LARGEDIR = 0x4000;
        const INLINE_DATA = 0x8000;
        const ENCRYPT = 0x10000;
    }
}

/// On-disk ext4 superblock, located at byte offset 1024.
///
/// All multi-byte fields are little-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Total inode count.
    pub s_inodes_count: u32,

    /// Total block count (low 32 bits).
    pub s_blocks_count_lo: u32,

    /// Blocks reserved for the superuser.
    pub s_r_blocks_count_lo: u32,

    pub s_free_blocks_count_lo: u32,

    pub s_free_inodes_count: u32,

    /// First data block: 1 when `block_size == 1024`, 0 otherwise.
    pub s_first_data_block: u32,

    /// `block_size = 1024 << s_log_block_size`.
    pub s_log_block_size: u32,

    pub s_log_cluster_size: u32,

    pub s_blocks_per_group: u32,

    pub s_clusters_per_group: u32,

    pub s_inodes_per_group: u32,

    pub s_mtime: u32,

    pub s_wtime: u32,

    pub s_mnt_count: u16,

    pub s_max_mnt_count: u16,

    /// Magic signature, [`EXT4_SIGNATURE`].
    pub s_magic: u16,

    pub s_state: u16,

    pub s_errors: u16,

    pub s_minor_rev_level: u16,

    pub s_lastcheck: u32,

    pub s_checkinterval: u32,

    pub s_creator_os: u32,

    /// Revision level. Rev 0 has fixed 128-byte inodes.
    pub s_rev_level: u32,

    pub s_def_resuid: u16,

    pub s_def_resgid: u16,

    /// First non-reserved inode.
    pub s_first_ino: u32,

    /// Size of an on-disk inode structure (rev 1+).
    pub s_inode_size: u16,

    pub s_block_group_nr: u16,

    pub s_feature_compat: u32,

    pub s_feature_incompat: u32,

    pub s_feature_ro_compat: u32,

    /// Volume UUID.
    pub s_uuid: [u8; 16],

    /// Volume label, NUL-padded.
    pub s_volume_name: [u8; 16],

    /// Remainder of the 1024-byte superblock, not interpreted here.
    pub s_reserved: [u8; 888],
}

const _: () = assert!(core::mem::size_of::<Superblock>() == 1024);

impl Superblock {
    /// Whether the magic signature matches.
    pub fn magic_valid(&self) -> bool {
        self.s_magic == EXT4_SIGNATURE
    }

    /// Volume block size in bytes.
    pub fn block_size(&self) -> u64 {
        1024 << self.s_log_block_size
    }

    /// On-disk inode structure size.
    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level >= 1 {
            self.s_inode_size
        } else {
            REV0_INODE_SIZE
        }
    }

    /// Incompatible feature flags, unknown bits dropped.
    pub fn incompat(&self) -> IncompatFeatures {
        IncompatFeatures::from_bits_truncate(self.s_feature_incompat)
    }

    /// Byte offset of the descriptor for block group `group`.
    ///
    /// The descriptor table starts in the block following the superblock.
    pub fn group_desc_offset(&self, group: u64) -> u64 {
        (u64::from(self.s_first_data_block) + 1) * self.block_size() + group * GROUP_DESC_SIZE
    }
}

/// On-disk block-group descriptor (32-byte layout, no `INCOMPAT_64BIT`).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GroupDescriptor {
    pub bg_block_bitmap_lo: u32,

    pub bg_inode_bitmap_lo: u32,

    /// First block of this group's inode table.
    pub bg_inode_table_lo: u32,

    pub bg_free_blocks_count_lo: u16,

    pub bg_free_inodes_count_lo: u16,

    pub bg_used_dirs_count_lo: u16,

    pub bg_flags: u16,

    pub bg_exclude_bitmap_lo: u32,

    pub bg_block_bitmap_csum_lo: u16,

    pub bg_inode_bitmap_csum_lo: u16,

    pub bg_itable_unused_lo: u16,

    pub bg_checksum: u16,
}

const _: () = assert!(core::mem::size_of::<GroupDescriptor>() as u64 == GROUP_DESC_SIZE);

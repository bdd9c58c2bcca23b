//! Filesystem identification.
//!
//! Each built-in driver knows how to recognize its own superblock. A probe
//! reads only the documented signature location, never mutates the device,
//! and treats a volume too small to hold the superblock as a clean miss.
//!
//! Only ext4 can actually be mounted; btrfs, XFS and NTFS are identified
//! so the scanner can log what it skipped instead of guessing.

use crate::errors::{BootError, BootResult};
use crate::fs::ext4::Ext4Volume;
use crate::fs::VolumeRead;

/// btrfs superblock magic, at byte 0x10040.
const BTRFS_MAGIC_OFFSET: u64 = 0x10040;
const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

/// XFS stores its magic big-endian in the first superblock word.
const XFS_MAGIC: u32 = 0x5846_5342; // "XFSB"

/// NTFS OEM id, at byte 3 of the boot sector.
const NTFS_OEM_OFFSET: u64 = 3;
const NTFS_OEM: &[u8; 8] = b"NTFS    ";

/// The built-in filesystem drivers, in probe order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsKind {
    Ext4,
    Btrfs,
    Xfs,
    Ntfs,
}

/// Probe order: the only mountable driver first.
pub const DRIVERS: [FsKind; 4] = [FsKind::Ext4, FsKind::Btrfs, FsKind::Xfs, FsKind::Ntfs];

impl FsKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Xfs => "xfs",
            Self::Ntfs => "ntfs",
        }
    }

    /// Whether this driver can do more than identify the filesystem.
    pub fn mountable(self) -> bool {
        matches!(self, Self::Ext4)
    }

    /// Checks the driver's signature on `source`.
    ///
    /// # Errors
    ///
    /// Propagates real I/O failures; a missing signature or a volume
    /// shorter than the signature location is `Ok(false)`.
    pub fn probe(self, source: &impl VolumeRead) -> BootResult<bool> {
        match self {
            Self::Ext4 => Ext4Volume::probe(source),
            Self::Btrfs => signature_matches(source, BTRFS_MAGIC_OFFSET, BTRFS_MAGIC),
            Self::Xfs => {
                let mut word = [0u8; 4];
                match source.read_at(0, &mut word) {
                    // Big-endian on disk, unlike everything else we read.
                    Ok(()) => Ok(u32::from_be_bytes(word) == XFS_MAGIC),
                    Err(BootError::NotFound) => Ok(false),
                    Err(err) => Err(err),
                }
            }
            Self::Ntfs => signature_matches(source, NTFS_OEM_OFFSET, NTFS_OEM),
        }
    }
}

fn signature_matches(
    source: &impl VolumeRead,
    offset: u64,
    expected: &[u8; 8],
) -> BootResult<bool> {
    let mut found = [0u8; 8];
    match source.read_at(offset, &mut found) {
        Ok(()) => Ok(&found == expected),
        Err(BootError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

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

    #[test]
    fn identifies_btrfs() {
        let mut image = vec![0u8; 0x11000];
        image[0x10040..0x10048].copy_from_slice(BTRFS_MAGIC);
        assert!(FsKind::Btrfs.probe(&MemDisk(image)).unwrap());
    }

    #[test]
    fn identifies_xfs_big_endian() {
        let mut image = vec![0u8; 512];
        image[..4].copy_from_slice(b"XFSB");
        assert!(FsKind::Xfs.probe(&MemDisk(image)).unwrap());

        // The same bytes little-endian are not XFS.
        let mut swapped = vec![0u8; 512];
        swapped[..4].copy_from_slice(b"BSFX");
        assert!(!FsKind::Xfs.probe(&MemDisk(swapped)).unwrap());
    }

    #[test]
    fn identifies_ntfs() {
        let mut image = vec![0u8; 512];
        image[3..11].copy_from_slice(NTFS_OEM);
        assert!(FsKind::Ntfs.probe(&MemDisk(image)).unwrap());
    }

    #[test]
    fn short_volume_is_a_miss_not_an_error() {
        let image = MemDisk(vec![0u8; 64]);
        for driver in DRIVERS {
            assert!(!driver.probe(&image).unwrap());
        }
    }
}

//! The virtual filesystem layer.
//!
//! One uniform file-read interface over two kinds of backend: the
//! firmware's own FAT driver (`SimpleFileSystem` on the partition handle)
//! and the built-in drivers reading raw blocks. Paths use backslash
//! separators at this boundary; built-in drivers accept either separator
//! internally, the firmware gets the path verbatim.
//!
//! Mounts are created lazily on first access and retained for the whole
//! run. The table is bounded: a machine with more than 64 usable
//! partitions keeps its first 64.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::{debug, warn};
use uefi::proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, FileType};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::{CString16, Handle};

use crate::errors::{BootError, BootResult, CanFail};
use crate::fs::device::{open_on, BlockDevice};
use crate::fs::ext4::Ext4Volume;
use crate::fs::probe::DRIVERS;

/// Upper bound on live mounts.
pub const MAX_MOUNTS: usize = 64;

/// File content as returned by [`Vfs::read_file`].
///
/// The backing buffer always carries one zero byte past the end of the
/// file, so configs that are known to be text can be handed to C-string
/// style consumers without a copy.
pub struct FileContents {
    data: Vec<u8>,
}

impl FileContents {
    fn from_content(mut data: Vec<u8>) -> Self {
        data.push(0);
        Self { data }
    }

    /// The file bytes, without the guard NUL.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.data.len() - 1]
    }

    /// The file bytes including the trailing NUL.
    pub fn with_nul(&self) -> &[u8] {
        &self.data
    }

    /// File size in bytes.
    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What actually serves reads for a mounted partition.
enum MountBackend {
    /// The firmware FAT driver on the partition handle.
    FirmwareFat,

    /// A built-in driver over raw block reads.
    Ext4(Ext4Volume<BlockDevice>),
}

/// Per-partition mount state.
struct Mount {
    backend: MountBackend,
}

/// The mount table and dispatch logic.
#[derive(Default)]
pub struct Vfs {
    mounts: HashMap<usize, Mount>,
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts the partition behind `handle` if it is not mounted yet.
    ///
    /// Idempotent: later calls for the same handle are no-ops.
    ///
    /// # Errors
    ///
    /// `OutOfResources` once the table is full (existing mounts are kept),
    /// `Unsupported` when neither the firmware nor a built-in driver
    /// claims the partition.
    pub fn open_device(&mut self, handle: Handle) -> CanFail {
        if self.mounts.contains_key(&mount_key(handle)) {
            return Ok(());
        }
        if self.mounts.len() >= MAX_MOUNTS {
            return Err(BootError::OutOfResources);
        }

        let backend = Self::mount_backend(handle)?;
        self.mounts.insert(mount_key(handle), Mount { backend });
        Ok(())
    }

    /// Probes the backends in order: firmware FAT first, then the
    /// built-in drivers.
    fn mount_backend(handle: Handle) -> BootResult<MountBackend> {
        if open_on::<SimpleFileSystem>(handle).is_ok() {
            debug!(target: "vfs", "using firmware fs for {handle:?}");
            return Ok(MountBackend::FirmwareFat);
        }

        let device = BlockDevice::new(handle)?;
        for driver in DRIVERS {
            match driver.probe(&device) {
                Ok(true) => {
                    if !driver.mountable() {
                        debug!(
                            target: "vfs",
                            "{handle:?} is {}, identify-only", driver.name()
                        );
                        return Err(BootError::Unsupported);
                    }
                    return Ok(MountBackend::Ext4(Ext4Volume::mount(device)?));
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(target: "vfs", "{} probe failed on {handle:?}: {err}", driver.name());
                }
            }
        }

        Err(BootError::Unsupported)
    }

    /// Reads a whole file.
    ///
    /// `path` is absolute and backslash-separated; built-in drivers accept
    /// forward slashes too and resolve from their root.
    pub fn read_file(&mut self, handle: Handle, path: &str) -> BootResult<FileContents> {
        self.open_device(handle)?;

        match &self.mount(handle)?.backend {
            MountBackend::FirmwareFat => firmware_read_file(handle, path),
            MountBackend::Ext4(volume) => {
                Ok(FileContents::from_content(volume.read_file(path)?))
            }
        }
    }

    /// Whether `path` exists on the partition.
    ///
    /// Cheap on firmware mounts (open + close). Built-in drivers resolve
    /// the path, which reads directory data; acceptable for the small
    /// config files this is used on.
    pub fn file_exists(&mut self, handle: Handle, path: &str) -> bool {
        if self.open_device(handle).is_err() {
            return false;
        }

        match self.mount(handle).map(|m| &m.backend) {
            Ok(MountBackend::FirmwareFat) => firmware_open(handle, path).is_ok(),
            Ok(MountBackend::Ext4(volume)) => volume.resolve(path).is_ok(),
            Err(_) => false,
        }
    }

    /// Whether `path` exists and is a directory.
    pub fn dir_exists(&mut self, handle: Handle, path: &str) -> bool {
        if self.open_device(handle).is_err() {
            return false;
        }

        match self.mount(handle).map(|m| &m.backend) {
            Ok(MountBackend::FirmwareFat) => matches!(
                firmware_open(handle, path).and_then(|f| f.into_type().map_err(Into::into)),
                Ok(FileType::Dir(_))
            ),
            Ok(MountBackend::Ext4(volume)) => volume.dir_exists(path).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Lists the entry names of a directory, excluding `.` and `..`.
    pub fn read_dir(&mut self, handle: Handle, path: &str) -> BootResult<Vec<String>> {
        self.open_device(handle)?;

        match &self.mount(handle)?.backend {
            MountBackend::FirmwareFat => firmware_read_dir(handle, path),
            MountBackend::Ext4(volume) => volume.list_dir(path),
        }
    }

    /// Whether the partition is served by the firmware's FAT driver.
    pub fn uses_firmware_fs(&self, handle: Handle) -> bool {
        matches!(
            self.mounts.get(&mount_key(handle)),
            Some(Mount {
                backend: MountBackend::FirmwareFat
            })
        )
    }

    /// Drops all non-firmware mounts.
    ///
    /// Firmware mounts hold no state, so this empties the whole table.
    pub fn shutdown(&mut self) {
        debug!(target: "vfs", "unmounting {} volumes", self.mounts.len());
        self.mounts.clear();
    }

    fn mount(&self, handle: Handle) -> BootResult<&Mount> {
        self.mounts
            .get(&mount_key(handle))
            .ok_or(BootError::NotFound)
    }
}

/// Mount-table key for a handle.
fn mount_key(handle: Handle) -> usize {
    handle.as_ptr() as usize
}

/// Opens `path` on the firmware FAT driver, verbatim.
fn firmware_open(handle: Handle, path: &str) -> BootResult<uefi::proto::media::file::FileHandle> {
    let mut fs = open_on::<SimpleFileSystem>(handle)?;
    let mut root = fs.open_volume()?;
    let path = CString16::try_from(path).map_err(|_| BootError::InvalidParameter)?;

    root.open(&path, FileMode::Read, FileAttribute::empty())
        .map_err(Into::into)
}

fn firmware_read_file(handle: Handle, path: &str) -> BootResult<FileContents> {
    let file = firmware_open(handle, path)?;
    let mut file = match file.into_type()? {
        FileType::Regular(file) => file,
        FileType::Dir(_) => return Err(BootError::NotFound),
    };

    let info = file.get_boxed_info::<FileInfo>()?;
    let size = usize::try_from(info.file_size()).map_err(|_| BootError::OutOfResources)?;

    let mut data = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let read = file.read(&mut data[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    data.truncate(filled);

    Ok(FileContents::from_content(data))
}

fn firmware_read_dir(handle: Handle, path: &str) -> BootResult<Vec<String>> {
    let file = firmware_open(handle, path)?;
    let mut dir: Directory = match file.into_type()? {
        FileType::Dir(dir) => dir,
        FileType::Regular(_) => return Err(BootError::NotFound),
    };

    let mut names = Vec::new();
    while let Some(info) = dir.read_entry_boxed()? {
        let name = info.file_name().to_string();
        if name != "." && name != ".." {
            names.push(name);
        }
    }

    Ok(names)
}

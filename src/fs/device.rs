//! Byte-granular reads from a partition handle.
//!
//! Built-in filesystem drivers address their volume in bytes. The firmware
//! exposes two read paths: `DiskIo`, which is already byte-granular, and
//! `BlockIO`, which only reads whole sectors. [`BlockDevice`] prefers the
//! former and falls back to sector-aligned reads with head/tail copying.
//!
//! Protocols are opened non-exclusively for each read: an exclusive open
//! would disconnect the firmware's own FAT driver from the handle, and the
//! VFS still needs it for firmware-backed mounts.

use alloc::vec;

use uefi::boot::{self, OpenProtocolAttributes, OpenProtocolParams, ScopedProtocol};
use uefi::proto::media::block::BlockIO;
use uefi::proto::media::disk::DiskIo;
use uefi::Handle;

use crate::errors::{BootError, BootResult, CanFail};

/// Read access to one partition, identified by its `BlockIO` handle.
///
/// Geometry is cached at construction; every read opens the protocol for
/// the duration of the call.
#[derive(Clone, Copy, Debug)]
pub struct BlockDevice {
    handle: Handle,
    media_id: u32,
    block_size: u32,
    total_bytes: u64,
    has_disk_io: bool,
}

impl BlockDevice {
    /// Caches the media geometry for `handle`.
    ///
    /// # Errors
    ///
    /// Fails if the handle does not carry `BlockIO`, or if no media is
    /// present.
    pub fn new(handle: Handle) -> BootResult<Self> {
        let block_io = open_on::<BlockIO>(handle)?;
        let media = block_io.media();

        if !media.is_media_present() {
            return Err(BootError::NotFound);
        }

        let block_size = media.block_size();
        let total_bytes = (media.last_block() + 1) * u64::from(block_size);
        let has_disk_io = open_on::<DiskIo>(handle).is_ok();

        Ok(Self {
            handle,
            media_id: media.media_id(),
            block_size,
            total_bytes,
            has_disk_io,
        })
    }

    /// The partition handle this device reads from.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Reads `buf.len()` bytes starting at byte `offset` from the start of
    /// the partition.
    ///
    /// # Errors
    ///
    /// `NotFound` if the requested range extends past the end of the
    /// medium (short images are a normal sight when probing), otherwise
    /// the underlying firmware error.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> CanFail {
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(BootError::InvalidParameter)?;
        if end > self.total_bytes {
            return Err(BootError::NotFound);
        }

        if self.has_disk_io {
            let disk_io = open_on::<DiskIo>(self.handle)?;
            disk_io.read_disk(self.media_id, offset, buf)?;
            return Ok(());
        }

        self.read_bytes_block_aligned(offset, buf)
    }

    /// Sector-aligned fallback: reads the covering block span into a
    /// scratch buffer and copies out the requested window.
    fn read_bytes_block_aligned(&self, offset: u64, buf: &mut [u8]) -> CanFail {
        let block_size = u64::from(self.block_size);
        let first_lba = offset / block_size;
        let head = (offset % block_size) as usize;
        let span_blocks = (head as u64 + buf.len() as u64).div_ceil(block_size);

        let block_io = open_on::<BlockIO>(self.handle)?;
        let mut scratch = vec![0u8; (span_blocks * block_size) as usize];
        block_io.read_blocks(self.media_id, first_lba, &mut scratch)?;

        buf.copy_from_slice(&scratch[head..head + buf.len()]);
        Ok(())
    }
}

/// Opens a protocol on `handle` without taking it over from its current
/// driver.
pub(crate) fn open_on<P: uefi::proto::ProtocolPointer + ?Sized>(
    handle: Handle,
) -> BootResult<ScopedProtocol<P>> {
    let params = OpenProtocolParams {
        handle,
        agent: boot::image_handle(),
        controller: None,
    };

    // Safety: GetProtocol does not require exclusivity and the scoped
    // handle closes the protocol again on drop.
    unsafe { boot::open_protocol::<P>(params, OpenProtocolAttributes::GetProtocol) }
        .map_err(Into::into)
}

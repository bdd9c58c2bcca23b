//! Chain-loading of arbitrary EFI payloads.
//!
//! Anything we cannot boot directly (Windows Boot Manager, a firmware
//! shell, another bootloader) is read through the VFS and handed to the
//! firmware's own image loader. Unlike a Linux handoff, a chain-loaded
//! image returning is normal: the payload may voluntarily exit back to
//! the menu.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{info, warn};
use uefi::boot::{self, LoadImageSource};
use uefi::proto::device_path::{build, DevicePath};
use uefi::proto::BootPolicy;
use uefi::{CString16, Handle};

use crate::config::BootTarget;
use crate::errors::{BootError, BootResult};
use crate::fs::device::open_on;
use crate::fs::vfs::Vfs;

/// Loads and starts the target's `.efi` payload.
///
/// Returns `Ok` when the payload came back on its own; any firmware error
/// is reported so the menu can be re-entered.
pub fn chainload_efi(vfs: &mut Vfs, target: &BootTarget) -> BootResult<()> {
    info!(target: "chain", "chain-loading {}", target.efi_path);
    let payload = vfs.read_file(target.device, &target.efi_path)?;

    let device_path = payload_device_path(target.device, &target.efi_path)?;

    // Prefer handing the firmware the in-memory buffer; some firmware
    // refuses buffer loads (e.g. with secure boot policies) and wants to
    // read the file itself.
    let image = match boot::load_image(
        boot::image_handle(),
        LoadImageSource::FromBuffer {
            buffer: payload.bytes(),
            file_path: Some(&device_path),
        },
    ) {
        Ok(image) => image,
        Err(err) => {
            warn!(target: "chain", "buffer load refused ({err}), retrying by device path");
            boot::load_image(
                boot::image_handle(),
                LoadImageSource::FromDevicePath {
                    device_path: &device_path,
                    boot_policy: BootPolicy::ExactMatch,
                },
            )?
        }
    };

    boot::start_image(image)?;

    info!(target: "chain", "payload exited back to the menu");
    Ok(())
}

/// Builds a full device path: the source partition's path with the file
/// path appended.
fn payload_device_path(device: Handle, efi_path: &str) -> BootResult<Box<DevicePath>> {
    let device_dp = open_on::<DevicePath>(device)?;
    let file_name =
        CString16::try_from(efi_path).map_err(|_| BootError::InvalidParameter)?;

    let mut storage = Vec::new();
    let mut builder = build::DevicePathBuilder::with_vec(&mut storage);
    for node in device_dp.node_iter() {
        builder = builder
            .push(&node)
            .map_err(|_| BootError::OutOfResources)?;
    }
    builder = builder
        .push(&build::media::FilePath {
            path_name: &file_name,
        })
        .map_err(|_| BootError::OutOfResources)?;

    let path = builder.finalize().map_err(|_| BootError::OutOfResources)?;
    Ok(path.to_boxed())
}

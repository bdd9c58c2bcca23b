//! Partition scanner.
//!
//! Walks every `BlockIO` handle the firmware knows about, mounts the
//! partitions through the VFS, and runs each config parser over its
//! candidate paths. Ordering is deterministic: handles in firmware
//! enumeration order, parsers in declaration order, entries in file
//! order. A partition contributes at most one config per parser.
//!
//! Failures stay local: a partition that cannot be mounted or a config
//! that cannot be parsed is logged and skipped, and the scan only fails
//! as a whole when it produced nothing at all.

use log::{debug, info, warn};
use uefi::boot::{self, SearchType};
use uefi::proto::media::block::BlockIO;

use crate::config::{BootTargetList, PARSERS};
use crate::errors::{BootError, BootResult};
use crate::fs::device::open_on;
use crate::fs::vfs::Vfs;

/// Everything a scan produced: the targets and the mounts needed to read
/// the kernels they point at.
pub struct ScanResult {
    pub targets: BootTargetList,
    pub vfs: Vfs,
}

/// Scans all present logical partitions for boot configurations.
///
/// # Errors
///
/// `NotFound` when no partition yielded a single target.
pub fn scan_all() -> BootResult<ScanResult> {
    let mut vfs = Vfs::new();
    let mut targets = BootTargetList::new();

    let handles = boot::locate_handle_buffer(SearchType::from_proto::<BlockIO>())?;
    info!(target: "scan", "scanning {} block handles", handles.len());

    for &handle in handles.iter() {
        if targets.is_full() {
            break;
        }

        // Whole-disk handles and absent media never carry a filesystem we
        // want; partitions show up as their own handles.
        let is_partition = match open_on::<BlockIO>(handle) {
            Ok(block_io) => {
                let media = block_io.media();
                media.is_media_present() && media.is_logical_partition()
            }
            Err(_) => false,
        };
        if !is_partition {
            continue;
        }

        if let Err(err) = vfs.open_device(handle) {
            debug!(target: "scan", "skipping {handle:?}: {err}");
            continue;
        }

        scan_partition(&mut vfs, handle, &mut targets);
    }

    if targets.is_empty() {
        return Err(BootError::NotFound);
    }

    info!(target: "scan", "found {} boot targets", targets.len());
    Ok(ScanResult { targets, vfs })
}

/// Runs every parser over one mounted partition.
fn scan_partition(vfs: &mut Vfs, handle: uefi::Handle, targets: &mut BootTargetList) {
    for parser in PARSERS {
        if targets.is_full() {
            return;
        }

        for path in parser.probe_paths() {
            if !vfs.file_exists(handle, path) {
                continue;
            }

            match vfs.read_file(handle, path) {
                Ok(content) => {
                    match parser.parse(vfs, content.bytes(), handle, path, targets) {
                        Ok(count) => {
                            info!(
                                target: "scan",
                                "{}: {count} entries from {path}", parser.name()
                            );
                        }
                        Err(err) => {
                            warn!(
                                target: "scan",
                                "{} failed on {path}: {err}", parser.name()
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "scan", "cannot read {path}: {err}");
                }
            }

            // First present path wins for this parser on this partition.
            break;
        }
    }
}

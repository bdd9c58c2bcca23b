//! UEFI application entry point.
//!
//! Wires the pipeline together: logging, the partition scan, and the
//! handoff of the chosen target. Menu rendering lives in the TUI
//! collaborator; without one, the default entry boots after the scan and
//! the remaining entries are tried in order when it fails.

#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
mod app {
    use log::{error, info, LevelFilter};
    use uefi::prelude::*;
    use uefi::proto::loaded_image::LoadedImage;

    use superboot::boot;
    use superboot::errors::{BootError, BootResult};
    use superboot::scan;

    #[entry]
    fn main() -> Status {
        if uefi::helpers::init().is_err() {
            return Status::ABORTED;
        }

        let verbose = load_options_contain("verbose");
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
        info!(target: "init", "superboot {}", env!("CARGO_PKG_VERSION"));

        match run() {
            Ok(()) => Status::SUCCESS,
            Err(err) => {
                error!(target: "init", "nothing bootable: {err}");
                Status::LOAD_ERROR
            }
        }
    }

    fn run() -> BootResult<()> {
        let mut result = scan::scan_all()?;

        if let Some(timeout) = result.targets.timeout_hint() {
            info!(target: "init", "menu timeout hint: {timeout}s");
        }

        // Default first, then everything else in menu order.
        let first = result.targets.default_index().unwrap_or(0);
        let order = core::iter::once(first)
            .chain((0..result.targets.len()).filter(move |&i| i != first));

        let mut last_err = BootError::NotFound;
        for index in order {
            let Some(target) = result.targets.get(index) else {
                continue;
            };
            let target = target.clone();

            info!(target: "init", "booting '{}'", target.title);
            match boot::boot_target(&mut result.vfs, &target) {
                // A chain-loaded payload may exit back to us; that is a
                // clean end of the run.
                Ok(()) => {
                    result.vfs.shutdown();
                    return Ok(());
                }
                Err(err) => {
                    error!(target: "init", "'{}' failed: {err}", target.title);
                    last_err = err;
                }
            }
        }

        result.vfs.shutdown();
        Err(last_err)
    }

    /// Scans the image load options for a flag like `verbose`.
    fn load_options_contain(flag: &str) -> bool {
        let Ok(loaded) =
            uefi::boot::open_protocol_exclusive::<LoadedImage>(uefi::boot::image_handle())
        else {
            return false;
        };

        match loaded.load_options_as_cstr16() {
            Ok(options) => {
                let mut options = alloc::string::ToString::to_string(options);
                options.make_ascii_lowercase();
                options.contains(flag)
            }
            Err(_) => false,
        }
    }

    extern crate alloc;
}

#[cfg(not(target_os = "uefi"))]
fn main() {}

//! Kernel and payload handoff.
//!
//! [`boot_target`] is the single entry point the menu calls once the user
//! (or the countdown) has settled on an entry.

pub mod chain;
pub mod linux;

use crate::config::BootTarget;
use crate::errors::BootResult;
use crate::fs::vfs::Vfs;

/// Boots `target` with the matching engine.
///
/// A Linux handoff does not return on success. A chain-load may return:
/// the payload is free to exit back to us.
pub fn boot_target(vfs: &mut Vfs, target: &BootTarget) -> BootResult<()> {
    if target.is_chainload {
        chain::chainload_efi(vfs, target)
    } else {
        linux::boot_linux(vfs, target)
    }
}

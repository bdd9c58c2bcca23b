//! SuperBoot: a UEFI boot manager that boots kernels straight from
//! foreign bootloader configurations.
//!
//! GRUB, systemd-boot and Limine configs are treated as declarations of
//! *boot intent*, not as scripts to chain-load their owners for. The
//! pipeline: [`scan`] enumerates partitions and drives the parsers in
//! [`config`], reading everything through the [`fs`] VFS; the winning
//! [`config::BootTarget`] is handed to [`boot`], which implements the
//! Linux x86 boot protocol directly (EFI handover and legacy bzImage) and
//! chain-loads everything else.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod errors;
pub mod fs;
pub mod scan;

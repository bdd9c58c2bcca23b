//! Limine configuration parser.
//!
//! Sections open with a `/`-prefixed, unindented line carrying the entry
//! name; `key: value` lines inside fill it in. A section is committed when
//! the next header (or the end of the file) is reached, and dropped when
//! it names neither a kernel nor an EFI payload.
//!
//! Values may carry a `boot():` or `guid(…):` volume prefix; both are
//! stripped, since the partition being scanned is the one we read from.

use alloc::string::{String, ToString};

use uefi::Handle;

use crate::config::{to_vfs_path, BootTarget, BootTargetList, ConfigType};
use crate::errors::BootResult;

/// Lowers a `limine.cfg` into boot targets.
pub fn parse(
    bytes: &[u8],
    device: Handle,
    config_path: &str,
    out: &mut BootTargetList,
) -> BootResult<usize> {
    let text = String::from_utf8_lossy(bytes);
    let mut added = 0;
    let mut section: Option<BootTarget> = None;

    for line in text.lines() {
        if line.starts_with('/') {
            if commit(section.take(), out) {
                added += 1;
            }
            if out.is_full() {
                return Ok(added);
            }

            let mut target = BootTarget::new(device, ConfigType::Limine, config_path);
            target.title = line.trim_start_matches('/').trim().to_string();
            section = Some(target);
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        let Some(target) = section.as_mut() else {
            // Keys before the first section configure the menu itself.
            if key == "timeout" {
                if let Ok(secs) = value.parse::<u32>() {
                    out.offer_timeout(secs);
                }
            }
            continue;
        };

        match key.as_str() {
            "kernel_path" => target.kernel_path = volume_path(value),
            "module_path" => target.initrd_paths.push(volume_path(value)),
            "kernel_cmdline" | "cmdline" => target.cmdline = value.to_string(),
            "protocol" => {
                if value.eq_ignore_ascii_case("chainload") {
                    target.is_chainload = true;
                }
            }
            "path" | "image_path" => {
                target.is_chainload = true;
                target.efi_path = volume_path(value);
            }
            _ => {}
        }
    }

    if commit(section, out) {
        added += 1;
    }

    Ok(added)
}

fn commit(section: Option<BootTarget>, out: &mut BootTargetList) -> bool {
    match section {
        Some(target) => out.push(target),
        None => false,
    }
}

/// Strips a `boot():` / `guid(…):` volume prefix and converts to the VFS
/// path convention.
fn volume_path(value: &str) -> String {
    let value = value.trim();

    let stripped = if let Some(rest) = value.strip_prefix("boot():") {
        rest
    } else if value.starts_with("guid(") || value.starts_with("uuid(") {
        match value.split_once("):") {
            Some((_, rest)) => rest,
            None => value,
        }
    } else {
        value
    };

    to_vfs_path(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_handle;
    use proptest::prelude::*;

    fn parse_str(config: &str) -> BootTargetList {
        let mut out = BootTargetList::new();
        parse(config.as_bytes(), test_handle(), "\\limine.cfg", &mut out).unwrap();
        out
    }

    #[test]
    fn chainload_section() {
        let out = parse_str(
            "/Windows\n    protocol: chainload\n    image_path: boot():/EFI/Microsoft/Boot/bootmgfw.efi\n",
        );

        assert_eq!(out.len(), 1);
        let target = out.get(0).unwrap();
        assert_eq!(target.title, "Windows");
        assert!(target.is_chainload);
        assert_eq!(target.efi_path, "\\EFI\\Microsoft\\Boot\\bootmgfw.efi");
    }

    #[test]
    fn linux_section_with_modules() {
        let out = parse_str(
            "timeout: 5\n\
             /Arch\n\
             \tprotocol: linux\n\
             \tkernel_path: boot():/vmlinuz-linux\n\
             \tmodule_path: boot():/intel-ucode.img\n\
             \tmodule_path: boot():/initramfs-linux.img\n\
             \tkernel_cmdline: root=/dev/sda2 rw\n",
        );

        assert_eq!(out.timeout_hint(), Some(5));
        let target = out.get(0).unwrap();
        assert_eq!(target.kernel_path, "\\vmlinuz-linux");
        assert_eq!(
            target.initrd_paths,
            ["\\intel-ucode.img", "\\initramfs-linux.img"]
        );
        assert_eq!(target.cmdline, "root=/dev/sda2 rw");
    }

    #[test]
    fn guid_prefixes_are_stripped() {
        let out = parse_str(
            "/Test\n    kernel_path: guid(8d3f7b2c-1234-5678-9abc-def012345678):/boot/vmlinuz\n",
        );
        assert_eq!(out.get(0).unwrap().kernel_path, "\\boot\\vmlinuz");
    }

    #[test]
    fn empty_sections_are_dropped() {
        let out = parse_str("/Nothing here\n    protocol: linux\n/Real\n    kernel_path: /k\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(0).unwrap().title, "Real");
    }

    #[test]
    fn nested_section_names_lose_their_slashes() {
        let out = parse_str("//Sub entry\n    kernel_path: /k\n");
        assert_eq!(out.get(0).unwrap().title, "Sub entry");
    }

    proptest! {
        #[test]
        fn never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let mut out = BootTargetList::new();
            let _ = parse(&bytes, test_handle(), "\\limine.cfg", &mut out);
        }
    }
}

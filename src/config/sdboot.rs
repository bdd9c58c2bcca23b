//! systemd-boot configuration parser.
//!
//! `\loader\loader.conf` only contributes the `default` pattern and the
//! `timeout`; the entries themselves live one per file under
//! `\loader\entries\*.conf`. Each line is a key followed by the trimmed
//! remainder; `initrd` may repeat.
//!
//! Default selection matches the pattern (wildcards dropped) as a
//! substring of the entry file stem, not by stem equality: `default arch`
//! selects `arch.conf` as well as `arch-lts.conf`, whichever comes first.

use alloc::format;
use alloc::string::String;

use log::{debug, warn};
use uefi::Handle;

use crate::config::{to_vfs_path, BootTarget, BootTargetList, ConfigType};
use crate::errors::BootResult;
use crate::fs::vfs::Vfs;

/// Directory holding one `.conf` per boot entry.
const ENTRIES_DIR: &str = "\\loader\\entries";

const ENTRY_SUFFIX: &str = ".conf";

/// Lowers `loader.conf` plus its entry files into boot targets.
pub fn parse(
    vfs: &mut Vfs,
    loader_conf: &[u8],
    device: Handle,
    config_path: &str,
    out: &mut BootTargetList,
) -> BootResult<usize> {
    debug!(target: "sd-boot", "found {config_path}, enumerating entries");
    let (default_pattern, timeout) = parse_loader_conf(loader_conf);
    if let Some(secs) = timeout {
        out.offer_timeout(secs);
    }

    let mut names = vfs.read_dir(device, ENTRIES_DIR)?;
    names.retain(|name| name.ends_with(ENTRY_SUFFIX));
    names.sort_unstable();

    let mut added = 0;
    for name in &names {
        if out.is_full() {
            break;
        }

        let path = format!("{ENTRIES_DIR}\\{name}");
        let content = match vfs.read_file(device, &path) {
            Ok(content) => content,
            Err(err) => {
                warn!(target: "sd-boot", "cannot read {path}: {err}");
                continue;
            }
        };

        let stem = name.trim_end_matches(ENTRY_SUFFIX);
        let is_default = default_pattern
            .as_deref()
            .is_some_and(|pattern| stem_matches(stem, pattern));

        if let Some(target) = parse_entry(content.bytes(), device, &path, stem) {
            let index = out.len();
            if out.push(target) {
                added += 1;
                if is_default && out.default_index().is_none() {
                    out.set_default(index);
                }
            }
        }
    }

    Ok(added)
}

/// Extracts `default` and `timeout` from `loader.conf`; everything else
/// in there concerns the menu renderer.
fn parse_loader_conf(bytes: &[u8]) -> (Option<String>, Option<u32>) {
    let text = String::from_utf8_lossy(bytes);
    let mut default = None;
    let mut timeout = None;

    for (key, value) in lines(&text) {
        match key {
            "default" => default = Some(String::from(value)),
            "timeout" => timeout = value.parse::<u32>().ok(),
            _ => {}
        }
    }

    (default, timeout)
}

/// Parses one entry file. Returns `None` when the entry has neither a
/// kernel nor an EFI payload.
fn parse_entry(bytes: &[u8], device: Handle, path: &str, stem: &str) -> Option<BootTarget> {
    let text = String::from_utf8_lossy(bytes);
    let mut target = BootTarget::new(device, ConfigType::SystemdBoot, path);

    for (key, value) in lines(&text) {
        match key {
            "title" => target.title = String::from(value),
            "linux" => target.kernel_path = to_vfs_path(value),
            "initrd" => target.initrd_paths.push(to_vfs_path(value)),
            "options" => {
                if !target.cmdline.is_empty() {
                    target.cmdline.push(' ');
                }
                target.cmdline.push_str(value);
            }
            "efi" => {
                target.is_chainload = true;
                target.efi_path = to_vfs_path(value);
            }
            _ => {}
        }
    }

    if target.title.is_empty() {
        target.title = String::from(stem);
    }

    target.is_bootable().then_some(target)
}

/// Key/value line iterator: key is the first whitespace-delimited token,
/// value the trimmed remainder. Comments and blanks are dropped.
fn lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        match line.split_once(char::is_whitespace) {
            Some((key, value)) => Some((key, value.trim())),
            None => Some((line, "")),
        }
    })
}

/// Substring match of the default pattern against an entry file stem,
/// with glob wildcards dropped from the pattern.
fn stem_matches(stem: &str, pattern: &str) -> bool {
    let needle: String = pattern
        .trim_end_matches(ENTRY_SUFFIX)
        .chars()
        .filter(|&c| c != '*' && c != '?')
        .collect();

    needle.is_empty() || stem.contains(&needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_handle;
    use proptest::prelude::*;

    #[test]
    fn entry_fields_are_lowered() {
        let entry = b"title Arch\n\
                      linux /vmlinuz-linux\n\
                      initrd /initramfs.img\n\
                      options root=UUID=X rw\n";
        let target = parse_entry(entry, test_handle(), "\\loader\\entries\\arch.conf", "arch")
            .unwrap();

        assert_eq!(target.title, "Arch");
        assert_eq!(target.kernel_path, "\\vmlinuz-linux");
        assert_eq!(target.initrd_paths, ["\\initramfs.img"]);
        assert_eq!(target.cmdline, "root=UUID=X rw");
        assert!(!target.is_chainload);
    }

    #[test]
    fn initrd_repeats_in_order() {
        let entry = b"linux /vmlinuz\n\
                      initrd /intel-ucode.img\n\
                      initrd /initramfs.img\n";
        let target = parse_entry(entry, test_handle(), "\\e.conf", "e").unwrap();
        assert_eq!(
            target.initrd_paths,
            ["\\intel-ucode.img", "\\initramfs.img"]
        );
    }

    #[test]
    fn efi_entries_are_chainloads() {
        let entry = b"title Firmware shell\nefi /shellx64.efi\n";
        let target = parse_entry(entry, test_handle(), "\\e.conf", "e").unwrap();
        assert!(target.is_chainload);
        assert_eq!(target.efi_path, "\\shellx64.efi");
    }

    #[test]
    fn kernel_less_entries_are_dropped() {
        let entry = b"title Just a title\noptions quiet\n";
        assert!(parse_entry(entry, test_handle(), "\\e.conf", "e").is_none());
    }

    #[test]
    fn title_falls_back_to_stem() {
        let entry = b"linux /vmlinuz\n";
        let target = parse_entry(entry, test_handle(), "\\e.conf", "arch").unwrap();
        assert_eq!(target.title, "arch");
    }

    #[test]
    fn loader_conf_default_and_timeout() {
        let conf = b"# comment\ndefault arch\ntimeout 3\nconsole-mode max\n";
        let (default, timeout) = parse_loader_conf(conf);
        assert_eq!(default.as_deref(), Some("arch"));
        assert_eq!(timeout, Some(3));
    }

    #[test]
    fn default_pattern_is_a_substring_match() {
        assert!(stem_matches("arch", "arch"));
        assert!(stem_matches("arch-lts", "arch"));
        assert!(stem_matches("arch-lts", "arch-*.conf"));
        assert!(!stem_matches("arch", "arch-*"));
        assert!(stem_matches("anything", "*"));
        assert!(!stem_matches("fedora", "arch"));
    }

    proptest! {
        #[test]
        fn never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let _ = parse_loader_conf(&bytes);
            let _ = parse_entry(&bytes, test_handle(), "\\f.conf", "f");
        }
    }
}

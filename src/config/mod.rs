//! Boot-intent extraction from foreign bootloader configurations.
//!
//! Each parser lowers one config dialect to [`BootTarget`], the uniform
//! description everything downstream works with. Parsers are a closed set:
//! the scanner iterates [`PARSERS`] in declaration order and the match in
//! [`Parser::parse`] is the whole dispatch.

use alloc::string::String;
use alloc::vec::Vec;

use uefi::Handle;

use crate::errors::BootResult;
use crate::fs::vfs::Vfs;

pub mod grub;
pub mod limine;
pub mod sdboot;

/// Global cap on menu entries per scan.
pub const MAX_TARGETS: usize = 64;

/// Most initrds a single target may load.
pub const MAX_INITRDS: usize = 8;

/// Cmdline cap in bytes, including the terminating NUL.
pub const MAX_CMDLINE: usize = 4096;

/// Path cap in characters.
pub const MAX_PATH: usize = 512;

/// Title cap in characters.
pub const MAX_TITLE: usize = 256;

/// Which dialect a target was extracted from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConfigType {
    Grub,
    SystemdBoot,
    Limine,
    #[default]
    Unknown,
}

/// One bootable menu entry, the universal boot intent.
///
/// Created by a parser, consumed by the boot engine. The TUI may edit
/// `cmdline` in place before handing the target over; everything else is
/// settled at parse time.
#[derive(Clone, Debug)]
pub struct BootTarget {
    /// Human-readable menu label.
    pub title: String,

    /// Absolute, backslash-separated path to the kernel on `device`.
    pub kernel_path: String,

    /// Initrd paths, loaded contiguously in order.
    pub initrd_paths: Vec<String>,

    /// Kernel command line, ASCII.
    pub cmdline: String,

    /// Where this entry came from.
    pub config_path: String,

    pub config_type: ConfigType,

    /// The partition the kernel and initrds are read from. The scanned
    /// partition is authoritative; device prefixes in configs are
    /// stripped.
    pub device: Handle,

    /// When set, `efi_path` replaces the kernel/initrd/cmdline semantics.
    pub is_chainload: bool,

    /// Path of a `.efi` payload to chain-load.
    pub efi_path: String,

    /// Position in the menu, assigned on insertion.
    pub index: usize,

    /// Menu default hint. At most one target per list carries it.
    pub is_default: bool,
}

impl BootTarget {
    /// An empty target bound to a partition and a config file.
    pub fn new(device: Handle, config_type: ConfigType, config_path: &str) -> Self {
        Self {
            title: String::new(),
            kernel_path: String::new(),
            initrd_paths: Vec::new(),
            cmdline: String::new(),
            config_path: String::from(config_path),
            config_type,
            device,
            is_chainload: false,
            efi_path: String::new(),
            index: 0,
            is_default: false,
        }
    }

    /// Whether the entry describes anything bootable at all.
    pub fn is_bootable(&self) -> bool {
        if self.is_chainload {
            !self.efi_path.is_empty()
        } else {
            !self.kernel_path.is_empty()
        }
    }

    /// Clamps field sizes to their documented caps.
    fn enforce_limits(&mut self) {
        truncate_chars(&mut self.title, MAX_TITLE);
        truncate_chars(&mut self.kernel_path, MAX_PATH);
        truncate_chars(&mut self.efi_path, MAX_PATH);
        self.initrd_paths.truncate(MAX_INITRDS);
        for path in &mut self.initrd_paths {
            truncate_chars(path, MAX_PATH);
        }
        // Keep one byte for the NUL appended at handoff time.
        truncate_chars(&mut self.cmdline, MAX_CMDLINE - 1);
    }
}

/// The scan's ordered, bounded result list.
#[derive(Default)]
pub struct BootTargetList {
    targets: Vec<BootTarget>,
    timeout_hint: Option<u32>,
}

impl BootTargetList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `target`, assigning its menu index.
    ///
    /// Unbootable targets and targets past the cap are dropped; returns
    /// whether the target was kept.
    pub fn push(&mut self, mut target: BootTarget) -> bool {
        if self.is_full() || !target.is_bootable() {
            return false;
        }

        target.enforce_limits();
        target.index = self.targets.len();
        self.targets.push(target);
        true
    }

    pub fn is_full(&self) -> bool {
        self.targets.len() >= MAX_TARGETS
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, BootTarget> {
        self.targets.iter()
    }

    pub fn get(&self, index: usize) -> Option<&BootTarget> {
        self.targets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BootTarget> {
        self.targets.get_mut(index)
    }

    pub fn as_slice(&self) -> &[BootTarget] {
        &self.targets
    }

    /// Index of the default entry, if any parser marked one.
    pub fn default_index(&self) -> Option<usize> {
        self.targets.iter().position(|t| t.is_default)
    }

    /// Records a menu countdown hint; the first config to offer one wins.
    pub fn offer_timeout(&mut self, secs: u32) {
        if self.timeout_hint.is_none() {
            self.timeout_hint = Some(secs);
        }
    }

    /// Countdown hint for the menu collaborator, in seconds.
    pub fn timeout_hint(&self) -> Option<u32> {
        self.timeout_hint
    }

    /// Marks `index` as the default, clearing any previous mark.
    pub fn set_default(&mut self, index: usize) {
        if index >= self.targets.len() {
            return;
        }
        for target in &mut self.targets {
            target.is_default = false;
        }
        self.targets[index].is_default = true;
    }
}

/// The registered config parsers, in scan order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parser {
    Grub,
    SystemdBoot,
    Limine,
}

pub const PARSERS: [Parser; 3] = [Parser::Grub, Parser::SystemdBoot, Parser::Limine];

impl Parser {
    pub fn name(self) -> &'static str {
        match self {
            Self::Grub => "grub",
            Self::SystemdBoot => "systemd-boot",
            Self::Limine => "limine",
        }
    }

    pub fn config_type(self) -> ConfigType {
        match self {
            Self::Grub => ConfigType::Grub,
            Self::SystemdBoot => ConfigType::SystemdBoot,
            Self::Limine => ConfigType::Limine,
        }
    }

    /// Candidate config locations, first match wins per partition.
    pub fn probe_paths(self) -> &'static [&'static str] {
        match self {
            Self::Grub => &[
                "\\boot\\grub\\grub.cfg",
                "\\grub\\grub.cfg",
                "\\grub2\\grub.cfg",
                "\\boot\\grub2\\grub.cfg",
                "\\EFI\\grub\\grub.cfg",
            ],
            Self::SystemdBoot => &["\\loader\\loader.conf"],
            Self::Limine => &[
                "\\limine.cfg",
                "\\boot\\limine\\limine.cfg",
                "\\EFI\\BOOT\\limine.cfg",
            ],
        }
    }

    /// Lowers one config file into `out`.
    ///
    /// Returns how many targets were appended. Malformed input is never
    /// fatal; parsers skip what they cannot read.
    pub fn parse(
        self,
        vfs: &mut Vfs,
        bytes: &[u8],
        device: Handle,
        config_path: &str,
        out: &mut BootTargetList,
    ) -> BootResult<usize> {
        match self {
            Self::Grub => grub::parse(bytes, device, config_path, out),
            Self::SystemdBoot => sdboot::parse(vfs, bytes, device, config_path, out),
            Self::Limine => limine::parse(bytes, device, config_path, out),
        }
    }
}

/// Strips a leading `(hdN,gptM)`-style device specifier.
///
/// The partition currently being scanned is authoritative, whatever the
/// config claims the path lives on.
pub(crate) fn strip_device_prefix(path: &str) -> &str {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix('(') {
        if let Some(close) = rest.find(')') {
            return &rest[close + 1..];
        }
    }
    path
}

/// Converts a config path to the VFS convention: backslash-separated and
/// absolute.
pub(crate) fn to_vfs_path(path: &str) -> String {
    let stripped = strip_device_prefix(path);
    let mut out = String::with_capacity(stripped.len() + 1);

    if !stripped.starts_with(['/', '\\']) {
        out.push('\\');
    }
    for ch in stripped.chars() {
        out.push(if ch == '/' { '\\' } else { ch });
    }
    out
}

/// Truncates a string to at most `max` characters.
fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}

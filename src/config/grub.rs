//! GRUB configuration parser.
//!
//! This is selective extraction, not interpretation. The parser walks the
//! file line by line, collects `menuentry` blocks and the handful of
//! commands that describe a bootable kernel, and skips scripting
//! constructs (`if`, `for`, `while`, `case`, `function`) by tracking their
//! closers. Entries whose paths would need a shell to evaluate still show
//! up in the menu and fail at load time; the cmdline editor is the
//! documented way out.
//!
//! Variables set with `set NAME=VAL` are expanded lazily when an entry is
//! committed, in a single left-to-right pass. `search --set=VAR` records
//! the variable as resolved to the partition being scanned, which is
//! where we read everything from anyway.

use alloc::string::String;
use alloc::vec::Vec;

use log::debug;
use uefi::Handle;

use crate::config::{
    to_vfs_path, BootTarget, BootTargetList, ConfigType, MAX_CMDLINE, MAX_PATH,
};
use crate::errors::BootResult;

/// Variable table bounds.
const MAX_VARS: usize = 128;
const MAX_VAR_NAME: usize = 64;
const MAX_VAR_VALUE: usize = 512;

/// Insertion-ordered `NAME -> VALUE` table, latest write wins.
#[derive(Default)]
pub struct VarTable {
    vars: Vec<(String, String)>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `name = value`, overwriting an existing binding.
    ///
    /// Oversized names or values and writes past the table cap are
    /// silently dropped, matching the parser's tolerance for bad input.
    pub fn set(&mut self, name: &str, value: &str) {
        if name.is_empty() || name.len() > MAX_VAR_NAME || value.len() > MAX_VAR_VALUE {
            return;
        }

        if let Some(slot) = self.vars.iter_mut().find(|(n, _)| n == name) {
            slot.1 = String::from(value);
            return;
        }

        if self.vars.len() < MAX_VARS {
            self.vars.push((String::from(name), String::from(value)));
        }
    }

    /// Looks `name` up by linear scan; unknown names are empty.
    pub fn get(&self, name: &str) -> &str {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map_or("", |(_, v)| v.as_str())
    }

    /// Expands `$NAME` and `${NAME}` references in one left-to-right
    /// pass, bounded to `cap - 1` bytes of output.
    pub fn expand(&self, src: &str, cap: usize) -> String {
        let mut out = String::new();
        let mut chars = src.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch != '$' {
                push_bounded(&mut out, ch, cap);
                continue;
            }

            let name = match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    for ch in chars.by_ref() {
                        if ch == '}' {
                            break;
                        }
                        name.push(ch);
                    }
                    name
                }
                Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    name
                }
                _ => {
                    // A lone `$` stays literal.
                    push_bounded(&mut out, '$', cap);
                    continue;
                }
            };

            for ch in self.get(&name).chars() {
                push_bounded(&mut out, ch, cap);
            }
        }

        out
    }
}

fn push_bounded(out: &mut String, ch: char, cap: usize) {
    if out.len() + ch.len_utf8() < cap {
        out.push(ch);
    }
}

/// A menuentry being accumulated, committed when its brace closes.
#[derive(Default)]
struct PendingEntry {
    title: String,
    kernel: Option<String>,
    initrds: Vec<String>,
    cmdline: String,
    efi: Option<String>,
}

/// Parser state across lines.
struct GrubParser<'a> {
    device: Handle,
    config_path: &'a str,
    vars: VarTable,
    /// Expected closers of scripting constructs being skipped, innermost
    /// last. Non-empty means skip mode.
    skip: Vec<&'static str>,
    /// Set between a `function` keyword and its body brace, which matches
    /// the closer already pushed.
    swallow_brace: bool,
    entry: Option<PendingEntry>,
    /// Brace depth of menuentry/submenu nesting.
    depth: u32,
    wanted_default: Option<String>,
    timeout: Option<u32>,
    /// Indices (in the output list) of entries committed by this parse.
    committed: Vec<usize>,
}

/// Lowers a `grub.cfg` into boot targets.
pub fn parse(
    bytes: &[u8],
    device: Handle,
    config_path: &str,
    out: &mut BootTargetList,
) -> BootResult<usize> {
    let text = String::from_utf8_lossy(bytes);
    let mut parser = GrubParser {
        device,
        config_path,
        vars: VarTable::new(),
        skip: Vec::new(),
        swallow_brace: false,
        entry: None,
        depth: 0,
        wanted_default: None,
        timeout: None,
        committed: Vec::new(),
    };

    for line in text.lines() {
        let tokens = tokenize(line);
        parser.process_tokens(&tokens, out);
        if out.is_full() {
            break;
        }
    }

    // An unclosed trailing entry is still worth committing.
    parser.commit_entry(out);
    parser.apply_default(out);
    if let Some(secs) = parser.timeout {
        out.offer_timeout(secs);
    }

    Ok(parser.committed.len())
}

impl GrubParser<'_> {
    fn process_tokens(&mut self, tokens: &[String], out: &mut BootTargetList) {
        if tokens.is_empty() {
            return;
        }

        if !self.skip.is_empty() {
            let resumed = self.scan_skip(tokens);
            if resumed < tokens.len() {
                self.process_tokens(&tokens[resumed..], out);
            }
            return;
        }

        let head = tokens[0].as_str();
        match head {
            "if" | "for" | "while" | "until" | "case" | "function" => {
                self.enter_skip(head);
                let resumed = self.scan_skip(&tokens[1..]) + 1;
                if resumed < tokens.len() {
                    self.process_tokens(&tokens[resumed..], out);
                }
            }
            "set" => {
                self.handle_set(tokens.get(1).map_or("", |t| t.as_str()));
                // `set` takes one assignment; the rest of the line is noise.
            }
            "menuentry" | "submenu" => {
                // A nested menuentry ends whatever was being collected.
                self.commit_entry(out);

                self.entry = Some(PendingEntry {
                    title: tokens
                        .get(1)
                        .filter(|t| !t.starts_with("--") && t.as_str() != "{")
                        .cloned()
                        .unwrap_or_default(),
                    ..PendingEntry::default()
                });

                if let Some(open) = tokens.iter().position(|t| t == "{") {
                    self.depth += 1;
                    if open + 1 < tokens.len() {
                        self.process_tokens(&tokens[open + 1..], out);
                    }
                }
            }
            "linux" | "linux16" | "linuxefi" if self.entry.is_some() => {
                let (args, closed) = command_args(&tokens[1..]);
                if let Some(entry) = self.entry.as_mut() {
                    if let Some(path) = args.first() {
                        entry.kernel = Some(path.clone());
                        entry.cmdline = args[1..].join(" ");
                    }
                }
                if closed {
                    self.close_brace(out);
                }
            }
            "initrd" | "initrd16" | "initrdefi" if self.entry.is_some() => {
                let (args, closed) = command_args(&tokens[1..]);
                if let Some(entry) = self.entry.as_mut() {
                    entry.initrds.extend(args.iter().cloned());
                }
                if closed {
                    self.close_brace(out);
                }
            }
            "chainloader" if self.entry.is_some() => {
                let (args, closed) = command_args(&tokens[1..]);
                if let Some(entry) = self.entry.as_mut() {
                    if let Some(path) = args.first() {
                        entry.efi = Some(path.clone());
                    }
                }
                if closed {
                    self.close_brace(out);
                }
            }
            "search" => {
                // Whatever the search would have found, we boot from the
                // partition being scanned.
                for token in tokens {
                    if let Some(var) = token.strip_prefix("--set=") {
                        self.vars.set(var, "");
                    }
                }
                if let Some(pos) = tokens.iter().position(|t| t == "--set") {
                    if let Some(var) = tokens.get(pos + 1) {
                        self.vars.set(var, "");
                    }
                }
            }
            "}" => {
                self.close_brace(out);
                if tokens.len() > 1 {
                    self.process_tokens(&tokens[1..], out);
                }
            }
            _ => {
                // Unknown command: ignore it, but keep the brace
                // bookkeeping honest for single-line bodies.
                if let Some(pos) = tokens.iter().position(|t| t == "}") {
                    self.close_brace(out);
                    if pos + 1 < tokens.len() {
                        self.process_tokens(&tokens[pos + 1..], out);
                    }
                }
            }
        }
    }

    /// Pushes the closer matching a scripting keyword.
    fn enter_skip(&mut self, keyword: &str) {
        match keyword {
            "if" => self.skip.push("fi"),
            "for" | "while" | "until" => self.skip.push("done"),
            "case" => self.skip.push("esac"),
            "function" => {
                self.skip.push("}");
                self.swallow_brace = true;
            }
            _ => {}
        }
    }

    /// Consumes tokens while in skip mode; returns the index just past
    /// the token that emptied the stack, or `tokens.len()`.
    fn scan_skip(&mut self, tokens: &[String]) -> usize {
        for (i, token) in tokens.iter().enumerate() {
            let token = token.as_str();

            if Some(&token) == self.skip.last() {
                self.skip.pop();
                if self.skip.is_empty() {
                    return i + 1;
                }
                continue;
            }

            match token {
                "if" => self.skip.push("fi"),
                "for" | "while" | "until" => self.skip.push("done"),
                "case" => self.skip.push("esac"),
                "{" => {
                    if self.swallow_brace {
                        // The function body brace matches the closer we
                        // already pushed.
                        self.swallow_brace = false;
                    } else {
                        self.skip.push("}");
                    }
                }
                _ => {}
            }
        }

        tokens.len()
    }

    /// `set NAME=VAL`, with the menu-control names intercepted.
    fn handle_set(&mut self, assignment: &str) {
        let Some((name, value)) = assignment.split_once('=') else {
            return;
        };

        match name {
            "default" => self.wanted_default = Some(String::from(value)),
            "timeout" => self.timeout = value.parse::<u32>().ok(),
            _ => {}
        }
        self.vars.set(name, value);
    }

    /// One `}` closed: either an entry boundary or submenu scaffolding.
    fn close_brace(&mut self, out: &mut BootTargetList) {
        self.depth = self.depth.saturating_sub(1);
        self.commit_entry(out);
    }

    /// Expands and commits the pending entry, if it describes a boot.
    fn commit_entry(&mut self, out: &mut BootTargetList) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        if entry.kernel.is_none() && entry.efi.is_none() {
            debug!(target: "grub", "dropping menuentry '{}': nothing bootable", entry.title);
            return;
        }

        let mut target = BootTarget::new(self.device, ConfigType::Grub, self.config_path);
        target.title = entry.title;

        if let Some(efi) = entry.efi {
            target.is_chainload = true;
            target.efi_path = to_vfs_path(&self.vars.expand(&efi, MAX_PATH));
        }
        if let Some(kernel) = entry.kernel {
            target.kernel_path = to_vfs_path(&self.vars.expand(&kernel, MAX_PATH));
            target.cmdline = self.vars.expand(&entry.cmdline, MAX_CMDLINE);
            target.initrd_paths = entry
                .initrds
                .iter()
                .map(|p| to_vfs_path(&self.vars.expand(p, MAX_PATH)))
                .collect();
        }

        let index = out.len();
        if out.push(target) {
            self.committed.push(index);
        }
    }

    /// Applies `set default=` after all entries are collected.
    fn apply_default(&mut self, out: &mut BootTargetList) {
        let Some(wanted) = self.wanted_default.take() else {
            return;
        };
        if out.default_index().is_some() {
            return;
        }

        let position = if let Ok(ordinal) = wanted.parse::<usize>() {
            self.committed.get(ordinal).copied()
        } else {
            self.committed
                .iter()
                .copied()
                .find(|&i| out.get(i).is_some_and(|t| t.title == wanted))
        };

        if let Some(index) = position {
            out.set_default(index);
        }
    }
}

/// Collects command arguments up to a closing brace.
///
/// Returns the arguments and whether a `}` terminated the command on the
/// same line.
fn command_args(tokens: &[String]) -> (&[String], bool) {
    match tokens.iter().position(|t| t == "}") {
        Some(pos) => (&tokens[..pos], true),
        None => (tokens, false),
    }
}

/// Splits a line into tokens: whitespace and `;` separate, single or
/// double quotes group, `#` starts a comment.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted_token = false;

    for ch in line.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    quoted_token = true;
                }
                '#' => break,
                c if c.is_whitespace() || c == ';' => {
                    if !current.is_empty() || quoted_token {
                        tokens.push(core::mem::take(&mut current));
                    }
                    quoted_token = false;
                }
                c => current.push(c),
            },
        }
    }

    if !current.is_empty() || quoted_token {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_handle;
    use proptest::prelude::*;

    fn parse_str(config: &str) -> BootTargetList {
        let mut out = BootTargetList::new();
        parse(config.as_bytes(), test_handle(), "\\boot\\grub\\grub.cfg", &mut out).unwrap();
        out
    }

    #[test]
    fn menuentry_with_variables() {
        let out = parse_str(
            "set root=(hd0,1)\n\
             set kver=6.6\n\
             menuentry 'Linux' {\n\
             \tlinux /vmlinuz-$kver ro quiet\n\
             \tinitrd /initrd-$kver.img\n\
             }\n",
        );

        assert_eq!(out.len(), 1);
        let target = out.get(0).unwrap();
        assert_eq!(target.title, "Linux");
        assert_eq!(target.kernel_path, "\\vmlinuz-6.6");
        assert_eq!(target.initrd_paths, ["\\initrd-6.6.img"]);
        assert_eq!(target.cmdline, "ro quiet");
        assert!(!target.is_chainload);
    }

    #[test]
    fn if_blocks_are_skipped() {
        let out = parse_str(
            "if [ -f /foo ]; then menuentry 'A' { linux /a } fi\n\
             menuentry 'B' {\n\
             \tlinux /b\n\
             }\n",
        );

        assert_eq!(out.len(), 1);
        let target = out.get(0).unwrap();
        assert_eq!(target.title, "B");
        assert_eq!(target.kernel_path, "\\b");
    }

    #[test]
    fn function_bodies_are_skipped() {
        let out = parse_str(
            "function load_video {\n\
             \tinsmod all_video\n\
             }\n\
             menuentry 'Real' {\n\
             \tlinux /vmlinuz\n\
             }\n",
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out.get(0).unwrap().title, "Real");
    }

    #[test]
    fn device_prefixes_are_stripped() {
        let out = parse_str("menuentry 'X' {\n linux (hd0,gpt2)/boot/vmlinuz root=/dev/sda2\n}\n");
        assert_eq!(out.get(0).unwrap().kernel_path, "\\boot\\vmlinuz");
    }

    #[test]
    fn search_set_resolves_to_scanned_partition() {
        let out = parse_str(
            "search --no-floppy --fs-uuid --set=root 1234-ABCD\n\
             menuentry 'U' {\n\
             \tlinux ($root)/vmlinuz quiet\n\
             }\n",
        );
        assert_eq!(out.get(0).unwrap().kernel_path, "\\vmlinuz");
    }

    #[test]
    fn chainloader_entries() {
        let out = parse_str(
            "menuentry 'Windows' {\n\
             \tchainloader /EFI/Microsoft/Boot/bootmgfw.efi\n\
             }\n",
        );
        let target = out.get(0).unwrap();
        assert!(target.is_chainload);
        assert_eq!(target.efi_path, "\\EFI\\Microsoft\\Boot\\bootmgfw.efi");
    }

    #[test]
    fn entries_without_payload_are_discarded() {
        let out = parse_str("menuentry 'Memtest shim' {\n\techo hello\n}\n");
        assert!(out.is_empty());
    }

    #[test]
    fn default_by_name_and_index() {
        let config = "set default=\"Second\"\n\
                      menuentry 'First' { linux /a }\n\
                      menuentry 'Second' { linux /b }\n";
        let out = parse_str(config);
        assert_eq!(out.default_index(), Some(1));

        let config = "set default=1\n\
                      menuentry 'First' { linux /a }\n\
                      menuentry 'Second' { linux /b }\n";
        let out = parse_str(config);
        assert_eq!(out.default_index(), Some(1));
    }

    #[test]
    fn multiple_initrds_accumulate() {
        let out = parse_str(
            "menuentry 'M' {\n\
             \tlinux /vmlinuz\n\
             \tinitrd /intel-ucode.img /initramfs.img\n\
             }\n",
        );
        assert_eq!(
            out.get(0).unwrap().initrd_paths,
            ["\\intel-ucode.img", "\\initramfs.img"]
        );
    }

    #[test]
    fn submenu_headers_do_not_leak_entries() {
        let out = parse_str(
            "submenu 'Advanced options' {\n\
             \tmenuentry 'Fallback' {\n\
             \t\tlinux /vmlinuz-fallback\n\
             \t}\n\
             }\n\
             menuentry 'Main' { linux /vmlinuz }\n",
        );

        let titles: alloc::vec::Vec<&str> =
            out.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["Fallback", "Main"]);
    }

    #[test]
    fn expand_is_bounded_and_total() {
        let mut vars = VarTable::new();
        vars.set("long", &"y".repeat(400));
        let out = vars.expand("$long$long", 512);
        assert!(out.len() < 512);
    }

    #[test]
    fn unknown_variables_expand_to_empty() {
        let vars = VarTable::new();
        assert_eq!(vars.expand("/vmlinuz-${missing}.img", 512), "/vmlinuz-.img");
        assert_eq!(vars.expand("a $ b", 64), "a $ b");
    }

    #[test]
    fn latest_write_wins() {
        let mut vars = VarTable::new();
        vars.set("root", "hd0");
        vars.set("root", "hd1");
        assert_eq!(vars.get("root"), "hd1");
    }

    proptest! {
        #[test]
        fn never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let mut out = BootTargetList::new();
            let _ = parse(&bytes, test_handle(), "\\grub.cfg", &mut out);
        }

        #[test]
        fn expansion_idempotent_without_dollar(s in "[^$]{0,256}") {
            let vars = VarTable::new();
            let once = vars.expand(&s, MAX_CMDLINE);
            let twice = vars.expand(&once, MAX_CMDLINE);
            prop_assert_eq!(once, twice);
        }
    }
}

//! Linux kernel headers for the x86 boot protocol.

use bitflags::bitflags;
use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::errors::{BootError, BootResult};

/// Offset of the [`SetupHeader`] in the kernel image.
pub const SETUP_HDR_OFFSET: usize = 0x01F1;

/// "HdrS", the setup header magic signature.
pub const SETUP_HDR_MAGIC: u32 = 0x5372_6448;

/// Smallest image that can carry a usable setup header.
pub const MIN_KERNEL_SIZE: usize = 0x260;

/// Protocol version that introduced the EFI handover entry point.
pub const HANDOVER_MIN_VERSION: u16 = 0x020B;

/// Offset of the 64-bit entry point within the protected-mode code.
pub const STARTUP_64_OFFSET: u64 = 0x200;

bitflags! {
    /// Boot protocol option flags (`loadflags`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct LoadFlags: u8 {
        /// Protected-mode code loads at 0x100000 rather than 0x10000.
        const LOADED_HIGH = 1 << 0;

        /// KASLR is enabled.
        const KASLR = 1 << 1;

        /// Suppress early kernel messages.
        const QUIET = 1 << 5;

        /// Do not reload the segment registers at the 32-bit entry.
        const KEEP_SEGMENTS = 1 << 6;

        /// `heap_end_ptr` carries a valid value.
        const CAN_USE_HEAP = 1 << 7;
    }
}

bitflags! {
    /// Extended boot protocol option flags (`xloadflags`).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct XLoadFlags: u16 {
        /// The kernel has the legacy 64-bit entry point at 0x200.
        const KERNEL_64 = 1 << 0;

        /// Kernel, boot_params, cmdline and ramdisk may live above 4 GiB.
        const CAN_BE_LOADED_ABOVE_4G = 1 << 1;

        /// 32-bit EFI handoff entry point at `handover_offset`.
        const EFI_HANDOVER_32 = 1 << 2;

        /// 64-bit EFI handoff entry point at `handover_offset + 0x200`.
        const EFI_HANDOVER_64 = 1 << 3;

        const EFI_KEXEC = 1 << 4;
    }
}

/// Kernel attributes, used by the Linux kernel during its setup.
///
/// Sits at byte [`SETUP_HDR_OFFSET`] of a bzImage; the same bytes are
/// copied verbatim into the zero page at handoff.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SetupHeader {
    /// Size of the setup code, in 512-byte sectors.
    ///
    /// The real-mode code consists of the boot sector plus the setup code.
    pub setup_sects: u8,

    /// If set, root is mounted read-only (deprecated, use `ro`/`rw`).
    pub root_flags: u16,

    /// Size of the 32-bit code in 16-byte paragraphs.
    pub syssize: u32,

    /// Do not use.
    pub ram_size: u16,

    /// Video mode control.
    pub vid_mode: u16,

    /// Default root device number (deprecated, use `root=`).
    pub root_dev: u16,

    /// 0xAA55 magic number.
    pub boot_flag: u16,

    /// x86 JMP instruction.
    pub jump: u16,

    /// Magic signature, should be "HdrS".
    pub header: u32,

    /// Boot protocol version supported, `major << 8 | minor`.
    pub version: u16,

    /// Boot loader hook.
    pub realmode_swtch: u32,

    /// Load-low segment (obsolete).
    pub start_sys_seg: u16,

    /// Pointer to the kernel version string, less 0x200.
    pub kernel_version: u16,

    /// Bootloader identifier. 0xFF means unregistered.
    pub type_of_loader: u8,

    /// Boot protocol option flags, see [`LoadFlags`].
    pub loadflags: u8,

    /// Move to high memory size.
    pub setup_move_size: u16,

    /// Address to jump to in protected mode.
    pub code32_start: u32,

    /// initrd load address.
    pub ramdisk_image: u32,

    /// initrd size.
    pub ramdisk_size: u32,

    /// Do not use.
    pub bootsect_kludge: u32,

    /// Offset, from the start of the real-mode code, of the end of the
    /// setup stack/heap, minus 0x200.
    pub heap_end_ptr: u16,

    /// Extended bootloader version.
    pub ext_loader_ver: u8,

    /// Extended bootloader ID.
    pub ext_loader_type: u8,

    /// 32-bit pointer to the kernel command line.
    pub cmd_line_ptr: u32,

    /// Highest legal initrd address.
    pub initrd_addr_max: u32,

    /// Physical address alignment required for the kernel.
    pub kernel_alignment: u32,

    /// Non-zero when the kernel may be loaded at any address satisfying
    /// `kernel_alignment`; `code32_start` must then point at the loaded
    /// code.
    pub relocatable_kernel: u8,

    /// Minimum alignment, as a power of two.
    pub min_alignment: u8,

    /// Extended boot protocol option flags, see [`XLoadFlags`].
    pub xloadflags: u16,

    /// Maximum size of the kernel command line.
    pub cmdline_size: u32,

    /// Hardware subarchitecture (for paravirtualized environments).
    pub hardware_subarch: u32,

    /// Subarchitecture-specific data.
    pub hardware_subarch_data: u64,

    /// Offset of the (possibly compressed) kernel payload.
    pub payload_offset: u32,

    /// Length of the kernel payload.
    pub payload_length: u32,

    /// 64-bit pointer to a linked list of `setup_data` structures.
    pub setup_data: u64,

    /// Preferred load address.
    pub pref_address: u64,

    /// Memory the kernel needs while relocating/decompressing itself.
    pub init_size: u32,

    /// Offset of the EFI handover entry point, 0 when absent.
    pub handover_offset: u32,

    /// Offset of the kernel_info structure.
    pub kernel_info_offset: u32,
}

/// Size of the decoded header span, 0x1F1 through 0x26C.
pub const SETUP_HDR_SIZE: usize = core::mem::size_of::<SetupHeader>();

const _: () = assert!(SETUP_HDR_SIZE == 0x26C - SETUP_HDR_OFFSET);

impl SetupHeader {
    /// Decodes the header out of a raw kernel image.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when the image is too small or the "HdrS" magic
    /// is absent.
    pub fn from_image(image: &[u8]) -> BootResult<Self> {
        if image.len() < MIN_KERNEL_SIZE {
            return Err(BootError::InvalidParameter);
        }

        // Images are always large enough in practice, but the header span
        // runs a few bytes past the minimum size check; zero-fill the tail
        // rather than over-read.
        let avail = usize::min(SETUP_HDR_SIZE, image.len() - SETUP_HDR_OFFSET);
        let mut raw = [0u8; SETUP_HDR_SIZE];
        raw[..avail].copy_from_slice(&image[SETUP_HDR_OFFSET..SETUP_HDR_OFFSET + avail]);

        let header: Self = pod_read_unaligned(&raw);
        if header.header != SETUP_HDR_MAGIC {
            return Err(BootError::InvalidParameter);
        }

        Ok(header)
    }

    /// Bytes occupied by the boot sector plus setup code in the image.
    ///
    /// A `setup_sects` of 0 means 4, for historical reasons.
    pub fn setup_size(&self) -> usize {
        let sects = if self.setup_sects == 0 {
            4
        } else {
            usize::from(self.setup_sects)
        };
        (sects + 1) * 512
    }

    pub fn load_flags(&self) -> LoadFlags {
        LoadFlags::from_bits_truncate(self.loadflags)
    }

    pub fn xload_flags(&self) -> XLoadFlags {
        XLoadFlags::from_bits_truncate(self.xloadflags)
    }

    /// Whether the image advertises the EFI handover entry point.
    pub fn supports_handover(&self) -> bool {
        self.version >= HANDOVER_MIN_VERSION && self.handover_offset != 0
    }

    /// Preferred protected-mode load address, with the historical default
    /// applied.
    pub fn preferred_address(&self) -> u64 {
        if self.pref_address != 0 {
            self.pref_address
        } else {
            0x10_0000
        }
    }
}

/// Byte offset of `e820_entries` in the zero page.
const BP_E820_ENTRIES: usize = 0x1E8;

/// Byte offset of the E820 table in the zero page.
const BP_E820_TABLE: usize = 0x2D0;

/// Entries the zero-page E820 table can hold.
pub const E820_MAX_ENTRIES: usize = 128;

/// One E820 memory-range descriptor as the kernel expects it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    /// 1 usable RAM, 2 reserved, 3 ACPI reclaim, 4 ACPI NVS.
    pub typ: u32,
}

const _: () = assert!(core::mem::size_of::<E820Entry>() == 20);

/// The boot_params "zero page" handed to the kernel.
///
/// Exactly 4096 bytes. The setup header lives at [`SETUP_HDR_OFFSET`],
/// the E820 table at 0x2D0 with its entry count at 0x1E8; everything else
/// stays zero.
#[repr(C, align(4096))]
pub struct BootParams {
    bytes: [u8; 4096],
}

const _: () = assert!(core::mem::size_of::<BootParams>() == 4096);

impl BootParams {
    pub fn zeroed() -> Self {
        Self { bytes: [0; 4096] }
    }

    /// Copies `header` into the zero page.
    pub fn set_header(&mut self, header: &SetupHeader) {
        self.bytes[SETUP_HDR_OFFSET..SETUP_HDR_OFFSET + SETUP_HDR_SIZE]
            .copy_from_slice(bytes_of(header));
    }

    /// Reads the header back out of the zero page.
    pub fn header(&self) -> SetupHeader {
        pod_read_unaligned(&self.bytes[SETUP_HDR_OFFSET..SETUP_HDR_OFFSET + SETUP_HDR_SIZE])
    }

    /// Writes the E820 table and its entry count.
    ///
    /// Entries past [`E820_MAX_ENTRIES`] are dropped; callers merge
    /// adjacent ranges first, which keeps real maps far below the cap.
    pub fn set_e820(&mut self, entries: &[E820Entry]) {
        let count = usize::min(entries.len(), E820_MAX_ENTRIES);
        self.bytes[BP_E820_ENTRIES] = count as u8;

        let mut offset = BP_E820_TABLE;
        for entry in &entries[..count] {
            self.bytes[offset..offset + core::mem::size_of::<E820Entry>()]
                .copy_from_slice(bytes_of(entry));
            offset += core::mem::size_of::<E820Entry>();
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut Self {
        self as *mut Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn minimal_image() -> alloc::vec::Vec<u8> {
        let mut image = vec![0u8; 0x5000];
        image[0x1F1] = 8; // setup_sects
        image[0x1FE..0x200].copy_from_slice(&0xAA55u16.to_le_bytes());
        image[0x202..0x206].copy_from_slice(&SETUP_HDR_MAGIC.to_le_bytes());
        image[0x206..0x208].copy_from_slice(&0x020Fu16.to_le_bytes());
        image[0x264..0x268].copy_from_slice(&0x190u32.to_le_bytes());
        image
    }

    #[test]
    fn decodes_and_sizes_the_setup_code() {
        let header = SetupHeader::from_image(&minimal_image()).unwrap();
        assert_eq!(header.setup_sects, 8);
        assert_eq!(header.setup_size(), 9 * 512);
        assert!(header.supports_handover());
    }

    #[test]
    fn zero_setup_sects_means_four() {
        let mut image = minimal_image();
        image[0x1F1] = 0;
        let header = SetupHeader::from_image(&image).unwrap();
        assert_eq!(header.setup_size(), 5 * 512);
    }

    #[test]
    fn rejects_short_or_unsigned_images() {
        assert!(matches!(
            SetupHeader::from_image(&[0u8; 0x100]).err(),
            Some(BootError::InvalidParameter)
        ));

        let mut image = minimal_image();
        image[0x202] = 0; // break the magic
        assert!(matches!(
            SetupHeader::from_image(&image).err(),
            Some(BootError::InvalidParameter)
        ));
    }

    #[test]
    fn header_round_trips_through_boot_params() {
        let mut header = SetupHeader::from_image(&minimal_image()).unwrap();
        header.type_of_loader = 0xFF;
        header.cmd_line_ptr = 0xDEAD_0000;
        header.ramdisk_image = 0x100_0000;
        header.ramdisk_size = 0x42;

        let mut params = BootParams::zeroed();
        params.set_header(&header);
        let read_back = params.header();

        assert_eq!(bytes_of(&header), bytes_of(&read_back));
    }

    #[test]
    fn e820_lands_at_the_documented_offsets() {
        let mut params = BootParams::zeroed();
        params.set_e820(&[
            E820Entry {
                addr: 0,
                size: 0x2000,
                typ: 1,
            },
            E820Entry {
                addr: 0x2000,
                size: 0x1000,
                typ: 3,
            },
        ]);

        assert_eq!(params.bytes[0x1E8], 2);
        assert_eq!(&params.bytes[0x2D0..0x2D8], &0u64.to_le_bytes());
        assert_eq!(&params.bytes[0x2D8..0x2E0], &0x2000u64.to_le_bytes());
        assert_eq!(&params.bytes[0x2E0..0x2E4], &1u32.to_le_bytes());
        assert_eq!(&params.bytes[0x2E4..0x2EC], &0x2000u64.to_le_bytes());
    }

    #[test]
    fn preferred_address_defaults_to_one_megabyte() {
        let header = SetupHeader::from_image(&minimal_image()).unwrap();
        assert_eq!(header.preferred_address(), 0x10_0000);
    }
}

//! Linux boot engine.
//!
//! Implements the x86 boot protocol in two flavors. The EFI handover path
//! (protocol 2.11+) jumps into the kernel's EFI stub with boot services
//! still running; the stub exits them itself. The legacy path loads the
//! protected-mode code at its preferred address, exits boot services here,
//! synthesizes the E820 table from the final memory map, and jumps to the
//! kernel's 64-bit entry point.
//!
//! Past `ExitBootServices` there is no allocation, no firmware call and no
//! logging; the last thing this module does on that path is the jump.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ffi::c_void;

use log::{debug, info, warn};
use uefi::boot::{self, AllocateType};
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType};
use uefi::Status;

use crate::config::BootTarget;
use crate::errors::{BootError, BootResult};
use crate::fs::vfs::Vfs;

pub mod e820;
pub mod headers;

use headers::{
    BootParams, E820Entry, LoadFlags, SetupHeader, XLoadFlags, E820_MAX_ENTRIES,
    STARTUP_64_OFFSET,
};

const PAGE_SIZE: usize = 4096;
const FOUR_GIB: u64 = 0x1_0000_0000;

/// End of the setup heap handed to the kernel, less 0x200.
const HEAP_END_PTR: u16 = 0xFE00;

/// `type_of_loader` id for an unregistered bootloader.
const LOADER_ID_UNREGISTERED: u8 = 0xFF;

/// Extra descriptors of slack when sizing the memory-map buffer: the
/// allocation below may split a region, and the map must still fit on the
/// retry fetch where no allocation is permitted.
const MAP_SLACK_DESCRIPTORS: usize = 4;

fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Boots a Linux kernel described by `target`.
///
/// Does not return on success. An `Err` means the machine is still in
/// boot services and the menu can be re-entered.
pub fn boot_linux(vfs: &mut Vfs, target: &BootTarget) -> BootResult<()> {
    info!(target: "linux", "loading kernel {}", target.kernel_path);
    let kernel_file = vfs.read_file(target.device, &target.kernel_path)?;
    let kernel = kernel_file.bytes();

    let header = SetupHeader::from_image(kernel)?;
    let setup_size = header.setup_size();
    if kernel.len() <= setup_size {
        return Err(BootError::InvalidParameter);
    }

    let version = header.version;
    debug!(
        target: "linux",
        "boot protocol {version:#06x}, setup {setup_size} bytes, handover {}",
        header.supports_handover()
    );

    let initrd = load_initrds(vfs, target, &header)?;

    let mut hdr = header;
    hdr.type_of_loader = LOADER_ID_UNREGISTERED;
    hdr.loadflags = (header.load_flags() | LoadFlags::CAN_USE_HEAP).bits();
    hdr.heap_end_ptr = HEAP_END_PTR;
    hdr.cmd_line_ptr = cmdline_to_pool(&target.cmdline)?;

    if let Some((addr, size)) = initrd {
        if addr + size > FOUR_GIB {
            warn!(target: "linux", "initrd landed above 4 GiB, older kernels will not see it");
        }
        hdr.ramdisk_image = addr as u32;
        hdr.ramdisk_size = size as u32;
    }

    let mut params = Box::new(BootParams::zeroed());

    if header.supports_handover() {
        match handover_boot(kernel, &hdr, setup_size, &mut params) {
            Err(BootError::Unsupported) => {
                warn!(target: "linux", "handover path refused, trying legacy path");
            }
            other => return other,
        }
    }

    legacy_boot(kernel, &hdr, setup_size, &mut params)
}

/// Loads all initrd files into one contiguous physical region.
///
/// Returns `(address, total_size)`, or `None` when the target carries no
/// initrd (or none of them could be read). A file that fails to read is
/// skipped with a warning; the kernel may still boot with a partial
/// initrd.
fn load_initrds(
    vfs: &mut Vfs,
    target: &BootTarget,
    header: &SetupHeader,
) -> BootResult<Option<(u64, u64)>> {
    if target.initrd_paths.is_empty() {
        return Ok(None);
    }

    let mut files = Vec::new();
    for path in &target.initrd_paths {
        match vfs.read_file(target.device, path) {
            Ok(content) => files.push(content),
            Err(err) => warn!(target: "linux", "skipping initrd {path}: {err}"),
        }
    }

    let total: usize = files.iter().map(|f| f.len()).sum();
    if total == 0 {
        return Ok(None);
    }

    // The classic ramdisk fields are 32-bit; respect the header's own
    // ceiling when it announces one.
    let initrd_addr_max = header.initrd_addr_max;
    let limit = if initrd_addr_max != 0 {
        u64::min(u64::from(initrd_addr_max), FOUR_GIB - 1)
    } else {
        FOUR_GIB - 1
    };

    let pages = pages_for(total);
    let region = boot::allocate_pages(
        AllocateType::MaxAddress(limit),
        MemoryType::LOADER_DATA,
        pages,
    )
    .or_else(|_| boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages))?;

    let mut offset = 0usize;
    for file in &files {
        // Safety: the region covers the sum of all file sizes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                file.bytes().as_ptr(),
                region.as_ptr().add(offset),
                file.len(),
            );
        }
        offset += file.len();
    }

    info!(
        target: "linux",
        "initrd: {} file(s), {total} bytes at {:#x}",
        files.len(),
        region.as_ptr() as u64
    );
    Ok(Some((region.as_ptr() as u64, total as u64)))
}

/// Copies the command line into a fresh pool buffer, NUL-terminated, and
/// returns its 32-bit address. The buffer is handed to the kernel via
/// `cmd_line_ptr` and never freed.
fn cmdline_to_pool(cmdline: &str) -> BootResult<u32> {
    let bytes = cmdline.as_bytes();
    let buffer = boot::allocate_pool(MemoryType::LOADER_DATA, bytes.len() + 1)?;

    // Safety: the allocation is bytes.len() + 1 long.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_ptr(), bytes.len());
        buffer.as_ptr().add(bytes.len()).write(0);
    }

    u32::try_from(buffer.as_ptr() as u64).map_err(|_| {
        // Safety: just allocated, not yet shared anywhere.
        unsafe {
            let _ = boot::free_pool(buffer);
        }
        BootError::OutOfResources
    })
}

/// The EFI handover path: enter the kernel's EFI stub with boot services
/// still running and `(image_handle, system_table, boot_params)` as
/// arguments.
///
/// # Errors
///
/// `Unsupported` when the image does not flag the 64-bit handover entry
/// (the caller then falls through to the legacy path); `LoadError` when
/// the stub came back, which it never does on success.
fn handover_boot(
    kernel: &[u8],
    hdr: &SetupHeader,
    setup_size: usize,
    params: &mut BootParams,
) -> BootResult<()> {
    if !hdr.xload_flags().contains(XLoadFlags::EFI_HANDOVER_64) {
        return Err(BootError::Unsupported);
    }

    // The stub relocates the kernel itself; it only needs the raw image
    // in executable memory.
    let pages = pages_for(kernel.len());
    let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_CODE, pages)?;
    // Safety: freshly allocated region of kernel.len() rounded up.
    unsafe {
        core::ptr::copy_nonoverlapping(kernel.as_ptr(), base.as_ptr(), kernel.len());
    }

    params.set_header(hdr);

    let handover_offset = hdr.handover_offset;
    let entry = base.as_ptr() as u64
        + setup_size as u64
        + u64::from(handover_offset)
        + STARTUP_64_OFFSET;
    info!(target: "linux", "EFI handover entry at {entry:#x}");

    let image = boot::image_handle().as_ptr();
    let system_table = uefi::table::system_table_raw()
        .ok_or(BootError::Aborted)?
        .as_ptr()
        .cast::<c_void>();

    type HandoverFn = unsafe extern "efiapi" fn(*mut c_void, *mut c_void, *mut BootParams);
    // Safety: entry points into the image copy at the documented handover
    // offset; the stub follows the EFI calling convention.
    let status = unsafe {
        let func: HandoverFn = core::mem::transmute(entry as usize);
        func(image, system_table, params as *mut BootParams);
        Status::LOAD_ERROR
    };

    // Reaching this line means the stub gave up and returned.
    warn!(target: "linux", "EFI handover returned ({status})");
    // Safety: the pages are ours again now that the stub is not running.
    unsafe {
        let _ = boot::free_pages(base, pages);
    }
    Err(BootError::LoadError)
}

/// The legacy bzImage path: place the protected-mode code, exit boot
/// services with a synthesized E820 map, and jump to the 64-bit entry.
fn legacy_boot(
    kernel: &[u8],
    hdr: &SetupHeader,
    setup_size: usize,
    params: &mut BootParams,
) -> BootResult<()> {
    // Entering startup_32 would need a drop to protected mode; 64-bit
    // entry only.
    if !hdr.xload_flags().contains(XLoadFlags::KERNEL_64) {
        return Err(BootError::Unsupported);
    }

    let prot_mode = &kernel[setup_size..];
    // The kernel decompresses in place and needs init_size, not just the
    // image bytes.
    let init_size = hdr.init_size;
    let need = usize::max(prot_mode.len(), init_size as usize);
    let pages = pages_for(need);

    let dest = match boot::allocate_pages(
        AllocateType::Address(hdr.preferred_address()),
        MemoryType::LOADER_CODE,
        pages,
    ) {
        Ok(dest) => dest,
        Err(err) => {
            if hdr.relocatable_kernel == 0 {
                return Err(err.into());
            }
            // code32_start is 32-bit, so "anywhere" still means below 4 GiB.
            boot::allocate_pages(
                AllocateType::MaxAddress(FOUR_GIB - 1),
                MemoryType::LOADER_CODE,
                pages,
            )?
        }
    };

    // Safety: dest spans `need >= prot_mode.len()` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(prot_mode.as_ptr(), dest.as_ptr(), prot_mode.len());
    }

    let mut hdr = *hdr;
    hdr.code32_start = dest.as_ptr() as u32;
    params.set_header(&hdr);

    let entry = dest.as_ptr() as u64 + STARTUP_64_OFFSET;
    info!(target: "linux", "legacy entry at {entry:#x}, exiting boot services");

    exit_boot_services_with_e820(params)?;

    // Point of no return: boot services are gone.
    // Safety: entry is the kernel's 64-bit entry point and params is the
    // populated zero page.
    unsafe { jump_to_kernel(entry, params as *mut BootParams) }
}

/// Fetches the final memory map, converts it to E820 into `params`, and
/// calls `ExitBootServices`.
///
/// The buffer is allocated once, with slack, before the final fetch; from
/// there to the exit call nothing allocates. A stale map key is retried
/// exactly once by re-fetching into the same buffer. On success the
/// buffer is intentionally left behind: it lives in memory the kernel now
/// owns.
fn exit_boot_services_with_e820(params: &mut BootParams) -> BootResult<()> {
    let system_table = uefi::table::system_table_raw().ok_or(BootError::Aborted)?;
    // Safety: the firmware's system table pointer is valid while boot
    // services exist.
    let bs = unsafe { (*system_table.as_ptr()).boot_services };
    if bs.is_null() {
        return Err(BootError::Aborted);
    }
    let (get_memory_map, exit_boot_services) =
        // Safety: boot services table is live pre-exit.
        unsafe { ((*bs).get_memory_map, (*bs).exit_boot_services) };

    let mut map_size = 0usize;
    let mut map_key = 0usize;
    let mut desc_size = 0usize;
    let mut desc_version = 0u32;

    // Safety: size-probe call with a null buffer, per the UEFI spec.
    let status = unsafe {
        get_memory_map(
            &mut map_size,
            core::ptr::null_mut(),
            &mut map_key,
            &mut desc_size,
            &mut desc_version,
        )
    };
    if status != Status::BUFFER_TOO_SMALL || desc_size == 0 {
        return Err(BootError::from(status));
    }

    let buffer_size = map_size + MAP_SLACK_DESCRIPTORS * desc_size;
    let buffer = boot::allocate_pool(MemoryType::LOADER_DATA, buffer_size)?;
    let image = boot::image_handle().as_ptr();

    let mut retried = false;
    loop {
        let mut size = buffer_size;
        // Safety: buffer spans buffer_size bytes.
        let status = unsafe {
            get_memory_map(
                &mut size,
                buffer.as_ptr().cast::<MemoryDescriptor>(),
                &mut map_key,
                &mut desc_size,
                &mut desc_version,
            )
        };
        if !status.is_success() {
            // Safety: allocated above, still in boot services.
            unsafe {
                let _ = boot::free_pool(buffer);
            }
            return Err(BootError::from(status));
        }

        fill_e820(params, buffer.as_ptr(), size, desc_size);

        // Safety: map_key is from the fetch just above; on success this
        // terminates boot services.
        let status = unsafe { exit_boot_services(image, map_key) };
        if status.is_success() {
            return Ok(());
        }

        if retried {
            // Still inside boot services; clean up and report.
            // Safety: as above.
            unsafe {
                let _ = boot::free_pool(buffer);
            }
            return Err(BootError::from(status));
        }
        // The exit call itself invalidated nothing we can't redo: re-fetch
        // into the existing buffer (no allocation) and retry once.
        retried = true;
    }
}

/// Converts a raw memory-map buffer into the zero page's E820 table.
fn fill_e820(params: &mut BootParams, buffer: *const u8, map_bytes: usize, desc_size: usize) {
    let count = map_bytes / desc_size;
    // Safety: the firmware wrote `count` descriptors with stride
    // desc_size into the buffer.
    let descriptors = (0..count).map(|i| unsafe {
        core::ptr::read_unaligned(buffer.add(i * desc_size).cast::<MemoryDescriptor>())
    });

    let mut table = [E820Entry::default(); E820_MAX_ENTRIES];
    let entries = e820::build_e820(descriptors, &mut table);
    params.set_e820(&table[..entries]);
}

/// The final jump: 64-bit entry with the zero page in RSI, interrupts
/// off.
#[cfg(target_arch = "x86_64")]
unsafe fn jump_to_kernel(entry: u64, boot_params: *mut BootParams) -> ! {
    // Safety: caller guarantees entry and boot_params; nothing after the
    // jump ever runs.
    unsafe {
        core::arch::asm!(
            "cli",
            "cld",
            "xor ebp, ebp",
            "jmp {entry}",
            entry = in(reg) entry,
            in("rsi") boot_params,
            options(noreturn),
        )
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn jump_to_kernel(_entry: u64, _boot_params: *mut BootParams) -> ! {
    unreachable!("the legacy path only exists on x86_64");
}

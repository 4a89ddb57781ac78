#![no_std]
//! Layout of the structures a multiboot-compliant loader (e.g. GRUB) hands
//! to the kernel's entry point: `eax` holds [`MultibootInfo::BOOTLOADER_MAGIC`]
//! and `ebx` holds a physical pointer to a [`MultibootInfo`]. Field layout
//! matches the Multiboot Specification 0.6.96 exactly so it can be read
//! directly out of the pointer the loader provides, without a translation
//! step.

/// Value the bootloader leaves in `eax` on entry.
pub const BOOTLOADER_MAGIC: u32 = 0x2BADB002;

bitflags::bitflags! {
    /// Bits of [`MultibootInfo::flags`] the kernel inspects.
    #[derive(Copy, Clone, Debug)]
    pub struct InfoFlags: u32 {
        const MEM_INFO   = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE    = 1 << 2;
        const MODS       = 1 << 3;
        const AOUT_SYMS  = 1 << 4;
        const ELF_SHDR   = 1 << 5;
        const MMAP       = 1 << 6;
    }
}

/// The fixed-size header at the front of the multiboot info structure.
/// Only the fields the kernel actually consumes are named individually;
/// the rest of the structure (drives, config table, APM, VBE) is out of
/// scope and left as trailing bytes the kernel never reads.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

impl MultibootInfo {
    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags)
    }

    /// Total installed RAM in KiB, derived from `mem_lower`/`mem_upper`
    /// (only valid when [`InfoFlags::MEM_INFO`] is set).
    pub fn total_mem_kib(&self) -> u64 {
        self.mem_lower as u64 + self.mem_upper as u64
    }
}

/// One entry of the BIOS memory map ([`MultibootInfo::mmap_addr`]). Entries
/// are variable-length on disk (`size` does not include itself); the kernel
/// walks them with `entry.size + 4` as the stride.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MmapEntry {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    pub kind: u32,
}

impl MmapEntry {
    pub const TYPE_AVAILABLE: u32 = 1;
    pub const TYPE_RESERVED: u32 = 2;
    pub const TYPE_ACPI_RECLAIMABLE: u32 = 3;
    pub const TYPE_NVS: u32 = 4;
    pub const TYPE_BADRAM: u32 = 5;

    pub fn is_available(&self) -> bool {
        self.kind == Self::TYPE_AVAILABLE
    }
}

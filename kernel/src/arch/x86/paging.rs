//! Two-level x86 paging: one page directory (1024 PDEs) per address space,
//! each present PDE pointing at a page table (1024 PTEs). The kernel
//! identity-maps physical memory 1:1 into its own virtual address space
//! (`phys_to_virt_ptr` is the identity function), so every frame the
//! allocator hands out is directly addressable without a separate kmap
//! step — the simplification this kernel makes instead of the higher-half
//! direct map a 64-bit kernel would use.

use crate::config::PAGE_SIZE;
use crate::error::KResult;
use crate::pmm;

bitflags::bitflags! {
    #[derive(Copy, Clone)]
    pub struct MapFlags: u32 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
    }
}

const ENTRIES_PER_TABLE: usize = 1024;
const ADDR_MASK: u32 = 0xFFFF_F000;
/// Bytes one PDE covers: one page table's worth of 4 KiB pages.
const BYTES_PER_PDE: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// Physical address and PDE count of the kernel's own page directory, set
/// once by [`init`]. Every other page directory this kernel ever builds
/// shares these entries so kernel code and every task's kernel stack stay
/// mapped no matter which task's directory CR3 currently holds.
static mut KERNEL_PD_PHYS: u32 = 0;
static mut KERNEL_PD_ENTRIES: usize = 0;

/// Physical == virtual for every frame the kernel itself touches.
pub fn phys_to_virt_ptr<T>(phys: u32) -> *mut T {
    phys as *mut T
}

fn table_ptr(phys: u32) -> *mut [u32; ENTRIES_PER_TABLE] {
    phys_to_virt_ptr(phys)
}

fn pd_index(virt: u32) -> usize {
    (virt >> 22) as usize
}

fn pt_index(virt: u32) -> usize {
    ((virt >> 12) & 0x3FF) as usize
}

unsafe fn invlpg(virt: u32) {
    core::arch::asm!("invlpg [{0}]", in(reg) virt, options(nostack, preserves_flags));
}

/// Allocates a fresh, zeroed page directory frame. The returned physical
/// address both is, and addresses, the directory (identity map).
pub fn new_page_directory() -> KResult<u32> {
    let frame = pmm::alloc_frame()?;
    let phys = frame * PAGE_SIZE;
    unsafe {
        (*table_ptr(phys)) = [0u32; ENTRIES_PER_TABLE];
    }
    Ok(phys)
}

/// Installs `size/PAGE_SIZE` contiguous PTEs mapping `virt..virt+size` to
/// `phys..phys+size`, allocating intermediate page tables on demand.
pub fn set_range(pd_phys: u32, virt: u32, phys: u32, size: u32, flags: MapFlags) -> KResult<()> {
    let pages = size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        map_page(pd_phys, virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags)?;
    }
    Ok(())
}

fn map_page(pd_phys: u32, virt: u32, phys: u32, flags: MapFlags) -> KResult<()> {
    let pd = unsafe { &mut *table_ptr(pd_phys) };
    let pdi = pd_index(virt);

    if pd[pdi] & MapFlags::PRESENT.bits() == 0 {
        let pt_frame = pmm::alloc_frame()?;
        let pt_phys = pt_frame * PAGE_SIZE;
        unsafe {
            (*table_ptr(pt_phys)) = [0u32; ENTRIES_PER_TABLE];
        }
        // Propagate USER/WRITABLE up to the directory entry: a PDE's
        // access bits gate every PTE beneath it regardless of the PTE's
        // own bits.
        pd[pdi] = (pt_phys & ADDR_MASK)
            | MapFlags::PRESENT.bits()
            | MapFlags::WRITABLE.bits()
            | MapFlags::USER.bits();
    } else if flags.contains(MapFlags::USER) {
        pd[pdi] |= MapFlags::USER.bits();
    }

    let pt_phys = pd[pdi] & ADDR_MASK;
    let pt = unsafe { &mut *table_ptr(pt_phys) };
    pt[pt_index(virt)] = (phys & ADDR_MASK) | flags.bits() | MapFlags::PRESENT.bits();
    unsafe { invlpg(virt) };
    Ok(())
}

/// Clears `size/PAGE_SIZE` PTEs starting at `virt` and flushes their TLB
/// entries. Leaves now-empty page tables in place; `rm_context` is what
/// reclaims page-table frames, since a table might still hold other live
/// mappings.
pub fn clear_range(pd_phys: u32, virt: u32, size: u32) {
    let pages = size.div_ceil(PAGE_SIZE);
    let pd = unsafe { &mut *table_ptr(pd_phys) };
    for i in 0..pages {
        let v = virt + i * PAGE_SIZE;
        let pdi = pd_index(v);
        if pd[pdi] & MapFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pt_phys = pd[pdi] & ADDR_MASK;
        let pt = unsafe { &mut *table_ptr(pt_phys) };
        pt[pt_index(v)] = 0;
        unsafe { invlpg(v) };
    }
}

/// Walks every populated page table in `pd_phys`, freeing its frame, then
/// frees the directory frame itself. The caller must already have freed
/// any data frames the mappings pointed at (via `vfree`'s
/// `FREE_ON_RELEASE`); this only tears down the translation structure.
pub fn rm_context(pd_phys: u32) {
    let pd = unsafe { &*table_ptr(pd_phys) };
    // Entries below `KERNEL_PD_ENTRIES` were installed by `clone_kernel_entries`
    // and point at page-table frames the kernel directory itself still owns;
    // skip them so tearing down one task's address space never frees memory
    // every other context (and the kernel) is still relying on.
    let shared = unsafe { KERNEL_PD_ENTRIES };
    for (i, entry) in pd.iter().enumerate() {
        if i < shared {
            continue;
        }
        if entry & MapFlags::PRESENT.bits() != 0 {
            let pt_phys = entry & ADDR_MASK;
            pmm::free_frame(pt_phys / PAGE_SIZE);
        }
    }
    pmm::free_frame(pd_phys / PAGE_SIZE);
}

/// Translates a user-mode virtual address, requiring the `USER` bit set
/// at both the PDE and PTE level (mirrors the flag propagation `set_range`
/// performs on the way in).
pub fn translate_user(pd_phys: u32, virt: u32) -> Option<u32> {
    let pd = unsafe { &*table_ptr(pd_phys) };
    let pdi = pd_index(virt);
    let pde = pd[pdi];
    let need = MapFlags::PRESENT.bits() | MapFlags::USER.bits();
    if pde & need != need {
        return None;
    }
    let pt = unsafe { &*table_ptr(pde & ADDR_MASK) };
    let pte = pt[pt_index(virt)];
    if pte & need != need {
        return None;
    }
    Some((pte & ADDR_MASK) | (virt & 0xFFF))
}

/// Loads `pd_phys` into CR3, switching the active address space.
pub fn switch_to(pd_phys: u32) {
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) pd_phys, options(nostack, preserves_flags));
    }
}

/// Enables paging: builds the kernel's own page directory, identity-maps
/// `0..=max_phys_addr_inclusive`, loads CR3, and sets CR0.PG.
pub fn init(max_phys_addr_inclusive: u32) -> u32 {
    let pd_phys = new_page_directory().expect("paging: failed to allocate kernel page directory");
    let mapped_size = max_phys_addr_inclusive + PAGE_SIZE;
    set_range(pd_phys, 0, 0, mapped_size, MapFlags::PRESENT | MapFlags::WRITABLE)
        .expect("paging: failed to identity-map physical memory");

    unsafe {
        core::arch::asm!(
            "mov cr3, {pd}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            pd = in(reg) pd_phys,
            tmp = out(reg) _,
            options(nostack),
        );
    }
    unsafe {
        KERNEL_PD_PHYS = pd_phys;
        KERNEL_PD_ENTRIES = mapped_size.div_ceil(BYTES_PER_PDE) as usize;
    }

    log::info!("paging: identity-mapped 0..{:#x}, kernel page directory at {:#x}", mapped_size, pd_phys);
    pd_phys
}

/// Copies the kernel's low-memory PDEs into `dst_pd_phys`. Every task's page
/// directory calls this once, at creation, so a trap taken while that
/// task's directory is loaded still finds kernel code, data, and its own
/// kernel stack mapped — the underlying page-table frames are shared, not
/// copied, so updates to the kernel's own mappings stay visible everywhere.
pub fn clone_kernel_entries(dst_pd_phys: u32) {
    unsafe {
        let src = &*table_ptr(KERNEL_PD_PHYS);
        let dst = &mut *table_ptr(dst_pd_phys);
        dst[..KERNEL_PD_ENTRIES].copy_from_slice(&src[..KERNEL_PD_ENTRIES]);
    }
}

/// Invoked by the vector-14 fault path. A fault in a user task terminates
/// it; a fault in kernel mode is fatal (mirrors the design's page-fault
/// policy, which exists to surface bugs rather than implement demand
/// paging).
pub fn handle_page_fault(state: &mut super::isr::CpuState) {
    let cr2: u32;
    unsafe {
        core::arch::asm!("mov {0}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }

    if state.cs & 0x3 != 0 {
        crate::task::terminate_current_on_page_fault(cr2, state);
    } else {
        panic!("page fault in kernel mode at address {:#x} (eip={:#x})", cr2, state.eip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pd_and_pt_index_split_virt_correctly() {
        let virt = 0x0040_1000u32; // PD index 1, PT index 1
        assert_eq!(pd_index(virt), 1);
        assert_eq!(pt_index(virt), 1);
    }

    #[test]
    fn addr_mask_strips_flag_bits() {
        let entry = 0x12345 << 12 | 0x7;
        assert_eq!(entry & ADDR_MASK, 0x12345 << 12);
    }
}

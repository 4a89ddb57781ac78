//! Virtual address allocator: per-context VA bitmap plus a list of mapped
//! `Range`s, grounded on the reference `valloc.c`. Each task (and the
//! kernel itself) owns one [`Context`]; `valloc` carves out fresh virtual
//! pages and backs them with physical frames, `vmap` cross-maps pages
//! owned by one context into another (used by `fork`/`exec` and pipe
//! buffer sharing), and `vfree` tears a range back down.
//!
//! Ranges and shards are held in a `Vec`, not an intrusive linked list —
//! unlike the kmalloc free list, a valloc context never has to exist
//! before `kmalloc_ready`, so there is no bootstrap cycle to break here:
//! the kernel's own [`Context`] is constructed once the heap is already
//! up, immediately after `heap::init`.

use alloc::vec::Vec;

use crate::arch::x86::paging::{self, MapFlags};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KResult};
use crate::lock::BoundedSpinlock;
use crate::pmm;

bitflags::bitflags! {
    #[derive(Clone, Copy)]
    pub struct VallocFlags: u32 {
        const RW               = 1 << 0;
        const USER             = 1 << 1;
        const ZERO             = 1 << 2;
        const NO_MAP           = 1 << 3;
        const FREE_ON_RELEASE  = 1 << 4;
        const USER_ONLY        = 1 << 5;
    }
}

impl VallocFlags {
    fn to_map_flags(self) -> MapFlags {
        let mut out = MapFlags::PRESENT;
        if self.contains(VallocFlags::RW) {
            out |= MapFlags::WRITABLE;
        }
        if self.contains(VallocFlags::USER) {
            out |= MapFlags::USER;
        }
        out
    }
}

struct Shard {
    virt: u32,
    phys: u32,
}

pub struct Range {
    pub addr: u32,
    /// `None` when every page of this range is sharded rather than backed
    /// by one contiguous physical allocation.
    pub phys: Option<u32>,
    pub size: u32,
    pub flags: VallocFlags,
    shards: Vec<Shard>,
}

/// Opaque handle to a [`Range`] inside the [`Context`] that created it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeHandle(usize);

const VA_PAGES: usize = (u32::MAX as usize / PAGE_SIZE as usize) + 1;
const VA_BITMAP_WORDS: usize = VA_PAGES / 32;

struct VaBitmap {
    words: Vec<u32>,
}

impl VaBitmap {
    fn new() -> Self {
        VaBitmap { words: alloc::vec![0u32; VA_BITMAP_WORDS] }
    }

    fn get(&self, page: usize) -> bool {
        self.words[page / 32] & (1 << (page % 32)) != 0
    }

    fn set_range(&mut self, start_page: usize, pages: usize) {
        for p in start_page..start_page + pages {
            self.words[p / 32] |= 1 << (p % 32);
        }
    }

    fn clear_range(&mut self, start_page: usize, pages: usize) {
        for p in start_page..start_page + pages {
            self.words[p / 32] &= !(1 << (p % 32));
        }
    }

    fn find_clear_run(&self, pages: usize) -> Option<usize> {
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for page in 0..VA_PAGES {
            if self.get(page) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == pages {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

pub struct Context {
    bitmap: VaBitmap,
    ranges: Vec<Option<Range>>,
    page_dir: Option<u32>,
}

impl Context {
    /// Creates a fresh context backed by `page_dir` (its physical page
    /// directory, `None` for a context that never installs mappings of its
    /// own, e.g. a bookkeeping-only context). Page zero is reserved so a
    /// null virtual address is never handed out.
    pub fn new(page_dir: Option<u32>) -> Self {
        let mut bitmap = VaBitmap::new();
        bitmap.set_range(0, 1);
        Context { bitmap, ranges: Vec::new(), page_dir }
    }

    pub fn page_dir(&self) -> Option<u32> {
        self.page_dir
    }

    fn alloc_virt(&mut self, pages: usize, requested: Option<u32>) -> Option<u32> {
        let start_page = match requested {
            Some(virt) => (virt / PAGE_SIZE) as usize,
            None => self.bitmap.find_clear_run(pages)?,
        };
        self.bitmap.set_range(start_page, pages);
        Some((start_page * PAGE_SIZE as usize) as u32)
    }

    fn find_range(&self, addr: u32, by_phys: bool) -> Option<usize> {
        self.ranges.iter().position(|slot| {
            let Some(range) = slot else { return false };
            let start = if by_phys { range.phys.unwrap_or(u32::MAX) } else { range.addr };
            addr >= start && addr < start + range.size
        })
    }

    pub fn get_range(&self, addr: u32, by_phys: bool) -> Option<&Range> {
        self.find_range(addr, by_phys).and_then(|i| self.ranges[i].as_ref())
    }

    fn push_range(&mut self, range: Range) -> RangeHandle {
        self.ranges.push(Some(range));
        RangeHandle(self.ranges.len() - 1)
    }

    pub fn range(&self, handle: RangeHandle) -> Option<&Range> {
        self.ranges.get(handle.0).and_then(|r| r.as_ref())
    }
}

/// Allocates `pages` pages of virtual address space in `ctx`, backs them
/// with `phys` (or freshly allocated contiguous frames if `None`), and
/// installs the mapping unless `NO_MAP` is set.
pub fn valloc(
    ctx: &BoundedSpinlock<Context>,
    pages: usize,
    requested_virt: Option<u32>,
    phys: Option<u32>,
    flags: VallocFlags,
) -> KResult<RangeHandle> {
    let mut ctx = ctx.lock().ok_or(KernelError::WouldBlock)?;

    let virt = ctx
        .alloc_virt(pages, requested_virt.map(|v| v & !(PAGE_SIZE - 1)))
        .ok_or(KernelError::OutOfMemory)?;

    let phys = match phys {
        Some(p) => p,
        None => pmm::alloc_contiguous(pages)? * PAGE_SIZE,
    };

    let size = pages as u32 * PAGE_SIZE;

    if !flags.contains(VallocFlags::NO_MAP) {
        if let Some(pd) = ctx.page_dir {
            paging::set_range(pd, virt, phys, size, flags.to_map_flags())?;
        }
    }

    if flags.contains(VallocFlags::ZERO) {
        zero_physical(&mut ctx, phys, size);
    }

    Ok(ctx.push_range(Range { addr: virt, phys: Some(phys), size, flags, shards: Vec::new() }))
}

/// Zeroes a freshly allocated region. The reference allocator temporarily
/// maps non-kernel-context (or `NO_MAP`) allocations into `VA_KERNEL` to
/// zero them since its kernel runs on a higher-half direct map; this
/// kernel identity-maps all of physical memory into every context, so the
/// physical address alone is always directly writable and no detour is
/// needed.
fn zero_physical(ctx: &mut Context, phys: u32, size: u32) {
    let _ = ctx;
    unsafe {
        core::ptr::write_bytes(paging::phys_to_virt_ptr::<u8>(phys), 0, size as usize);
    }
}

/// Maps `size` bytes of `src_ctx`'s address space, starting at `src_addr`,
/// into fresh pages of `dst_ctx`. Fails if any covered source page is
/// itself sharded (no shards-of-shards), or — when `USER_ONLY` is set — is
/// not a user-flagged range. Returns the destination address corresponding
/// to `src_addr` (i.e. including its sub-page offset).
pub fn vmap(
    dst_ctx: &BoundedSpinlock<Context>,
    src_ctx: &BoundedSpinlock<Context>,
    src_addr: u32,
    size: u32,
    flags: VallocFlags,
) -> KResult<u32> {
    let mut dst = dst_ctx.lock().ok_or(KernelError::WouldBlock)?;
    let src = src_ctx.lock().ok_or(KernelError::WouldBlock)?;

    let src_offset = src_addr % PAGE_SIZE;
    let src_aligned = src_addr - src_offset;
    let size_pages = ((size + src_offset) as usize).div_ceil(PAGE_SIZE as usize);

    let virt = dst.alloc_virt(size_pages, None).ok_or(KernelError::OutOfMemory)?;
    let mut shards = Vec::with_capacity(size_pages);

    for i in 0..size_pages {
        let page_addr = src_aligned + i as u32 * PAGE_SIZE;
        let src_range = src.get_range(page_addr, false).ok_or(KernelError::NotFound)?;

        if flags.contains(VallocFlags::USER_ONLY) && !src_range.flags.contains(VallocFlags::USER) {
            return Err(KernelError::PermissionDenied);
        }
        let src_phys = src_range.phys.ok_or(KernelError::NotSupported)?;
        let phys = src_phys + (page_addr - src_range.addr);
        let dst_virt = virt + i as u32 * PAGE_SIZE;

        if let Some(pd) = dst.page_dir {
            paging::set_range(pd, dst_virt, phys, PAGE_SIZE, flags.to_map_flags())?;
        }
        shards.push(Shard { virt: dst_virt, phys });
    }

    dst.push_range(Range {
        addr: virt,
        phys: None,
        size: size_pages as u32 * PAGE_SIZE,
        flags,
        shards,
    });

    Ok(virt + src_offset)
}

/// Unlinks `range`, clears its VA bitmap bits and PTEs, and — if
/// `FREE_ON_RELEASE` is set — returns its backing frames (the contiguous
/// allocation, or each shard's frame) to the frame allocator.
pub fn vfree(ctx: &BoundedSpinlock<Context>, handle: RangeHandle) -> KResult<()> {
    let mut ctx = ctx.lock().ok_or(KernelError::WouldBlock)?;
    let Some(range) = ctx.ranges.get_mut(handle.0).and_then(|r| r.take()) else {
        return Err(KernelError::NotFound);
    };

    let pages = (range.size / PAGE_SIZE) as usize;
    ctx.bitmap.clear_range((range.addr / PAGE_SIZE) as usize, pages);
    if let Some(pd) = ctx.page_dir {
        paging::clear_range(pd, range.addr, range.size);
    }

    if range.flags.contains(VallocFlags::FREE_ON_RELEASE) {
        if let Some(phys) = range.phys {
            for i in 0..pages {
                pmm::free_frame(phys / PAGE_SIZE + i as u32);
            }
        }
        for shard in &range.shards {
            pmm::free_frame(shard.phys / PAGE_SIZE);
        }
    }

    Ok(())
}

/// Tears down an entire context: frees every still-live range (honoring
/// `FREE_ON_RELEASE` on each) and, if it owns a page directory, reclaims
/// its page-table frames too. Called when a task exits.
pub fn cleanup(ctx: &mut Context) {
    for slot in ctx.ranges.drain(..) {
        let Some(range) = slot else { continue };
        if range.flags.contains(VallocFlags::FREE_ON_RELEASE) {
            if let Some(phys) = range.phys {
                let pages = range.size / PAGE_SIZE;
                for i in 0..pages {
                    pmm::free_frame(phys / PAGE_SIZE + i);
                }
            }
        }
    }
    if let Some(pd) = ctx.page_dir.take() {
        paging::rm_context(pd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_virt_never_returns_null_page() {
        let mut ctx = Context::new(None);
        let virt = ctx.alloc_virt(1, None).unwrap();
        assert_ne!(virt, 0);
    }

    #[test]
    fn alloc_virt_honors_explicit_request() {
        let mut ctx = Context::new(None);
        let requested = 0x4000_0000u32;
        let virt = ctx.alloc_virt(4, Some(requested)).unwrap();
        assert_eq!(virt, requested);
        assert!(ctx.bitmap.get((requested / PAGE_SIZE) as usize));
        assert!(ctx.bitmap.get((requested / PAGE_SIZE) as usize + 3));
    }

    #[test]
    fn find_range_matches_containing_range() {
        let mut ctx = Context::new(None);
        let handle = ctx.push_range(Range {
            addr: 0x1000,
            phys: Some(0x1000),
            size: PAGE_SIZE * 4,
            flags: VallocFlags::RW,
            shards: Vec::new(),
        });
        assert!(ctx.get_range(0x2500, false).is_some());
        assert!(ctx.get_range(0x5000, false).is_none());
        assert_eq!(ctx.range(handle).unwrap().addr, 0x1000);
    }
}

//! ELF32 program loader: validates a little-endian, x86 executable and maps
//! its `PT_LOAD` segments into a freshly created task. Grounded on the
//! reference segment-mapping loop structure — map pages, copy `filesz`
//! bytes, zero the bss tail — reimplemented against [`crate::valloc`] and
//! [`crate::task::task_add_mem`] instead of the reference's direct page-table
//! pokes, since every other region a task owns already goes through that
//! path and a segment should be torn down by `task_exit`/`fork` the same way
//! any other region is. Header parsing follows the `ext2` superblock's
//! `read_unaligned`-out-of-a-byte-buffer idiom rather than casting a
//! reference directly over unaligned file bytes.

use crate::arch::x86::paging;
use crate::config;
use crate::error::{KernelError, KResult};
use crate::task::{self, MemRegionFlags, Section};
use crate::valloc::{self, VallocFlags};

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct Elf32Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

fn read_ehdr(data: &[u8]) -> KResult<Elf32Ehdr> {
    if data.len() < core::mem::size_of::<Elf32Ehdr>() {
        return Err(KernelError::ExecFormatError);
    }
    let ehdr = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf32Ehdr) };
    let ident = ehdr.e_ident;
    if ident[0..4] != ELFMAG
        || ident[4] != ELFCLASS32
        || ident[5] != ELFDATA2LSB
        || ident[6] != EV_CURRENT
    {
        return Err(KernelError::ExecFormatError);
    }
    if ehdr.e_type != ET_EXEC || ehdr.e_machine != EM_386 || ehdr.e_version != EV_CURRENT as u32 {
        return Err(KernelError::ExecFormatError);
    }
    if ehdr.e_entry == 0 || ehdr.e_phnum == 0 || ehdr.e_shnum == 0 {
        return Err(KernelError::ExecFormatError);
    }
    Ok(ehdr)
}

fn read_phdr(data: &[u8], ehdr: &Elf32Ehdr, index: u16) -> KResult<Elf32Phdr> {
    let phentsize = ehdr.e_phentsize as usize;
    let phoff = ehdr.e_phoff as usize;
    let offset = phoff + index as usize * phentsize;
    let end = offset
        .checked_add(core::mem::size_of::<Elf32Phdr>())
        .ok_or(KernelError::ExecFormatError)?;
    if end > data.len() {
        return Err(KernelError::ExecFormatError);
    }
    Ok(unsafe { core::ptr::read_unaligned(data[offset..].as_ptr() as *const Elf32Phdr) })
}

fn align_down(v: u32, align: u32) -> u32 {
    v & !(align - 1)
}

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// Maps every `PT_LOAD` segment of `data` into `pid`'s address space,
/// carves out its user stack, sets `task.entry`/`task.sbrk`, and finishes by
/// calling [`task::task_set_initial_state`] with `argv`/`envp`. Rejects
/// anything that doesn't match the fixed ELF32/EM_386/ET_EXEC magic with
/// `ExecFormatError` before touching the task at all — the "no task state is
/// mutated" property a bad binary must preserve.
pub fn load_into_task(pid: u32, data: &[u8], argv: &[&str], envp: &[&str]) -> KResult<()> {
    let ehdr = read_ehdr(data)?;

    // Collect before mutating anything: a malformed program header found
    // partway through must still leave the task untouched.
    let mut loads = alloc::vec::Vec::new();
    for i in 0..ehdr.e_phnum {
        let phdr = read_phdr(data, &ehdr, i)?;
        match phdr.p_type {
            PT_LOAD if phdr.p_memsz != 0 => loads.push(phdr),
            // Recorded in spirit, not resolved: dynamic loading and
            // interpreter resolution are out of scope.
            PT_INTERP | PT_DYNAMIC | PT_LOAD => {}
            _ => {}
        }
    }

    let mut highest_end = config::USER_IMAGE_BASE;
    for phdr in &loads {
        load_segment(pid, data, phdr)?;
        let seg_end = align_up(phdr.p_vaddr.saturating_add(phdr.p_memsz), config::PAGE_SIZE);
        if seg_end > highest_end {
            highest_end = seg_end;
        }
    }

    let stack_pages = config::USER_STACK_PAGES as usize;
    let stack_size = stack_pages as u32 * config::PAGE_SIZE;
    let stack_virt = config::USER_STACK_TOP - stack_size;
    let stack_handle = task::with_task(pid, |t| {
        valloc::valloc(
            &t.valloc_ctx,
            stack_pages,
            Some(stack_virt),
            None,
            VallocFlags::RW | VallocFlags::USER | VallocFlags::ZERO | VallocFlags::FREE_ON_RELEASE,
        )
    })?;
    task::task_add_mem(
        pid,
        stack_handle,
        stack_virt,
        stack_size,
        Section::Stack,
        MemRegionFlags::FORK_COPY | MemRegionFlags::FREE_ON_EXIT,
    )?;

    task::with_task(pid, |t| {
        t.entry = ehdr.e_entry;
        t.sbrk = highest_end;
        Ok(())
    })?;

    task::task_set_initial_state(pid, argv, envp)
}

fn load_segment(pid: u32, data: &[u8], phdr: &Elf32Phdr) -> KResult<()> {
    let seg_start = align_down(phdr.p_vaddr, config::PAGE_SIZE);
    let seg_end = align_up(phdr.p_vaddr.saturating_add(phdr.p_memsz), config::PAGE_SIZE);
    let size = seg_end - seg_start;
    let pages = (size / config::PAGE_SIZE) as usize;

    let writable = phdr.p_flags & PF_W != 0;
    let executable = phdr.p_flags & PF_X != 0;
    if executable && writable {
        return Err(KernelError::ExecFormatError);
    }

    let mut flags = VallocFlags::USER | VallocFlags::ZERO | VallocFlags::FREE_ON_RELEASE;
    if writable {
        flags |= VallocFlags::RW;
    }

    let handle = task::with_task(pid, |t| {
        valloc::valloc(&t.valloc_ctx, pages, Some(seg_start), None, flags)
    })?;

    if phdr.p_filesz != 0 {
        let foff = phdr.p_offset as usize;
        let fsz = phdr.p_filesz as usize;
        let fend = foff.checked_add(fsz).ok_or(KernelError::ExecFormatError)?;
        if fend > data.len() {
            return Err(KernelError::ExecFormatError);
        }

        let phys_base = task::with_task(pid, |t| {
            let ctx = t.valloc_ctx.lock().ok_or(KernelError::WouldBlock)?;
            ctx.range(handle).and_then(|r| r.phys).ok_or(KernelError::NotFound)
        })?;
        let dst_phys = phys_base + (phdr.p_vaddr - seg_start);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data[foff..].as_ptr(),
                paging::phys_to_virt_ptr::<u8>(dst_phys),
                fsz,
            );
        }
    }

    let section = if executable { Section::Code } else { Section::Data };
    // Every PT_LOAD segment needs FORK_COPY, writable or not: task_fork skips
    // any region lacking it entirely, so a read-only code segment without
    // this flag would leave a forked child with no executable text mapped.
    let region_flags = MemRegionFlags::FORK_COPY | MemRegionFlags::FREE_ON_EXIT;
    task::task_add_mem(pid, handle, seg_start, size, section, region_flags)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn build_minimal_elf(magic: [u8; 4]) -> Vec<u8> {
        let mut ident = [0u8; EI_NIDENT];
        ident[0..4].copy_from_slice(&magic);
        ident[4] = ELFCLASS32;
        ident[5] = ELFDATA2LSB;
        ident[6] = EV_CURRENT;

        let ehdr = Elf32Ehdr {
            e_ident: ident,
            e_type: ET_EXEC,
            e_machine: EM_386,
            e_version: EV_CURRENT as u32,
            e_entry: config::USER_IMAGE_BASE,
            e_phoff: core::mem::size_of::<Elf32Ehdr>() as u32,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: core::mem::size_of::<Elf32Ehdr>() as u16,
            e_phentsize: core::mem::size_of::<Elf32Phdr>() as u16,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 1,
            e_shstrndx: 0,
        };
        let phdr = Elf32Phdr {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: config::USER_IMAGE_BASE,
            p_paddr: config::USER_IMAGE_BASE,
            p_filesz: 0,
            p_memsz: config::PAGE_SIZE,
            p_flags: PF_X,
            p_align: config::PAGE_SIZE,
        };

        let mut bytes = Vec::new();
        unsafe {
            bytes.extend_from_slice(core::slice::from_raw_parts(
                (&ehdr as *const Elf32Ehdr) as *const u8,
                core::mem::size_of::<Elf32Ehdr>(),
            ));
            bytes.extend_from_slice(core::slice::from_raw_parts(
                (&phdr as *const Elf32Phdr) as *const u8,
                core::mem::size_of::<Elf32Phdr>(),
            ));
        }
        bytes
    }

    #[test]
    fn valid_header_parses() {
        let bytes = build_minimal_elf(ELFMAG);
        let ehdr = read_ehdr(&bytes).expect("well-formed header should parse");
        assert_eq!(ehdr.e_phnum, 1);
        let phdr = read_phdr(&bytes, &ehdr, 0).unwrap();
        assert_eq!(phdr.p_type, PT_LOAD);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = build_minimal_elf([0x7f, b'B', b'A', b'D']);
        assert!(matches!(read_ehdr(&bytes), Err(KernelError::ExecFormatError)));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let bytes = [0u8; 4];
        assert!(matches!(read_ehdr(&bytes), Err(KernelError::ExecFormatError)));
    }

    #[test]
    fn phdr_past_end_of_file_is_rejected() {
        let mut bytes = build_minimal_elf(ELFMAG);
        bytes.truncate(core::mem::size_of::<Elf32Ehdr>() + 4);
        let ehdr = read_ehdr(&bytes).unwrap();
        assert!(matches!(read_phdr(&bytes, &ehdr, 0), Err(KernelError::ExecFormatError)));
    }
}

//! Read-only ext2, grounded on the reference `ext2.c`: superblock and
//! blockgroup parsing, direct/single/double-indirect block addressing,
//! directory-entry scanning, and symlink resolution. No write path exists
//! — per the recorded Open Question decision, the filesystem this module
//! exposes to [`crate::vfs`] has no `write`/`unlink` entry at all, so those
//! calls fail with `NotSupported` through [`crate::vfs::FileOps`]'s default
//! methods rather than through a half-ported stub.
//!
//! All disk access goes through [`crate::ide::BlockDevice`]; this module
//! never issues a port I/O instruction itself.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KResult};
use crate::ide::{BlockDevice, SECTOR_SIZE};
use crate::lock::BoundedSpinlock;
use crate::vfs::{FileOps, FileSystem, Stat, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

const EXT2_MAGIC: u16 = 0xEF53;
const EXT2_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_ROOT_INO: u32 = 2;
const EXT2_STATE_CLEAN: u16 = 1;
const EXT2_N_DIRECT_BLOCKS: usize = 12;

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawSuperblock {
    inodes_count: u32,
    blocks_count: u32,
    r_blocks_count: u32,
    free_blocks_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    log_block_size: u32,
    log_frag_size: i32,
    blocks_per_group: u32,
    frags_per_group: u32,
    inodes_per_group: u32,
    mtime: u32,
    wtime: u32,
    mnt_count: u16,
    max_mnt_count: i16,
    magic: u16,
    state: u16,
    errors: u16,
    minor_rev_level: u16,
    lastcheck: u32,
    checkinterval: u32,
    creator_os: u32,
    rev_level: u32,
    def_resuid: u16,
    def_resgid: u16,
    // Extended superblock fields, valid only when rev_level >= 1.
    first_ino: u32,
    inode_size: u16,
    block_group_nr: u16,
    feature_compat: u32,
    feature_incompat: u32,
    feature_ro_compat: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawBlockGroupDescriptor {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    free_blocks_count: u16,
    free_inodes_count: u16,
    used_dirs_count: u16,
    pad: u16,
    reserved: [u8; 12],
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawInode {
    mode: u16,
    uid: u16,
    size_lo: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
    gid: u16,
    links_count: u16,
    blocks: u32,
    flags: u32,
    osd1: u32,
    block: [u32; 15],
    generation: u32,
    file_acl: u32,
    size_hi: u32,
    faddr: u32,
    osd2: [u8; 12],
}

struct Superblock {
    block_size: u32,
    inodes_per_group: u32,
    inode_size: u32,
    blocks_per_group: u32,
}

struct Ext2 {
    dev: &'static dyn BlockDevice,
    sb: Superblock,
    block_groups: Vec<RawBlockGroupDescriptor>,
    root_inode: RawInode,
}

/// Reads `len` bytes starting at byte offset `at`, straddling whatever
/// 512 B sectors that spans. The only place sector-sized I/O meets
/// arbitrary byte ranges.
fn read_bytes(dev: &dyn BlockDevice, at: u64, len: usize) -> KResult<Vec<u8>> {
    let mut out = alloc::vec![0u8; len];
    let mut done = 0usize;
    while done < len {
        let abs = at + done as u64;
        let sector = (abs / SECTOR_SIZE as u64) as u32;
        let in_sector = (abs % SECTOR_SIZE as u64) as usize;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        dev.read_sector(sector, &mut sector_buf)?;
        let n = (SECTOR_SIZE - in_sector).min(len - done);
        out[done..done + n].copy_from_slice(&sector_buf[in_sector..in_sector + n]);
        done += n;
    }
    Ok(out)
}

fn read_block(dev: &dyn BlockDevice, block_size: u32, block: u32) -> KResult<Vec<u8>> {
    if block == 0 {
        return Ok(alloc::vec![0u8; block_size as usize]);
    }
    read_bytes(dev, block as u64 * block_size as u64, block_size as usize)
}

impl Ext2 {
    fn init(dev: &'static dyn BlockDevice) -> KResult<Self> {
        let raw = read_bytes(dev, EXT2_SUPERBLOCK_OFFSET, core::mem::size_of::<RawSuperblock>())?;
        let sb_raw = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const RawSuperblock) };

        if sb_raw.magic != EXT2_MAGIC {
            log::error!("ext2: bad magic {:#x}", sb_raw.magic);
            return Err(KernelError::InvalidArgument);
        }
        if sb_raw.state != EXT2_STATE_CLEAN {
            log::error!("ext2: filesystem not marked clean");
            return Err(KernelError::InvalidArgument);
        }
        if sb_raw.feature_incompat != 0 {
            log::error!("ext2: unsupported incompat features {:#x}", sb_raw.feature_incompat);
            return Err(KernelError::NotSupported);
        }

        let block_size = 1024u32 << sb_raw.log_block_size;
        let inode_size = if sb_raw.rev_level >= 1 { sb_raw.inode_size as u32 } else { 128 };

        let sb =
            Superblock { block_size, inodes_per_group: sb_raw.inodes_per_group, inode_size, blocks_per_group: sb_raw.blocks_per_group };

        let num_groups = sb_raw.blocks_count.div_ceil(sb_raw.blocks_per_group) as usize;
        let bgdt_block = if block_size == 1024 { 2 } else { 1 };
        let bgdt_bytes = read_bytes(
            dev,
            bgdt_block as u64 * block_size as u64,
            num_groups * core::mem::size_of::<RawBlockGroupDescriptor>(),
        )?;
        let mut block_groups = Vec::with_capacity(num_groups);
        for i in 0..num_groups {
            let off = i * core::mem::size_of::<RawBlockGroupDescriptor>();
            let bg = unsafe {
                core::ptr::read_unaligned(bgdt_bytes[off..].as_ptr() as *const RawBlockGroupDescriptor)
            };
            block_groups.push(bg);
        }

        let mut ext2 = Ext2 { dev, sb, block_groups, root_inode: unsafe { core::mem::zeroed() } };
        ext2.root_inode = ext2.read_inode_raw(EXT2_ROOT_INO)?;
        log::info!("ext2: mounted, block_size={} inode_size={}", block_size, inode_size);
        Ok(ext2)
    }

    fn read_inode_raw(&self, ino: u32) -> KResult<RawInode> {
        let index = (ino - 1) as u64;
        let group = (index / self.sb.inodes_per_group as u64) as usize;
        let index_in_group = index % self.sb.inodes_per_group as u64;
        let bg = self.block_groups.get(group).ok_or(KernelError::NotFound)?;
        let table_byte = bg.inode_table as u64 * self.sb.block_size as u64;
        let offset = table_byte + index_in_group * self.sb.inode_size as u64;
        let raw = read_bytes(self.dev, offset, core::mem::size_of::<RawInode>())?;
        Ok(unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const RawInode) })
    }

    fn inode_size_bytes(inode: &RawInode) -> u64 {
        (inode.size_hi as u64) << 32 | inode.size_lo as u64
    }

    /// Resolves logical block `b` of `inode` to a physical block number, per
    /// §4.9/§8: direct for `b < 12`, single indirect through `block[12]` for
    /// `12 <= b < 12 + P`, double indirect through `block[13]` beyond that.
    /// Triple indirect (`block[14]`) is out of scope — see the recorded
    /// Open Question decision.
    fn block_for_index(&self, inode: &RawInode, b: u32) -> KResult<u32> {
        let p = self.sb.block_size / 4;

        if (b as usize) < EXT2_N_DIRECT_BLOCKS {
            return Ok(inode.block[b as usize]);
        }
        let b = b - EXT2_N_DIRECT_BLOCKS as u32;

        if b < p {
            let table = read_block(self.dev, self.sb.block_size, inode.block[12])?;
            return Ok(u32::from_le_bytes(table[(b as usize) * 4..(b as usize) * 4 + 4].try_into().unwrap()));
        }
        let b = b - p;

        if b < p * p {
            let outer_index = b / p;
            let inner_index = b % p;
            let outer = read_block(self.dev, self.sb.block_size, inode.block[13])?;
            let mid_block = u32::from_le_bytes(
                outer[(outer_index as usize) * 4..(outer_index as usize) * 4 + 4].try_into().unwrap(),
            );
            let inner = read_block(self.dev, self.sb.block_size, mid_block)?;
            return Ok(u32::from_le_bytes(
                inner[(inner_index as usize) * 4..(inner_index as usize) * 4 + 4].try_into().unwrap(),
            ));
        }

        Err(KernelError::InvalidArgument)
    }

    fn read_inode_data(&self, inode: &RawInode, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let size = Self::inode_size_bytes(inode);
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);
        let mut done = 0usize;
        while done < to_read {
            let abs = offset + done as u64;
            let logical_block = (abs / self.sb.block_size as u64) as u32;
            let in_block = (abs % self.sb.block_size as u64) as usize;
            let phys_block = self.block_for_index(inode, logical_block)?;
            let block_data = read_block(self.dev, self.sb.block_size, phys_block)?;
            let n = (self.sb.block_size as usize - in_block).min(to_read - done);
            buf[done..done + n].copy_from_slice(&block_data[in_block..in_block + n]);
            done += n;
        }
        Ok(to_read)
    }

    /// Scans `dir`'s data blocks for an entry named `name`, returning its
    /// inode number.
    fn lookup_in_dir(&self, dir: &RawInode, name: &str) -> KResult<u32> {
        let size = Self::inode_size_bytes(dir) as usize;
        let mut data = alloc::vec![0u8; size];
        self.read_inode_data(dir, 0, &mut data)?;

        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let ino = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(data[pos + 4..pos + 6].try_into().unwrap()) as usize;
            let name_len = data[pos + 6] as usize;
            if rec_len == 0 {
                break;
            }
            if ino != 0 && name_len == name.len() && &data[pos + 8..pos + 8 + name_len] == name.as_bytes() {
                return Ok(ino);
            }
            pos += rec_len;
        }
        Err(KernelError::NotFound)
    }

    /// Walks `path` from the root inode, following symlinks per §4.9:
    /// inline (size <= 60) symlinks are stored in `inode.block`'s bytes;
    /// longer ones are read as file data. Absolute targets restart the walk
    /// from root; relative targets are resolved against the symlink's
    /// containing directory.
    fn resolve_path(&self, path: &str) -> KResult<(u32, RawInode)> {
        let mut current = self.root_inode;
        let mut current_ino = EXT2_ROOT_INO;
        let mut depth = 0;

        let mut components: Vec<String> = path.split('/').filter(|c| !c.is_empty()).map(|c| c.to_string()).collect();
        let mut i = 0;
        while i < components.len() {
            let name = components[i].clone();
            let child_ino = self.lookup_in_dir(&current, &name)?;
            let child = self.read_inode_raw(child_ino)?;

            if child.mode & S_IFMT as u16 == S_IFLNK as u16 {
                depth += 1;
                if depth > 16 {
                    return Err(KernelError::InvalidArgument);
                }
                let target = self.read_symlink(&child)?;
                let mut new_components: Vec<String> = if target.starts_with('/') {
                    target.split('/').filter(|c| !c.is_empty()).map(|c| c.to_string()).collect()
                } else {
                    let mut base = components[..i].to_vec();
                    base.extend(target.split('/').filter(|c| !c.is_empty()).map(|c| c.to_string()));
                    base
                };
                new_components.extend_from_slice(&components[i + 1..]);
                components = new_components;
                current = self.root_inode;
                current_ino = EXT2_ROOT_INO;
                i = 0;
                continue;
            }

            current = child;
            current_ino = child_ino;
            i += 1;
        }

        Ok((current_ino, current))
    }

    fn read_symlink(&self, inode: &RawInode) -> KResult<String> {
        let size = Self::inode_size_bytes(inode) as usize;
        if size <= 60 {
            let bytes = unsafe {
                core::slice::from_raw_parts(inode.block.as_ptr() as *const u8, size)
            };
            Ok(String::from_utf8_lossy(bytes).to_string())
        } else {
            let mut buf = alloc::vec![0u8; size];
            self.read_inode_data(inode, 0, &mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        }
    }

    fn stat_inode(&self, inode: &RawInode) -> Stat {
        Stat {
            mode: inode.mode as u32,
            uid: inode.uid as u32,
            gid: inode.gid as u32,
            size: Self::inode_size_bytes(inode),
            nlink: inode.links_count as u32,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            blocks: inode.blocks,
            st_dev: 1,
            st_blksize: self.sb.block_size,
        }
    }
}

struct Ext2File {
    fs: Arc<BoundedSpinlock<Ext2>>,
    ino: u32,
}

impl FileOps for Ext2File {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let fs = self.fs.lock().ok_or(KernelError::WouldBlock)?;
        let inode = fs.read_inode_raw(self.ino)?;
        if inode.mode & S_IFMT as u16 != S_IFREG as u16 {
            return Err(KernelError::IsADirectory);
        }
        fs.read_inode_data(&inode, offset, buf)
    }

    fn stat(&self) -> KResult<Stat> {
        let fs = self.fs.lock().ok_or(KernelError::WouldBlock)?;
        let inode = fs.read_inode_raw(self.ino)?;
        Ok(fs.stat_inode(&inode))
    }

    fn getdents(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let fs = self.fs.lock().ok_or(KernelError::WouldBlock)?;
        let inode = fs.read_inode_raw(self.ino)?;
        if inode.mode & S_IFMT as u16 != S_IFDIR as u16 {
            return Err(KernelError::NotADirectory);
        }
        fs.read_inode_data(&inode, offset, buf)
    }
}

pub struct Ext2Mount {
    fs: Arc<BoundedSpinlock<Ext2>>,
}

impl Ext2Mount {
    pub fn new(dev: &'static dyn BlockDevice) -> KResult<Self> {
        Ok(Ext2Mount { fs: Arc::new(BoundedSpinlock::new(Ext2::init(dev)?)) })
    }
}

impl FileSystem for Ext2Mount {
    fn open(&self, path: &str, _flags: u32) -> KResult<Arc<dyn FileOps>> {
        let ino = {
            let fs = self.fs.lock().ok_or(KernelError::WouldBlock)?;
            let (ino, _inode) = fs.resolve_path(path)?;
            ino
        };
        Ok(Arc::new(Ext2File { fs: self.fs.clone(), ino }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ide::SECTOR_SIZE;

    struct MemDisk {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl BlockDevice for MemDisk {
        fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()> {
            let Some(s) = self.sectors.get(sector as usize) else {
                return Err(KernelError::IOError);
            };
            buf.copy_from_slice(s);
            Ok(())
        }
    }

    fn build_disk(block_size: u32, root_entries: &[(u32, &str)], files: &[(u32, Vec<u8>)]) -> MemDisk {
        let total_bytes = 4 * 1024 * 1024usize;
        let mut raw = alloc::vec![0u8; total_bytes];

        let inodes_per_group = 64u32;
        let blocks_per_group = (total_bytes as u32) / block_size;

        let mut sb = unsafe { core::mem::zeroed::<RawSuperblock>() };
        sb.inodes_count = inodes_per_group;
        sb.blocks_count = blocks_per_group;
        sb.first_data_block = if block_size == 1024 { 1 } else { 0 };
        sb.log_block_size = (block_size / 1024).trailing_zeros();
        sb.blocks_per_group = blocks_per_group;
        sb.inodes_per_group = inodes_per_group;
        sb.magic = EXT2_MAGIC;
        sb.state = EXT2_STATE_CLEAN;
        sb.rev_level = 1;
        sb.first_ino = 11;
        sb.inode_size = 128;
        let sb_bytes = unsafe {
            core::slice::from_raw_parts(
                &sb as *const _ as *const u8,
                core::mem::size_of::<RawSuperblock>(),
            )
        };
        raw[1024..1024 + sb_bytes.len()].copy_from_slice(sb_bytes);

        let bgdt_block = if block_size == 1024 { 2 } else { 1 };
        let mut bg = unsafe { core::mem::zeroed::<RawBlockGroupDescriptor>() };
        // Layout: [bgdt_block] descriptor table, then inode table, then data blocks.
        let inode_table_block = bgdt_block + 1;
        let inode_table_blocks = (inodes_per_group as u64 * 128).div_ceil(block_size as u64) as u32;
        let data_start_block = inode_table_block + inode_table_blocks;
        bg.inode_table = inode_table_block;
        let bg_bytes = unsafe {
            core::slice::from_raw_parts(&bg as *const _ as *const u8, core::mem::size_of::<RawBlockGroupDescriptor>())
        };
        let bgdt_off = bgdt_block as usize * block_size as usize;
        raw[bgdt_off..bgdt_off + bg_bytes.len()].copy_from_slice(bg_bytes);

        let mut next_data_block = data_start_block;
        let mut write_inode = |raw: &mut Vec<u8>, ino: u32, inode: &RawInode| {
            let off = inode_table_block as usize * block_size as usize + (ino as usize - 1) * 128;
            let bytes = unsafe {
                core::slice::from_raw_parts(inode as *const _ as *const u8, core::mem::size_of::<RawInode>())
            };
            raw[off..off + bytes.len()].copy_from_slice(bytes);
        };

        // Root directory inode (#2): one data block holding the dirents.
        let mut dirent_data = alloc::vec![0u8; block_size as usize];
        let mut pos = 0usize;
        for (ino, name) in root_entries {
            let name_len = name.len();
            let rec_len = (8 + name_len).div_ceil(4) * 4;
            dirent_data[pos..pos + 4].copy_from_slice(&ino.to_le_bytes());
            dirent_data[pos + 4..pos + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
            dirent_data[pos + 6] = name_len as u8;
            dirent_data[pos + 7] = 1;
            dirent_data[pos + 8..pos + 8 + name_len].copy_from_slice(name.as_bytes());
            pos += rec_len;
        }
        let root_block = next_data_block;
        next_data_block += 1;
        let off = root_block as usize * block_size as usize;
        raw[off..off + dirent_data.len()].copy_from_slice(&dirent_data);

        let mut root_inode = unsafe { core::mem::zeroed::<RawInode>() };
        root_inode.mode = S_IFDIR as u16 | 0o755;
        root_inode.size_lo = block_size;
        root_inode.links_count = 2;
        root_inode.block[0] = root_block;
        write_inode(&mut raw, EXT2_ROOT_INO, &root_inode);

        for (ino, contents) in files {
            let mut file_inode = unsafe { core::mem::zeroed::<RawInode>() };
            file_inode.mode = S_IFREG as u16 | 0o644;
            file_inode.size_lo = contents.len() as u32;
            file_inode.links_count = 1;
            let needed_blocks = (contents.len() as u64).div_ceil(block_size as u64) as usize;
            for (i, chunk_start) in (0..needed_blocks).enumerate() {
                assert!(i < EXT2_N_DIRECT_BLOCKS, "test helper only supports direct blocks");
                let block = next_data_block;
                next_data_block += 1;
                file_inode.block[i] = block;
                let start = chunk_start * block_size as usize;
                let end = (start + block_size as usize).min(contents.len());
                let off = block as usize * block_size as usize;
                raw[off..off + (end - start)].copy_from_slice(&contents[start..end]);
            }
            write_inode(&mut raw, *ino, &file_inode);
        }

        let sectors = raw
            .chunks(SECTOR_SIZE)
            .map(|c| {
                let mut s = [0u8; SECTOR_SIZE];
                s[..c.len()].copy_from_slice(c);
                s
            })
            .collect();
        MemDisk { sectors }
    }

    #[test]
    fn reads_a_root_level_file() {
        let disk: &'static MemDisk =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(build_disk(1024, &[(12, "hello.txt")], &[(12, b"Hello, world!\n".to_vec())])));
        let fs = Ext2::init(disk).unwrap();
        let (ino, inode) = fs.resolve_path("/hello.txt").unwrap();
        assert_eq!(ino, 12);
        let mut buf = [0u8; 14];
        let n = fs.read_inode_data(&inode, 0, &mut buf).unwrap();
        assert_eq!(n, 14);
        assert_eq!(&buf, b"Hello, world!\n");
    }

    #[test]
    fn block_indexing_matches_spec_vectors() {
        // block_size = 1024 => P = 256 entries per indirect block (§8's
        // exact vectors: block 11 direct, block 12 single-indirect index 0,
        // block 267 single-indirect index 255, block 268 double-indirect
        // at (0, 0)).
        let mut disk = build_disk(1024, &[], &[]);

        let single_indirect_block = 900u32;
        let outer_block = 901u32;
        let mid_block = 902u32;

        write_block_u32_entry(&mut disk, 1024, single_indirect_block, 0, 0xAAAA);
        write_block_u32_entry(&mut disk, 1024, single_indirect_block, 255, 0xBBBB);
        write_block_u32_entry(&mut disk, 1024, outer_block, 0, mid_block);
        write_block_u32_entry(&mut disk, 1024, mid_block, 0, 0xCCCC);

        let disk: &'static MemDisk = alloc::boxed::Box::leak(alloc::boxed::Box::new(disk));
        let fs = Ext2::init(disk).unwrap();

        let mut inode = unsafe { core::mem::zeroed::<RawInode>() };
        inode.block[11] = 0x1111;
        inode.block[12] = single_indirect_block;
        inode.block[13] = outer_block;

        assert_eq!(fs.block_for_index(&inode, 11).unwrap(), 0x1111);
        assert_eq!(fs.block_for_index(&inode, 12).unwrap(), 0xAAAA);
        assert_eq!(fs.block_for_index(&inode, 267).unwrap(), 0xBBBB);
        assert_eq!(fs.block_for_index(&inode, 268).unwrap(), 0xCCCC);
    }

    /// Pokes a little-endian u32 into entry `index` of logical `block`,
    /// bypassing the filesystem — used to plant known indirect-block
    /// contents without a full writer path.
    fn write_block_u32_entry(disk: &mut MemDisk, block_size: u32, block: u32, index: usize, value: u32) {
        let byte_off = block as u64 * block_size as u64 + (index * 4) as u64;
        let sector = (byte_off / SECTOR_SIZE as u64) as usize;
        let in_sector = (byte_off % SECTOR_SIZE as u64) as usize;
        disk.sectors[sector][in_sector..in_sector + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut disk = build_disk(1024, &[], &[]);
        // Superblock starts at byte 1024 == sector 2; `magic` is the u16 at
        // struct offset 56, landing at sector-relative offset 56.
        disk.sectors[2][56] = 0;
        disk.sectors[2][57] = 0;
        let disk: &'static MemDisk = alloc::boxed::Box::leak(alloc::boxed::Box::new(disk));
        assert_eq!(Ext2::init(disk).unwrap_err(), KernelError::InvalidArgument);
    }
}

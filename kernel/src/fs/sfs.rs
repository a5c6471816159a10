//! The simple on-disk filesystem.
//!
//! Layout: superblock at block 0, the root directory inode at block 1, the
//! free-block bitmap right after, data from there on. An inode number is the
//! block number holding it. Files carry twelve direct pointers and one
//! single-indirect block; directories store exactly one entry per data
//! block, a zero entry ino marking a deleted slot.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::debug;

use super::blockdev::BlockDevice;
use super::{Filesystem, InodeNo, InodeType, Stat};
use crate::error::FsError;

/// Block and inode granularity; equal to the page size.
pub const BLKSIZE: usize = 4096;

const SFS_MAGIC: u32 = 0x2f8d_be2a;
const NDIRECT: usize = 12;
const BLK_NENTRY: usize = BLKSIZE / 4;

/// Largest file: direct plus single-indirect blocks.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + BLK_NENTRY;
pub const MAX_FILE_SIZE: u32 = (MAX_FILE_BLOCKS * BLKSIZE) as u32;

/// Longest file name.
pub const MAX_FNAME_LEN: usize = 255;

/// Bytes a directory's size grows per live entry.
const DIRENT_ACCOUNTING: u32 = (MAX_FNAME_LEN + 1) as u32;
/// On-disk bytes of a directory entry: ino plus NUL-padded name.
const DIRENT_BYTES: usize = 4 + MAX_FNAME_LEN + 1;

const BLKN_SUPER: u32 = 0;
const BLKN_ROOT: u32 = 1;
const BLKN_FREEMAP: u32 = 2;

const TYPE_FILE: u16 = 1;
const TYPE_DIR: u16 = 2;

/// On-disk inode image.
#[derive(Debug, Clone, Copy)]
struct DiskInode {
    size: u32,
    type_: u16,
    nlinks: u16,
    blocks: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
}

impl DiskInode {
    fn empty(type_: u16) -> Self {
        Self {
            size: 0,
            type_,
            nlinks: 0,
            blocks: 0,
            direct: [0; NDIRECT],
            indirect: 0,
        }
    }

    fn encode(&self) -> [u8; 64] {
        let mut b = [0u8; 64];
        b[0..4].copy_from_slice(&self.size.to_le_bytes());
        b[4..6].copy_from_slice(&self.type_.to_le_bytes());
        b[6..8].copy_from_slice(&self.nlinks.to_le_bytes());
        b[8..12].copy_from_slice(&self.blocks.to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            b[12 + i * 4..16 + i * 4].copy_from_slice(&d.to_le_bytes());
        }
        b[60..64].copy_from_slice(&self.indirect.to_le_bytes());
        b
    }

    fn decode(b: &[u8]) -> Self {
        let word = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let mut direct = [0u32; NDIRECT];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = word(12 + i * 4);
        }
        Self {
            size: word(0),
            type_: u16::from_le_bytes([b[4], b[5]]),
            nlinks: u16::from_le_bytes([b[6], b[7]]),
            blocks: word(8),
            direct,
            indirect: word(60),
        }
    }
}

struct SuperBlock {
    magic: u32,
    blocks: u32,
    unused_blocks: u32,
}

impl SuperBlock {
    fn encode(&self) -> [u8; 44] {
        let mut b = [0u8; 44];
        b[0..4].copy_from_slice(&self.magic.to_le_bytes());
        b[4..8].copy_from_slice(&self.blocks.to_le_bytes());
        b[8..12].copy_from_slice(&self.unused_blocks.to_le_bytes());
        let info = b"simple file system";
        b[12..12 + info.len()].copy_from_slice(info);
        b
    }

    fn decode(b: &[u8]) -> Self {
        let word = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        Self {
            magic: word(0),
            blocks: word(4),
            unused_blocks: word(8),
        }
    }
}

/// Free-block bitmap; a set bit means in use.
struct Bitmap {
    bits: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    fn new(nbits: usize) -> Self {
        Self {
            bits: vec![0u64; nbits.div_ceil(64)],
            nbits,
        }
    }

    fn test(&self, i: usize) -> bool {
        self.bits[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        self.bits[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        self.bits[i / 64] &= !(1 << (i % 64));
    }

    fn alloc(&mut self) -> Option<usize> {
        for (w, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let i = w * 64 + bit;
                if i >= self.nbits {
                    return None;
                }
                *word |= 1 << bit;
                return Some(i);
            }
        }
        None
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() * 8);
        for w in &self.bits {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn from_bytes(b: &[u8], nbits: usize) -> Self {
        let mut bm = Self::new(nbits);
        for (w, chunk) in b.chunks(8).enumerate().take(bm.bits.len()) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            bm.bits[w] = u64::from_le_bytes(word);
        }
        bm
    }
}

/// Cached in-memory inode.
struct CachedInode {
    din: DiskInode,
    dirty: bool,
    ref_count: u32,
}

struct SearchHit {
    found: Option<(InodeNo, usize)>,
    empty_slot: usize,
}

/// The mounted filesystem instance.
pub struct Sfs {
    dev: Box<dyn BlockDevice>,
    sb: SuperBlock,
    super_dirty: bool,
    freemap: Bitmap,
    freemap_blocks: u32,
    cache: BTreeMap<InodeNo, CachedInode>,
}

impl Sfs {
    /// Write a fresh filesystem onto `dev` and mount it.
    pub fn format(dev: Box<dyn BlockDevice>) -> Result<Self, FsError> {
        assert_eq!(dev.block_size(), BLKSIZE, "sfs needs page-sized blocks");
        let nblocks = dev.block_count() as u32;
        let freemap_blocks = (nblocks as usize).div_ceil(BLKSIZE * 8) as u32;
        let data_start = BLKN_FREEMAP + freemap_blocks;
        assert!(nblocks > data_start + 2, "device too small for sfs");

        let mut freemap = Bitmap::new(nblocks as usize);
        for b in 0..data_start {
            freemap.set(b as usize);
        }
        let sb = SuperBlock {
            magic: SFS_MAGIC,
            blocks: nblocks,
            unused_blocks: nblocks - data_start,
        };

        let mut fs = Self {
            dev,
            sb,
            super_dirty: true,
            freemap,
            freemap_blocks,
            cache: BTreeMap::new(),
        };
        // Root directory inode with its self and parent entries.
        fs.insert_fresh(BLKN_ROOT, TYPE_DIR);
        fs.dirent_append(BLKN_ROOT, BLKN_ROOT, ".")?;
        fs.dirent_append(BLKN_ROOT, BLKN_ROOT, "..")?;
        fs.put_inode(BLKN_ROOT)?;
        fs.super_sync()?;
        debug!("sfs: formatted {} blocks ({} for metadata)", nblocks, data_start);
        Ok(fs)
    }

    /// Mount an existing filesystem.
    pub fn open(mut dev: Box<dyn BlockDevice>) -> Result<Self, FsError> {
        assert_eq!(dev.block_size(), BLKSIZE, "sfs needs page-sized blocks");
        let mut block = vec![0u8; BLKSIZE];
        dev.read_blocks(BLKN_SUPER as u64, &mut block)?;
        let sb = SuperBlock::decode(&block);
        if sb.magic != SFS_MAGIC {
            return Err(FsError::Io);
        }
        let freemap_blocks = (sb.blocks as usize).div_ceil(BLKSIZE * 8) as u32;
        let mut raw = vec![0u8; freemap_blocks as usize * BLKSIZE];
        dev.read_blocks(BLKN_FREEMAP as u64, &mut raw)?;
        let freemap = Bitmap::from_bytes(&raw, sb.blocks as usize);
        Ok(Self {
            dev,
            sb,
            super_dirty: false,
            freemap,
            freemap_blocks,
            cache: BTreeMap::new(),
        })
    }

    pub fn unused_blocks(&self) -> u32 {
        self.sb.unused_blocks
    }

    // ---- raw block IO ------------------------------------------------

    fn rblock(&mut self, blkno: u32) -> Result<Vec<u8>, FsError> {
        let mut buf = vec![0u8; BLKSIZE];
        self.dev.read_blocks(blkno as u64, &mut buf)?;
        Ok(buf)
    }

    fn wblock(&mut self, blkno: u32, data: &[u8]) -> Result<(), FsError> {
        debug_assert_eq!(data.len(), BLKSIZE);
        self.dev.write_blocks(blkno as u64, data)
    }

    fn rbuf(&mut self, blkno: u32, offset: usize, len: usize) -> Result<Vec<u8>, FsError> {
        let block = self.rblock(blkno)?;
        Ok(block[offset..offset + len].to_vec())
    }

    fn wbuf(&mut self, blkno: u32, offset: usize, data: &[u8]) -> Result<(), FsError> {
        let mut block = self.rblock(blkno)?;
        block[offset..offset + data.len()].copy_from_slice(data);
        self.wblock(blkno, &block)
    }

    fn clear_block(&mut self, blkno: u32) -> Result<(), FsError> {
        self.wblock(blkno, &vec![0u8; BLKSIZE])
    }

    // ---- block allocation --------------------------------------------

    fn block_inuse(&self, blkno: u32) -> bool {
        assert!(
            blkno != 0 && blkno < self.sb.blocks,
            "block number {} out of range",
            blkno
        );
        self.freemap.test(blkno as usize)
    }

    /// Allocate and zero one block. Superblock sync failures surface here
    /// instead of being dropped.
    fn block_alloc(&mut self) -> Result<u32, FsError> {
        let blkno = self.freemap.alloc().ok_or(FsError::NoSpace)? as u32;
        assert!(self.sb.unused_blocks > 0, "freemap out of sync with superblock");
        self.sb.unused_blocks -= 1;
        self.super_dirty = true;
        self.super_sync()?;
        self.clear_block(blkno)?;
        Ok(blkno)
    }

    fn block_free(&mut self, blkno: u32) -> Result<(), FsError> {
        assert!(self.block_inuse(blkno), "freeing free block {}", blkno);
        self.freemap.clear(blkno as usize);
        self.sb.unused_blocks += 1;
        self.super_dirty = true;
        self.super_sync()
    }

    fn super_sync(&mut self) -> Result<(), FsError> {
        if !self.super_dirty {
            return Ok(());
        }
        self.super_dirty = false;
        let mut block = vec![0u8; BLKSIZE];
        block[..44].copy_from_slice(&self.sb.encode());
        if let Err(e) = self.wblock(BLKN_SUPER, &block) {
            self.super_dirty = true;
            return Err(e);
        }
        let mut raw = self.freemap.to_bytes();
        raw.resize(self.freemap_blocks as usize * BLKSIZE, 0);
        if let Err(e) = self.dev.write_blocks(BLKN_FREEMAP as u64, &raw) {
            self.super_dirty = true;
            return Err(e);
        }
        Ok(())
    }

    // ---- inode cache -------------------------------------------------

    fn din(&self, ino: InodeNo) -> DiskInode {
        self.cache
            .get(&ino)
            .unwrap_or_else(|| panic!("inode {} not loaded", ino))
            .din
    }

    fn update_din(&mut self, ino: InodeNo, din: DiskInode) {
        let entry = self
            .cache
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("inode {} not loaded", ino));
        entry.din = din;
        entry.dirty = true;
    }

    fn sync_inode(&mut self, ino: InodeNo) -> Result<(), FsError> {
        let Some(entry) = self.cache.get(&ino) else {
            return Ok(());
        };
        if !entry.dirty {
            return Ok(());
        }
        let image = entry.din.encode();
        self.wbuf(ino, 0, &image)?;
        self.cache.get_mut(&ino).unwrap().dirty = false;
        Ok(())
    }

    fn insert_fresh(&mut self, ino: InodeNo, type_: u16) {
        let old = self.cache.insert(
            ino,
            CachedInode {
                din: DiskInode::empty(type_),
                dirty: true,
                ref_count: 1,
            },
        );
        assert!(old.is_none(), "fresh inode {} already cached", ino);
    }

    /// Reference count of a cached inode, for diagnostics and tests.
    pub fn inode_refs(&self, ino: InodeNo) -> u32 {
        self.cache.get(&ino).map(|e| e.ref_count).unwrap_or(0)
    }

    // ---- block map ---------------------------------------------------

    /// Block number for file-block `index`, allocating it (and the indirect
    /// block) when `create` is set.
    fn bmap_get(&mut self, ino: InodeNo, index: usize, create: bool) -> Result<u32, FsError> {
        let mut din = self.din(ino);
        if index < NDIRECT {
            let mut blk = din.direct[index];
            if blk == 0 && create {
                blk = self.block_alloc()?;
                din.direct[index] = blk;
                self.update_din(ino, din);
            }
            return Ok(blk);
        }
        let index = index - NDIRECT;
        if index >= BLK_NENTRY {
            return Err(FsError::FileTooLarge);
        }
        let mut ent = din.indirect;
        if ent == 0 {
            if !create {
                return Ok(0);
            }
            ent = self.block_alloc()?;
            din.indirect = ent;
            self.update_din(ino, din);
        }
        let off = index * 4;
        let raw = self.rbuf(ent, off, 4)?;
        let mut blk = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if blk == 0 && create {
            blk = self.block_alloc()?;
            if let Err(e) = self.wbuf(ent, off, &blk.to_le_bytes()) {
                let _ = self.block_free(blk);
                return Err(e);
            }
        }
        Ok(blk)
    }

    /// Like `bmap_get`, but treats `index == blocks` as file growth.
    fn bmap_load(&mut self, ino: InodeNo, index: usize) -> Result<u32, FsError> {
        let mut din = self.din(ino);
        if index > din.blocks as usize {
            return Err(FsError::InvalidOffset);
        }
        let create = index == din.blocks as usize;
        let blk = self.bmap_get(ino, index, create)?;
        assert!(self.block_inuse(blk), "bmap handed out a free block");
        if create {
            din = self.din(ino);
            din.blocks += 1;
            self.update_din(ino, din);
        }
        Ok(blk)
    }

    /// Free file-block `index` if mapped.
    fn bmap_free(&mut self, ino: InodeNo, index: usize) -> Result<(), FsError> {
        let mut din = self.din(ino);
        if index < NDIRECT {
            let blk = din.direct[index];
            if blk != 0 {
                self.block_free(blk)?;
                din.direct[index] = 0;
                self.update_din(ino, din);
            }
            return Ok(());
        }
        let index = index - NDIRECT;
        let ent = din.indirect;
        if ent == 0 || index >= BLK_NENTRY {
            return Ok(());
        }
        let off = index * 4;
        let raw = self.rbuf(ent, off, 4)?;
        let blk = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if blk != 0 {
            self.wbuf(ent, off, &0u32.to_le_bytes())?;
            self.block_free(blk)?;
        }
        Ok(())
    }

    fn bmap_truncate(&mut self, ino: InodeNo) -> Result<(), FsError> {
        let mut din = self.din(ino);
        assert!(din.blocks > 0, "truncating an empty block map");
        self.bmap_free(ino, din.blocks as usize - 1)?;
        din = self.din(ino);
        din.blocks -= 1;
        self.update_din(ino, din);
        Ok(())
    }

    fn truncate_inner(&mut self, ino: InodeNo, len: u32) -> Result<(), FsError> {
        if len > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let target_blocks = (len as usize).div_ceil(BLKSIZE);
        let mut din = self.din(ino);
        if din.size == len {
            return Ok(());
        }
        while (din.blocks as usize) < target_blocks {
            self.bmap_load(ino, din.blocks as usize)?;
            din = self.din(ino);
        }
        while (din.blocks as usize) > target_blocks {
            self.bmap_truncate(ino)?;
            din = self.din(ino);
        }
        din.size = len;
        self.update_din(ino, din);
        Ok(())
    }

    // ---- directory entries -------------------------------------------

    fn dirent_decode(raw: &[u8]) -> (InodeNo, String) {
        let ino = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let name_bytes = &raw[4..];
        let len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_FNAME_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();
        (ino, name)
    }

    fn dirent_read(&mut self, dir: InodeNo, slot: usize) -> Result<(InodeNo, String), FsError> {
        let din = self.din(dir);
        assert!(din.type_ == TYPE_DIR, "dirent read on non-directory");
        assert!(slot < din.blocks as usize, "dirent slot out of range");
        let blk = self.bmap_load(dir, slot)?;
        let raw = self.rbuf(blk, 0, DIRENT_BYTES)?;
        Ok(Self::dirent_decode(&raw))
    }

    fn dirent_write(
        &mut self,
        dir: InodeNo,
        slot: usize,
        ino: InodeNo,
        name: &str,
    ) -> Result<(), FsError> {
        assert!(name.len() <= MAX_FNAME_LEN);
        let blk = self.bmap_load(dir, slot)?;
        let mut raw = vec![0u8; BLKSIZE];
        raw[0..4].copy_from_slice(&ino.to_le_bytes());
        raw[4..4 + name.len()].copy_from_slice(name.as_bytes());
        self.wblock(blk, &raw)
    }

    /// Scan a directory for `name`, also reporting a reusable hole.
    fn dirent_search(&mut self, dir: InodeNo, name: &str) -> Result<SearchHit, FsError> {
        let nslots = self.din(dir).blocks as usize;
        let mut hit = SearchHit {
            found: None,
            empty_slot: nslots,
        };
        for slot in 0..nslots {
            let (ino, ent_name) = self.dirent_read(dir, slot)?;
            if ino == 0 {
                if hit.empty_slot == nslots {
                    hit.empty_slot = slot;
                }
                continue;
            }
            if ent_name == name {
                hit.found = Some((ino, slot));
                break;
            }
        }
        Ok(hit)
    }

    /// Link `target` under `name` at `slot`, adjusting sizes and link counts.
    fn dirent_link_at(
        &mut self,
        dir: InodeNo,
        slot: usize,
        target: InodeNo,
        name: &str,
    ) -> Result<(), FsError> {
        self.dirent_write(dir, slot, target, name)?;
        let mut ddin = self.din(dir);
        ddin.size += DIRENT_ACCOUNTING;
        self.update_din(dir, ddin);

        let t = self.load_inode(target)?;
        let mut tdin = self.din(t);
        tdin.nlinks += 1;
        self.update_din(t, tdin);
        self.put_inode(t)
    }

    fn dirent_append(&mut self, dir: InodeNo, target: InodeNo, name: &str) -> Result<(), FsError> {
        let slot = self.din(dir).blocks as usize;
        self.dirent_link_at(dir, slot, target, name)
    }

    /// Clear the entry at `slot` (which names `target`), adjusting counts.
    fn dirent_unlink_at(
        &mut self,
        dir: InodeNo,
        slot: usize,
        target: InodeNo,
    ) -> Result<(), FsError> {
        let blk = self.bmap_load(dir, slot)?;
        self.clear_block(blk)?;
        let mut ddin = self.din(dir);
        ddin.size -= DIRENT_ACCOUNTING;

        let t = self.load_inode(target)?;
        let mut tdin = self.din(t);
        assert!(tdin.nlinks > 0, "nlinks underflow on inode {}", t);
        tdin.nlinks -= 1;
        // Dropping a subdirectory also drops its ".." reference to us.
        if tdin.type_ == TYPE_DIR {
            ddin.nlinks -= 1;
        }
        self.update_din(dir, ddin);
        self.update_din(t, tdin);
        self.put_inode(t)
    }

    fn require_dir(&mut self, ino: InodeNo) -> Result<(), FsError> {
        match self.din(ino).type_ {
            TYPE_DIR => Ok(()),
            TYPE_FILE => Err(FsError::NotADirectory),
            other => panic!("inode {} has invalid on-disk type {}", ino, other),
        }
    }

    fn name_of_child(&mut self, dir: InodeNo, child: InodeNo) -> Result<String, FsError> {
        let nslots = self.din(dir).blocks as usize;
        for slot in 0..nslots {
            let (ino, name) = self.dirent_read(dir, slot)?;
            if ino == child {
                return Ok(name);
            }
        }
        Err(FsError::NotFound)
    }
}

impl Filesystem for Sfs {
    fn root(&self) -> InodeNo {
        BLKN_ROOT
    }

    fn load_inode(&mut self, ino: InodeNo) -> Result<InodeNo, FsError> {
        if let Some(entry) = self.cache.get_mut(&ino) {
            entry.ref_count += 1;
            return Ok(ino);
        }
        assert!(self.block_inuse(ino), "loading inode from free block {}", ino);
        let raw = self.rbuf(ino, 0, 64)?;
        let din = DiskInode::decode(&raw);
        assert!(din.nlinks != 0, "on-disk inode {} has zero links", ino);
        if din.type_ != TYPE_FILE && din.type_ != TYPE_DIR {
            panic!("inode {} has invalid on-disk type {}", ino, din.type_);
        }
        self.cache.insert(
            ino,
            CachedInode {
                din,
                dirty: false,
                ref_count: 1,
            },
        );
        Ok(ino)
    }

    fn put_inode(&mut self, ino: InodeNo) -> Result<(), FsError> {
        let entry = self
            .cache
            .get_mut(&ino)
            .unwrap_or_else(|| panic!("putting unloaded inode {}", ino));
        assert!(entry.ref_count > 0, "inode {} refcount underflow", ino);
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }
        // Last reference: reclaim.
        let din = self.din(ino);
        if din.nlinks == 0 {
            self.truncate_inner(ino, 0)?;
        }
        self.sync_inode(ino)?;
        let din = self.din(ino);
        self.cache.remove(&ino);
        if din.nlinks == 0 {
            if din.indirect != 0 {
                self.block_free(din.indirect)?;
            }
            self.block_free(ino)?;
            debug!("sfs: reclaimed inode {}", ino);
        }
        Ok(())
    }

    fn gettype(&mut self, ino: InodeNo) -> Result<InodeType, FsError> {
        match self.din(ino).type_ {
            TYPE_FILE => Ok(InodeType::File),
            TYPE_DIR => Ok(InodeType::Dir),
            other => panic!("inode {} has invalid on-disk type {}", ino, other),
        }
    }

    fn read(&mut self, ino: InodeNo, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        let din = self.din(ino);
        if din.type_ == TYPE_DIR {
            return Err(FsError::IsADirectory);
        }
        if offset >= MAX_FILE_SIZE {
            return Err(FsError::InvalidOffset);
        }
        if offset >= din.size || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset as usize + buf.len()).min(din.size as usize);
        let mut pos = offset as usize;
        let mut done = 0;
        while pos < end {
            let index = pos / BLKSIZE;
            let in_blk = pos % BLKSIZE;
            let chunk = (BLKSIZE - in_blk).min(end - pos);
            let blk = self.bmap_load(ino, index)?;
            let data = self.rbuf(blk, in_blk, chunk)?;
            buf[done..done + chunk].copy_from_slice(&data);
            pos += chunk;
            done += chunk;
        }
        Ok(done)
    }

    fn write(&mut self, ino: InodeNo, offset: u32, buf: &[u8]) -> Result<usize, FsError> {
        let din = self.din(ino);
        if din.type_ == TYPE_DIR {
            return Err(FsError::IsADirectory);
        }
        if offset >= MAX_FILE_SIZE {
            return Err(FsError::InvalidOffset);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = (offset as usize + buf.len()).min(MAX_FILE_SIZE as usize);
        let mut pos = offset as usize;
        let mut done = 0;
        while pos < end {
            let index = pos / BLKSIZE;
            let in_blk = pos % BLKSIZE;
            let chunk = (BLKSIZE - in_blk).min(end - pos);
            let blk = self.bmap_load(ino, index)?;
            if chunk == BLKSIZE {
                self.wblock(blk, &buf[done..done + chunk])?;
            } else {
                self.wbuf(blk, in_blk, &buf[done..done + chunk])?;
            }
            pos += chunk;
            done += chunk;
        }
        let mut din = self.din(ino);
        if (offset as usize + done) as u32 > din.size {
            din.size = (offset as usize + done) as u32;
            self.update_din(ino, din);
        }
        Ok(done)
    }

    fn lookup(&mut self, dir: InodeNo, path: &str) -> Result<InodeNo, FsError> {
        let mut cur = self.load_inode(dir)?;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if comp.len() > MAX_FNAME_LEN {
                self.put_inode(cur)?;
                return Err(FsError::InvalidPath);
            }
            if let Err(e) = self.require_dir(cur) {
                self.put_inode(cur)?;
                return Err(e);
            }
            let hit = match self.dirent_search(cur, comp) {
                Ok(h) => h,
                Err(e) => {
                    self.put_inode(cur)?;
                    return Err(e);
                }
            };
            let Some((next_ino, _)) = hit.found else {
                self.put_inode(cur)?;
                return Err(FsError::NotFound);
            };
            let next = self.load_inode(next_ino)?;
            self.put_inode(cur)?;
            cur = next;
        }
        Ok(cur)
    }

    fn lookup_parent(
        &mut self,
        dir: InodeNo,
        path: &str,
    ) -> Result<(InodeNo, String), FsError> {
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((&last, rest)) = comps.split_last() else {
            return Err(FsError::InvalidPath);
        };
        if last.len() > MAX_FNAME_LEN {
            return Err(FsError::InvalidPath);
        }
        let mut cur = self.load_inode(dir)?;
        for comp in rest {
            if let Err(e) = self.require_dir(cur) {
                self.put_inode(cur)?;
                return Err(e);
            }
            let hit = match self.dirent_search(cur, comp) {
                Ok(h) => h,
                Err(e) => {
                    self.put_inode(cur)?;
                    return Err(e);
                }
            };
            let Some((next_ino, _)) = hit.found else {
                self.put_inode(cur)?;
                return Err(FsError::NotFound);
            };
            let next = self.load_inode(next_ino)?;
            self.put_inode(cur)?;
            cur = next;
        }
        if let Err(e) = self.require_dir(cur) {
            self.put_inode(cur)?;
            return Err(e);
        }
        Ok((cur, String::from(last)))
    }

    fn create(&mut self, dir: InodeNo, name: &str, excl: bool) -> Result<InodeNo, FsError> {
        self.require_dir(dir)?;
        if name.is_empty() || name.len() > MAX_FNAME_LEN {
            return Err(FsError::InvalidPath);
        }
        let hit = self.dirent_search(dir, name)?;
        if let Some((existing, _)) = hit.found {
            if excl {
                return Err(FsError::Exists);
            }
            return self.load_inode(existing);
        }
        let ino = self.block_alloc()?;
        self.insert_fresh(ino, TYPE_FILE);
        if let Err(e) = self.dirent_link_at(dir, hit.empty_slot, ino, name) {
            self.cache.remove(&ino);
            let _ = self.block_free(ino);
            return Err(e);
        }
        debug!("sfs: created '{}' as inode {}", name, ino);
        Ok(ino)
    }

    fn mkdir(&mut self, dir: InodeNo, name: &str) -> Result<(), FsError> {
        self.require_dir(dir)?;
        if name.is_empty() || name.len() > MAX_FNAME_LEN {
            return Err(FsError::InvalidPath);
        }
        let hit = self.dirent_search(dir, name)?;
        if hit.found.is_some() {
            return Err(FsError::Exists);
        }
        let ino = self.block_alloc()?;
        self.insert_fresh(ino, TYPE_DIR);
        let built = (|fs: &mut Self| -> Result<(), FsError> {
            fs.dirent_link_at(dir, hit.empty_slot, ino, name)?;
            fs.dirent_link_at(ino, 0, ino, ".")?;
            fs.dirent_link_at(ino, 1, dir, "..")?;
            Ok(())
        })(self);
        if let Err(e) = built {
            self.cache.remove(&ino);
            let _ = self.block_free(ino);
            return Err(e);
        }
        self.put_inode(ino)
    }

    fn link(&mut self, dir: InodeNo, name: &str, target: InodeNo) -> Result<(), FsError> {
        self.require_dir(dir)?;
        if name.is_empty() || name.len() > MAX_FNAME_LEN {
            return Err(FsError::InvalidPath);
        }
        // Hard links to directories would corrupt the ".." accounting.
        let t = self.load_inode(target)?;
        let is_dir = self.din(t).type_ == TYPE_DIR;
        self.put_inode(t)?;
        if is_dir {
            return Err(FsError::IsADirectory);
        }
        let hit = self.dirent_search(dir, name)?;
        if hit.found.is_some() {
            return Err(FsError::Exists);
        }
        self.dirent_link_at(dir, hit.empty_slot, target, name)
    }

    fn unlink(&mut self, dir: InodeNo, name: &str) -> Result<(), FsError> {
        self.require_dir(dir)?;
        if name == "." || name == ".." {
            return Err(FsError::NotEmpty);
        }
        let hit = self.dirent_search(dir, name)?;
        let Some((target, slot)) = hit.found else {
            return Err(FsError::NotFound);
        };
        self.dirent_unlink_at(dir, slot, target)
    }

    fn rename(
        &mut self,
        old_dir: InodeNo,
        old_name: &str,
        new_dir: InodeNo,
        new_name: &str,
    ) -> Result<(), FsError> {
        self.require_dir(old_dir)?;
        self.require_dir(new_dir)?;
        if old_name == "." || old_name == ".." {
            return Err(FsError::NotEmpty);
        }
        let hit = self.dirent_search(old_dir, old_name)?;
        let Some((target, old_slot)) = hit.found else {
            return Err(FsError::NotFound);
        };
        // Directory renames would have to rewrite "..""; not supported.
        let t = self.load_inode(target)?;
        let is_dir = self.din(t).type_ == TYPE_DIR;
        self.put_inode(t)?;
        if is_dir {
            return Err(FsError::IsADirectory);
        }
        let new_hit = self.dirent_search(new_dir, new_name)?;
        if new_hit.found.is_some() {
            return Err(FsError::Exists);
        }
        self.dirent_link_at(new_dir, new_hit.empty_slot, target, new_name)?;
        self.dirent_unlink_at(old_dir, old_slot, target)
    }

    fn truncate(&mut self, ino: InodeNo, len: u32) -> Result<(), FsError> {
        self.truncate_inner(ino, len)
    }

    fn fsync(&mut self, ino: InodeNo) -> Result<(), FsError> {
        self.sync_inode(ino)
    }

    fn stat(&mut self, ino: InodeNo) -> Result<Stat, FsError> {
        let din = self.din(ino);
        Ok(Stat {
            mode: self.gettype(ino)?,
            nlinks: din.nlinks,
            blocks: din.blocks,
            size: din.size,
        })
    }

    fn getdirentry(&mut self, dir: InodeNo, slot: usize) -> Result<String, FsError> {
        self.require_dir(dir)?;
        let nslots = self.din(dir).blocks as usize;
        let mut live = 0;
        for s in 0..nslots {
            let (ino, name) = self.dirent_read(dir, s)?;
            if ino == 0 {
                continue;
            }
            if live == slot {
                return Ok(name);
            }
            live += 1;
        }
        Err(FsError::NotFound)
    }

    fn dir_path(&mut self, ino: InodeNo) -> Result<String, FsError> {
        self.require_dir(ino)?;
        let mut parts: Vec<String> = Vec::new();
        let mut cur = self.load_inode(ino)?;
        loop {
            let parent = self.lookup(cur, "..")?;
            if parent == cur {
                self.put_inode(parent)?;
                self.put_inode(cur)?;
                break;
            }
            let name = match self.name_of_child(parent, cur) {
                Ok(n) => n,
                Err(e) => {
                    self.put_inode(parent)?;
                    self.put_inode(cur)?;
                    return Err(e);
                }
            };
            parts.push(name);
            self.put_inode(cur)?;
            cur = parent;
        }
        let mut path = String::from("/");
        for (i, part) in parts.iter().rev().enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(part);
        }
        Ok(path)
    }

    fn sync(&mut self) -> Result<(), FsError> {
        let inos: Vec<InodeNo> = self.cache.keys().copied().collect();
        for ino in inos {
            self.sync_inode(ino)?;
        }
        self.super_dirty = true;
        self.super_sync()
    }
}

//! Block device abstraction.

extern crate alloc;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;

/// A fixed-block-size storage device.
pub trait BlockDevice: Send {
    fn name(&self) -> &str;

    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Read whole blocks starting at `start_block`; `buffer` length must be
    /// a multiple of the block size.
    fn read_blocks(&mut self, start_block: u64, buffer: &mut [u8]) -> Result<(), FsError>;

    /// Write whole blocks starting at `start_block`.
    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> Result<(), FsError>;

    fn flush(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}

/// RAM-backed block device, used for the disk image in tests and as the
/// swap area.
pub struct RamBlockDevice {
    name: String,
    block_size: usize,
    data: Vec<u8>,
}

impl RamBlockDevice {
    pub fn new(name: String, block_size: usize, block_count: u64) -> Self {
        let size = block_size * block_count as usize;
        Self {
            name,
            block_size,
            data: vec![0u8; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl BlockDevice for RamBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read_blocks(&mut self, start_block: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        let start = start_block as usize * self.block_size;
        let end = start + buffer.len();
        if buffer.len() % self.block_size != 0 || end > self.data.len() {
            return Err(FsError::Io);
        }
        buffer.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> Result<(), FsError> {
        let start = start_block as usize * self.block_size;
        let end = start + buffer.len();
        if buffer.len() % self.block_size != 0 || end > self.data.len() {
            return Err(FsError::Io);
        }
        self.data[start..end].copy_from_slice(buffer);
        Ok(())
    }
}

/// Sparse RAM-backed device: blocks materialize on first write. Suits the
/// swap area, whose slot numbers are derived from virtual page numbers and
/// therefore span the whole user region while only a few are ever used.
pub struct SparseRamDevice {
    name: String,
    block_size: usize,
    block_count: u64,
    blocks: alloc::collections::BTreeMap<u64, Vec<u8>>,
}

impl SparseRamDevice {
    pub fn new(name: String, block_size: usize, block_count: u64) -> Self {
        Self {
            name,
            block_size,
            block_count,
            blocks: alloc::collections::BTreeMap::new(),
        }
    }

    /// Blocks actually materialized.
    pub fn populated(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockDevice for SparseRamDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&mut self, start_block: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        if buffer.len() % self.block_size != 0 {
            return Err(FsError::Io);
        }
        let n = (buffer.len() / self.block_size) as u64;
        if start_block + n > self.block_count {
            return Err(FsError::Io);
        }
        for i in 0..n {
            let chunk = &mut buffer
                [(i as usize) * self.block_size..(i as usize + 1) * self.block_size];
            match self.blocks.get(&(start_block + i)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> Result<(), FsError> {
        if buffer.len() % self.block_size != 0 {
            return Err(FsError::Io);
        }
        let n = (buffer.len() / self.block_size) as u64;
        if start_block + n > self.block_count {
            return Err(FsError::Io);
        }
        for i in 0..n {
            let chunk =
                &buffer[(i as usize) * self.block_size..(i as usize + 1) * self.block_size];
            self.blocks.insert(start_block + i, chunk.to_vec());
        }
        Ok(())
    }
}

//! The module containing the translation table pool: a bitmap-tracked,
//! fixed-size memory region all L1/L2 tables are carved from.

use super::descriptor::TTBL_MIN_SIZE;
use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;
use bit_vec::BitVec;

/// A block handed out by the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolBlock {
    /// Byte offset of the block inside the pool region.
    pub offset: usize,
    /// Physical address of the block.
    pub pa: u32,
}

/// The table pool. The backing storage is owned by the pool and
/// zero-initialized; the physical base the hardware will see is supplied
/// by the embedder at construction.
pub struct TablePool {
    /// Backing storage for every table, in descriptor-sized words.
    mem: Vec<u32>,
    /// Physical address of `mem[0]`.
    base_pa: u32,
    /// One bit per [`TTBL_MIN_SIZE`] granule; set means in use.
    bmap: BitVec,
}

impl TablePool {
    /// Creates a pool of `size` bytes whose first byte has physical
    /// address `base_pa`. Both must be multiples of the granule.
    pub fn new(base_pa: u32, size: usize) -> Result<Self> {
        if size == 0
            || size % TTBL_MIN_SIZE != 0
            || (base_pa as usize) % TTBL_MIN_SIZE != 0
        {
            return Err(Error::Invalid);
        }
        Ok(Self {
            mem: vec![0u32; size / 4],
            base_pa,
            bmap: BitVec::from_elem(size / TTBL_MIN_SIZE, false),
        })
    }

    /// Allocates `size` bytes (rounded up to whole granules) by first-fit
    /// over contiguous free granules. The returned block is zeroed.
    pub fn alloc(&mut self, size: usize) -> Result<PoolBlock> {
        let bcnt = size.div_ceil(TTBL_MIN_SIZE);
        let total = self.bmap.len();
        let mut bpos = 0;
        while bpos + bcnt <= total {
            let mut bfree = 0;
            for i in bpos..bpos + bcnt {
                if self.bmap.get(i).unwrap_or(true) {
                    break;
                }
                bfree += 1;
            }
            if bfree == bcnt {
                for i in bpos..bpos + bcnt {
                    self.bmap.set(i, true);
                }
                let offset = bpos * TTBL_MIN_SIZE;
                self.mem[offset / 4..offset / 4 + bcnt * TTBL_MIN_SIZE / 4].fill(0);
                return Ok(PoolBlock {
                    offset,
                    pa: self.base_pa + offset as u32,
                });
            }
            bpos += bcnt;
        }
        Err(Error::NoMem)
    }

    /// Returns a block of `size` bytes at `offset` to the pool.
    pub fn free(&mut self, offset: usize, size: usize) -> Result<()> {
        if offset % TTBL_MIN_SIZE != 0 || offset + size > self.mem.len() * 4 {
            return Err(Error::Fail);
        }
        let bcnt = size.div_ceil(TTBL_MIN_SIZE);
        let bpos = offset / TTBL_MIN_SIZE;
        for i in bpos..bpos + bcnt {
            self.bmap.set(i, false);
        }
        Ok(())
    }

    /// Physical base address of the pool region.
    pub fn base_pa(&self) -> u32 {
        self.base_pa
    }

    /// Size of the pool region in bytes.
    pub fn size(&self) -> usize {
        self.mem.len() * 4
    }

    /// Borrows the words of a block.
    pub fn table(&self, offset: usize, size: usize) -> &[u32] {
        &self.mem[offset / 4..(offset + size) / 4]
    }

    /// Mutably borrows the words of a block.
    pub fn table_mut(&mut self, offset: usize, size: usize) -> &mut [u32] {
        &mut self.mem[offset / 4..(offset + size) / 4]
    }

    /// Zeroes the words of a block.
    pub fn zero(&mut self, offset: usize, size: usize) {
        self.table_mut(offset, size).fill(0);
    }
}

//! The module containing the IO page-table allocator: ARMv7
//! short-descriptor tables used to map IOVA ranges to host-physical
//! ranges for DMA-capable devices behind an IOMMU.
//!
//! Two levels: 4096 L1 entries of 1 MiB, 256 L2 entries of 4 KiB, plus
//! the contiguous encodings (16 MiB supersections, 64 KiB large pages)
//! which repeat one entry sixteen times. The allocator never touches
//! hardware TLBs itself; the caller supplies an [`IoTlbOps`]
//! implementation and the allocator tells it what to invalidate.
//!
//! Interior tables live in a slab owned by the allocator and table
//! descriptors carry slab indices rather than raw pointers; leaf
//! descriptors carry real output addresses.

use crate::error::{Error, Result};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use log::{info, warn};

/// 4 KiB.
pub const SZ_4K: u64 = 0x1000;
/// 64 KiB.
pub const SZ_64K: u64 = 0x1_0000;
/// 1 MiB.
pub const SZ_1M: u64 = 0x10_0000;
/// 16 MiB.
pub const SZ_16M: u64 = 0x100_0000;

/// Mapping permission and attribute bits.
pub mod prot {
    /// Device may read.
    pub const READ: u32 = 1 << 0;
    /// Device may write.
    pub const WRITE: u32 = 1 << 1;
    /// Map with device memory attributes.
    pub const MMIO: u32 = 1 << 2;
    /// Map cacheable.
    pub const CACHE: u32 = 1 << 3;
    /// Execute-never.
    pub const NOEXEC: u32 = 1 << 4;
}

/// Format quirks a caller may request at allocation time.
pub mod quirks {
    /// Set the non-secure bits in table and section descriptors.
    pub const ARM_NS: u32 = 1 << 0;
    /// Encode no access permissions at all.
    pub const NO_PERMS: u32 = 1 << 1;
    /// Invalidate the TLB on map as well as unmap.
    pub const TLBI_ON_MAP: u32 = 1 << 2;
    /// The MediaTek 4 GB output-address extension; requires
    /// [`NO_PERMS`].
    pub const ARM_MTK_4GB: u32 = 1 << 3;

    /// Every quirk this format understands.
    pub const SUPPORTED: u32 = ARM_NS | NO_PERMS | TLBI_ON_MAP | ARM_MTK_4GB;
}

/// The three TLB maintenance callbacks the caller provides. `add_flush`
/// gathers an invalidation; `sync` drains the gather.
pub trait IoTlbOps {
    /// Invalidates the whole IOTLB.
    fn flush_all(&self);

    /// Gathers an invalidation of `size` bytes at `iova` with the given
    /// granule; `leaf` says whether the invalidated entry was a leaf or
    /// a table.
    fn add_flush(&self, iova: u64, size: u64, granule: u64, leaf: bool);

    /// Waits for gathered invalidations to complete.
    fn sync(&self);
}

/// Configuration of one IO page table.
#[derive(Clone, Copy, Debug)]
pub struct IoPageTableCfg {
    /// Input (IOVA) address size in bits; at most 32.
    pub ias: u32,
    /// Output address size in bits; at most 32.
    pub oas: u32,
    /// Combination of [`quirks`] values.
    pub quirks: u32,
    /// Supported page sizes; masked to the four the format has.
    pub pgsize_bitmap: u64,
}

/// The register images a driver programs into its IOMMU: TTBR pair,
/// translation control and memory-remap registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct V7sRegisters {
    /// Translation table bases. Only `ttbr[0]` is used.
    pub ttbr: [u32; 2],
    /// Translation control register.
    pub tcr: u32,
    /// Primary region remap register.
    pub prrr: u32,
    /// Normal memory remap register.
    pub nmrr: u32,
}

const ADDR_BITS: u32 = 32;
const TABLE_SHIFT: u32 = 10;
const CONT_PAGES: u32 = 16;

const PTE_TYPE_TABLE: u32 = 0x1;
const PTE_TYPE_PAGE: u32 = 0x2;
const PTE_TYPE_CONT_PAGE: u32 = 0x1;

const ATTR_B: u32 = 1 << 2;
const ATTR_C: u32 = 1 << 3;
const ATTR_NS_TABLE: u32 = 1 << 3;
const ATTR_NS_SECTION: u32 = 1 << 19;
const ATTR_MTK_4GB: u32 = 1 << 9;

const CONT_SECTION: u32 = 1 << 18;
const CONT_PAGE_XN_SHIFT: u32 = 15;
const CONT_PAGE_TEX_SHIFT: u32 = 6;
const CONT_PAGE_TEX_MASK: u32 = 0x7 << CONT_PAGE_TEX_SHIFT;

// Attribute bits relative to the 8-bit block at ATTR_SHIFT(lvl).
const ATTR_AP0: u32 = 1 << 0;
const ATTR_AP1: u32 = 1 << 1;
const ATTR_AP2: u32 = 1 << 5;
const ATTR_S: u32 = 1 << 6;
const ATTR_NG: u32 = 1 << 7;
const TEX_SHIFT: u32 = 2;
const TEX_MASK: u32 = 0x7;

const PTE_AF: u32 = ATTR_AP0;
const PTE_AP_UNPRIV: u32 = ATTR_AP1;
const PTE_AP_RDONLY: u32 = ATTR_AP2;

const RGN_NC: u32 = 0;
const RGN_WBWA: u32 = 1;

const PRRR_TYPE_DEVICE: u32 = 1;
const PRRR_TYPE_NORMAL: u32 = 2;
const PRRR_DS0: u32 = 1 << 16;
const PRRR_DS1: u32 = 1 << 17;
const PRRR_NS1: u32 = 1 << 19;

const TTBR_S: u32 = 1 << 1;
const TTBR_NOS: u32 = 1 << 5;

const TCR_PD1: u32 = 1 << 5;

/// Synthetic physical address of the top-level table.
const PGD_PA: u32 = 1 << TABLE_SHIFT;

fn lvl_shift(lvl: u32) -> u32 {
    ADDR_BITS - (4 + 8 * lvl)
}

fn lvl_bits(lvl: u32) -> u32 {
    16 - lvl * 4
}

fn ptes_per_lvl(lvl: u32) -> usize {
    1 << lvl_bits(lvl)
}

fn block_size(lvl: u32) -> u64 {
    1u64 << lvl_shift(lvl)
}

fn lvl_mask(lvl: u32) -> u32 {
    !0u32 << lvl_shift(lvl)
}

const TABLE_MASK: u32 = !0u32 << TABLE_SHIFT;

fn lvl_idx(addr: u64, lvl: u32) -> usize {
    ((addr >> lvl_shift(lvl)) as usize) & (ptes_per_lvl(lvl) - 1)
}

fn attr_shift(lvl: u32) -> u32 {
    16 - lvl * 6
}

fn attr_xn(lvl: u32) -> u32 {
    1 << (4 * (2 - lvl))
}

fn prrr_tr(n: u32, mtype: u32) -> u32 {
    (mtype & 0x3) << (n * 2)
}

fn prrr_nos(n: u32) -> u32 {
    1 << (n + 24)
}

fn nmrr_ir(n: u32, attr: u32) -> u32 {
    (attr & 0x3) << (n * 2)
}

fn nmrr_or(n: u32, attr: u32) -> u32 {
    (attr & 0x3) << (n * 2 + 16)
}

fn ttbr_irgn(attr: u32) -> u32 {
    ((attr & 0x1) << 6) | ((attr & 0x2) >> 1)
}

fn ttbr_orgn(attr: u32) -> u32 {
    (attr & 0x3) << 3
}

fn pte_is_valid(pte: u32) -> bool {
    pte & 0x3 != 0
}

fn pte_is_table(pte: u32, lvl: u32) -> bool {
    lvl == 1 && (pte & PTE_TYPE_TABLE != 0) && (pte & PTE_TYPE_PAGE == 0)
}

/// A reference to one table in the walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TableRef {
    Pgd,
    L2(usize),
}

/// One allocated IO page table and its mutation operations.
pub struct IoPageTable {
    cfg: IoPageTableCfg,
    tlb: Box<dyn IoTlbOps + Send>,
    pgd: Vec<u32>,
    tables: Vec<Option<Box<[u32; 256]>>>,
    free_tables: Vec<usize>,
    regs: V7sRegisters,
}

impl IoPageTable {
    /// Validates `cfg` and builds an empty table. The returned object's
    /// [`IoPageTable::registers`] carry the TTBR0/TCR/PRRR/NMRR images
    /// for the caller.
    pub fn alloc(cfg: IoPageTableCfg, tlb: Box<dyn IoTlbOps + Send>) -> Result<Self> {
        if cfg.ias > ADDR_BITS || cfg.oas > ADDR_BITS {
            return Err(Error::Invalid);
        }
        if cfg.quirks & !quirks::SUPPORTED != 0 {
            return Err(Error::Invalid);
        }
        // The 4 GB extension steals the permission bits.
        if cfg.quirks & quirks::ARM_MTK_4GB != 0 && cfg.quirks & quirks::NO_PERMS == 0 {
            return Err(Error::Invalid);
        }

        let mut cfg = cfg;
        cfg.pgsize_bitmap &= SZ_4K | SZ_64K | SZ_1M | SZ_16M;

        let mut regs = V7sRegisters {
            // T0SZ=0, TTBR1 disabled.
            tcr: TCR_PD1,
            ..Default::default()
        };
        // TEX remap to the closest equivalent types under the
        // non-remapped interpretation of the attribute bits.
        regs.prrr = prrr_tr(1, PRRR_TYPE_DEVICE)
            | prrr_tr(4, PRRR_TYPE_NORMAL)
            | prrr_tr(7, PRRR_TYPE_NORMAL)
            | PRRR_DS0
            | PRRR_DS1
            | PRRR_NS1
            | prrr_nos(7);
        regs.nmrr = nmrr_ir(7, RGN_WBWA) | nmrr_or(7, RGN_WBWA);

        let pgd = vec![0u32; ptes_per_lvl(1)];
        // The empty top level must be visible before any TTBR write.
        fence(Ordering::Release);
        regs.ttbr[0] =
            PGD_PA | TTBR_S | TTBR_NOS | ttbr_irgn(RGN_NC) | ttbr_orgn(RGN_NC);
        regs.ttbr[1] = 0;

        Ok(Self {
            cfg,
            tlb,
            pgd,
            tables: Vec::new(),
            free_tables: Vec::new(),
            regs,
        })
    }

    /// The configuration the table was built with.
    pub fn config(&self) -> &IoPageTableCfg {
        &self.cfg
    }

    /// The IOMMU register images for this table.
    pub fn registers(&self) -> &V7sRegisters {
        &self.regs
    }

    fn table_pa(idx: usize) -> u32 {
        ((idx as u32) + 2) << TABLE_SHIFT
    }

    fn deref_table(&self, pte: u32) -> Option<TableRef> {
        let pa = pte & TABLE_MASK;
        if pa == PGD_PA {
            return Some(TableRef::Pgd);
        }
        let idx = (pa >> TABLE_SHIFT).checked_sub(2)? as usize;
        if idx < self.tables.len() && self.tables[idx].is_some() {
            Some(TableRef::L2(idx))
        } else {
            None
        }
    }

    fn pte(&self, tbl: TableRef, idx: usize) -> u32 {
        match tbl {
            TableRef::Pgd => self.pgd[idx],
            TableRef::L2(t) => self.tables[t].as_ref().unwrap()[idx],
        }
    }

    fn set_ptes(&mut self, tbl: TableRef, idx: usize, pte: u32, num: usize) {
        match tbl {
            TableRef::Pgd => {
                for slot in &mut self.pgd[idx..idx + num] {
                    *slot = pte;
                }
            }
            TableRef::L2(t) => {
                let table = self.tables[t].as_mut().unwrap();
                for slot in &mut table[idx..idx + num] {
                    *slot = pte;
                }
            }
        }
        // Publish fully constructed descriptors before a DMA walker can
        // reach them.
        fence(Ordering::Release);
    }

    fn alloc_table(&mut self) -> Result<usize> {
        if let Some(idx) = self.free_tables.pop() {
            return Ok(idx);
        }
        let idx = self.tables.len();
        self.tables.push(Some(Box::new([0u32; 256])));
        Ok(idx)
    }

    fn free_table(&mut self, idx: usize) {
        self.tables[idx] = Some(Box::new([0u32; 256]));
        self.free_tables.push(idx);
    }

    fn prot_to_pte(&self, prot: u32, lvl: u32) -> u32 {
        let ap = self.cfg.quirks & quirks::NO_PERMS == 0;
        let mut pte = ATTR_NG | ATTR_S;

        if prot & prot::MMIO == 0 {
            pte |= (1 & TEX_MASK) << TEX_SHIFT;
        }
        if ap {
            pte |= PTE_AF | PTE_AP_UNPRIV;
            if prot & prot::WRITE == 0 {
                pte |= PTE_AP_RDONLY;
            }
        }
        pte <<= attr_shift(lvl);

        if prot & prot::NOEXEC != 0 && ap {
            pte |= attr_xn(lvl);
        }
        if prot & prot::MMIO != 0 {
            pte |= ATTR_B;
        } else if prot & prot::CACHE != 0 {
            pte |= ATTR_B | ATTR_C;
        }
        pte
    }

    fn pte_to_prot(pte: u32, lvl: u32) -> u32 {
        let mut p = prot::READ;
        let attr = pte >> attr_shift(lvl);

        if attr & PTE_AP_RDONLY == 0 {
            p |= prot::WRITE;
        }
        if attr & (TEX_MASK << TEX_SHIFT) == 0 {
            p |= prot::MMIO;
        } else if pte & ATTR_C != 0 {
            p |= prot::CACHE;
        }
        if pte & attr_xn(lvl) != 0 {
            p |= prot::NOEXEC;
        }
        p
    }

    fn pte_to_cont(pte: u32, lvl: u32) -> u32 {
        if lvl == 1 {
            pte | CONT_SECTION
        } else {
            let xn = pte & attr_xn(lvl);
            let tex = pte & CONT_PAGE_TEX_MASK;
            let mut pte = pte ^ (xn | tex | PTE_TYPE_PAGE);
            pte |= (xn << CONT_PAGE_XN_SHIFT)
                | (tex << CONT_PAGE_TEX_SHIFT)
                | PTE_TYPE_CONT_PAGE;
            pte
        }
    }

    fn cont_to_pte(pte: u32, lvl: u32) -> u32 {
        if lvl == 1 {
            pte & !CONT_SECTION
        } else {
            let xn = pte & (1 << CONT_PAGE_XN_SHIFT);
            let tex = pte & (CONT_PAGE_TEX_MASK << CONT_PAGE_TEX_SHIFT);
            let mut pte = pte ^ (xn | tex | PTE_TYPE_CONT_PAGE);
            pte |= (xn >> CONT_PAGE_XN_SHIFT)
                | (tex >> CONT_PAGE_TEX_SHIFT)
                | PTE_TYPE_PAGE;
            pte
        }
    }

    fn pte_is_cont(pte: u32, lvl: u32) -> bool {
        if lvl == 1 && !pte_is_table(pte, lvl) {
            pte & CONT_SECTION != 0
        } else if lvl == 2 {
            pte & PTE_TYPE_PAGE == 0
        } else {
            false
        }
    }

    /// Maps `size` bytes at `iova` to `paddr` with `prot`. A request
    /// carrying neither read nor write permission succeeds as a no-op.
    pub fn map(&mut self, iova: u64, paddr: u64, size: u64, p: u32) -> Result<()> {
        if p & (prot::READ | prot::WRITE) == 0 {
            return Ok(());
        }
        if size & self.cfg.pgsize_bitmap == 0 || !size.is_power_of_two() {
            return Err(Error::Invalid);
        }

        self.map_level(iova, paddr, size, p, 1, TableRef::Pgd)?;

        // Make all descriptor updates visible before anything can walk
        // the new iova.
        if self.cfg.quirks & quirks::TLBI_ON_MAP != 0 {
            self.tlb.add_flush(iova, size, block_size(2), false);
            self.tlb.sync();
        } else {
            fence(Ordering::Release);
        }
        Ok(())
    }

    fn map_level(
        &mut self,
        iova: u64,
        paddr: u64,
        size: u64,
        p: u32,
        lvl: u32,
        tbl: TableRef,
    ) -> Result<()> {
        let num_entries = (size >> lvl_shift(lvl)) as usize;
        let idx = lvl_idx(iova, lvl);

        // If a leaf fits at this level, install it here.
        if num_entries > 0 {
            return self.init_pte(iova, paddr, p, lvl, num_entries, tbl, idx);
        }

        if lvl == 2 {
            warn!("io-pgtable: cannot allocate tables below the final level");
            return Err(Error::Invalid);
        }

        // Grab (or build) the next level.
        let pte = self.pte(tbl, idx);
        let child = if pte == 0 {
            let t = self.alloc_table()?;
            let mut new_pte = Self::table_pa(t) | PTE_TYPE_TABLE;
            if self.cfg.quirks & quirks::ARM_NS != 0 {
                new_pte |= ATTR_NS_TABLE;
            }
            self.set_ptes(tbl, idx, new_pte, 1);
            TableRef::L2(t)
        } else if pte_is_table(pte, lvl) {
            self.deref_table(pte).ok_or(Error::Fail)?
        } else {
            // A block already covers this range; an unmap must come
            // first.
            return Err(Error::Fail);
        };

        self.map_level(iova, paddr, size, p, lvl + 1, child)
    }

    fn init_pte(
        &mut self,
        iova: u64,
        paddr: u64,
        p: u32,
        lvl: u32,
        num_entries: usize,
        tbl: TableRef,
        idx: usize,
    ) -> Result<()> {
        for i in 0..num_entries {
            let existing = self.pte(tbl, idx + i);
            if pte_is_table(existing, lvl) {
                // Unmap and free the old table before overwriting it
                // with a block entry.
                let sz = block_size(lvl);
                let removed = self.unmap_level(iova + i as u64 * sz, sz, lvl, tbl);
                if removed != sz {
                    warn!("io-pgtable: failed to displace table at {iova:#x}");
                    return Err(Error::Invalid);
                }
            } else if existing != 0 {
                // We require an unmap first.
                return Err(Error::Fail);
            }
        }

        let mut pte = self.prot_to_pte(p, lvl) | PTE_TYPE_PAGE;
        if lvl == 1 && self.cfg.quirks & quirks::ARM_NS != 0 {
            pte |= ATTR_NS_SECTION;
        }
        if self.cfg.quirks & quirks::ARM_MTK_4GB != 0 {
            pte |= ATTR_MTK_4GB;
        }
        if num_entries > 1 {
            pte = Self::pte_to_cont(pte, lvl);
        }
        pte |= (paddr as u32) & lvl_mask(lvl);

        self.set_ptes(tbl, idx, pte, num_entries);
        Ok(())
    }

    /// Unmaps `size` bytes at `iova` and returns how many bytes were
    /// actually unmapped (0 when nothing was mapped there). Partial
    /// unmaps of a contiguous block or a section split the remainder
    /// into smaller mappings first.
    pub fn unmap(&mut self, iova: u64, size: u64) -> u64 {
        if size & self.cfg.pgsize_bitmap == 0 || !size.is_power_of_two() {
            return 0;
        }
        let unmapped = self.unmap_level(iova, size, 1, TableRef::Pgd);
        if unmapped != 0 {
            self.tlb.sync();
        }
        unmapped
    }

    fn unmap_level(&mut self, iova: u64, size: u64, lvl: u32, tbl: TableRef) -> u64 {
        if lvl > 2 {
            warn!("io-pgtable: walked past the final level");
            return 0;
        }

        let num_entries = (size >> lvl_shift(lvl)) as usize;
        let idx = lvl_idx(iova, lvl);
        let mut snapshot = [0u32; CONT_PAGES as usize];
        let count = num_entries.max(1);
        for i in 0..count {
            let pte = self.pte(tbl, idx + i);
            if !pte_is_valid(pte) {
                return 0;
            }
            snapshot[i] = pte;
        }

        // A contiguous entry must be split first unless the whole block
        // goes away.
        if num_entries <= 1 && Self::pte_is_cont(snapshot[0], lvl) {
            self.split_cont(iova, idx, lvl, tbl);
        }

        if num_entries > 0 {
            let blk = block_size(lvl);
            self.set_ptes(tbl, idx, 0, num_entries);

            let mut iova = iova;
            for item in snapshot.iter().take(num_entries) {
                if pte_is_table(*item, lvl) {
                    // Also flush any partial walks through the dying
                    // table.
                    self.tlb.add_flush(iova, blk, block_size(lvl + 1), false);
                    self.tlb.sync();
                    if let Some(TableRef::L2(t)) = self.deref_table(*item) {
                        self.free_table(t);
                    }
                } else {
                    self.tlb.add_flush(iova, blk, blk, true);
                }
                iova += blk;
            }
            return size;
        } else if lvl == 1 && !pte_is_table(snapshot[0], lvl) {
            // Unmapping a sub-range of a section: replace it with a
            // table mapping everything except the hole.
            return self.split_blk_unmap(iova, size, tbl, idx);
        }

        match self.deref_table(snapshot[0]) {
            Some(child) => self.unmap_level(iova, size, lvl + 1, child),
            None => 0,
        }
    }

    /// Rewrites a contiguous entry as its sixteen individual entries so
    /// part of it can be unmapped.
    fn split_cont(&mut self, iova: u64, idx: usize, lvl: u32, tbl: TableRef) {
        let base_idx = idx & !(CONT_PAGES as usize - 1);
        let mut pte = Self::cont_to_pte(self.pte(tbl, base_idx), lvl);
        let size = block_size(lvl);
        for i in 0..CONT_PAGES as usize {
            self.set_ptes(tbl, base_idx + i, pte, 1);
            pte = pte.wrapping_add(size as u32);
        }

        let full = size * u64::from(CONT_PAGES);
        self.tlb.add_flush(iova, full, full, true);
        self.tlb.sync();
    }

    /// Splits a 1 MiB section so everything except the unmapped
    /// sub-range survives through a fresh L2 table. From the TLB's point
    /// of view the whole section is invalidated at once; if the table
    /// allocation fails the section stays as it was.
    fn split_blk_unmap(&mut self, iova: u64, size: u64, tbl: TableRef, idx: usize) -> u64 {
        let section_pte = self.pte(tbl, idx);
        let p = Self::pte_to_prot(section_pte, 1);
        let blk_size = block_size(1);
        let blk_start = iova & u64::from(lvl_mask(1));
        let blk_end = blk_start + blk_size;
        let blk_paddr = u64::from(section_pte & lvl_mask(1));

        let Ok(t) = self.alloc_table() else {
            return 0;
        };

        let mut start = blk_start;
        let mut paddr_cur = blk_paddr;
        while start < blk_end {
            if start != iova {
                let sub = self.prot_to_pte(p, 2)
                    | PTE_TYPE_PAGE
                    | ((paddr_cur as u32) & lvl_mask(2));
                let sub_idx = lvl_idx(start, 2);
                self.set_ptes(TableRef::L2(t), sub_idx, sub, 1);
            }
            start += size;
            paddr_cur += size;
        }

        let mut table_pte = Self::table_pa(t) | PTE_TYPE_TABLE;
        if self.cfg.quirks & quirks::ARM_NS != 0 {
            table_pte |= ATTR_NS_TABLE;
        }
        self.set_ptes(tbl, idx, table_pte, 1);

        let flush_base = iova & !(blk_size - 1);
        self.tlb.add_flush(flush_base, blk_size, blk_size, true);
        size
    }

    /// Translates `iova` to its mapped output address, or 0 when no
    /// valid leaf covers it.
    pub fn iova_to_phys(&self, iova: u64) -> u64 {
        let mut lvl = 1;
        let mut tbl = TableRef::Pgd;
        let mut pte = self.pte(tbl, lvl_idx(iova, lvl));
        while pte_is_table(pte, lvl) {
            match self.deref_table(pte) {
                Some(child) => tbl = child,
                None => return 0,
            }
            lvl += 1;
            pte = self.pte(tbl, lvl_idx(iova, lvl));
        }

        if !pte_is_valid(pte) {
            return 0;
        }

        let mut mask = lvl_mask(lvl);
        if Self::pte_is_cont(pte, lvl) {
            mask = mask.wrapping_mul(CONT_PAGES);
        }
        u64::from(pte & mask) | (iova & !u64::from(mask))
    }
}

/// Runs the deterministic self-test: empty-table lookups, identity maps
/// of every supported size, overlap rejection, partial unmap with remap,
/// and full unmap/remap of every region.
pub fn run_selftests() -> Result<()> {
    struct DummyTlb;
    impl IoTlbOps for DummyTlb {
        fn flush_all(&self) {}
        fn add_flush(&self, _iova: u64, _size: u64, _granule: u64, _leaf: bool) {}
        fn sync(&self) {}
    }

    let cfg = IoPageTableCfg {
        ias: 32,
        oas: 32,
        quirks: quirks::ARM_NS,
        pgsize_bitmap: SZ_4K | SZ_64K | SZ_1M | SZ_16M,
    };
    let mut ops = IoPageTable::alloc(cfg, Box::new(DummyTlb))?;

    // Empty page tables should not provide any translation.
    if ops.iova_to_phys(42) != 0
        || ops.iova_to_phys(0x4000_0000 + 42) != 0
        || ops.iova_to_phys(0x8000_0000 + 42) != 0
    {
        return Err(Error::Fail);
    }

    // Distinct mappings of each granule size.
    let sizes = [SZ_4K, SZ_64K, SZ_1M, SZ_16M];
    let mut iova = 0u64;
    for size in sizes {
        ops.map(
            iova,
            iova,
            size,
            prot::READ | prot::WRITE | prot::NOEXEC | prot::CACHE,
        )?;

        // Overlapping mappings must be rejected.
        if ops
            .map(iova, iova + size, size, prot::READ | prot::NOEXEC)
            .is_ok()
        {
            return Err(Error::Fail);
        }

        if ops.iova_to_phys(iova + 42) != iova + 42 {
            return Err(Error::Fail);
        }
        iova += SZ_16M;
    }

    // Partial unmap of the second smallest page of each larger region,
    // then remap it.
    let small = SZ_4K;
    for i in 1..sizes.len() as u64 {
        let iova_start = i * SZ_16M;
        if ops.unmap(iova_start + small, small) != small {
            return Err(Error::Fail);
        }
        if ops.iova_to_phys(iova_start + small + 10) != 0 {
            return Err(Error::Fail);
        }
        ops.map(iova_start + small, small, small, prot::READ)?;
        if ops.iova_to_phys(iova_start + small + 42) != small + 42 {
            return Err(Error::Fail);
        }
    }

    // Full unmap of every region, then remap.
    let mut iova = 0u64;
    for size in sizes {
        if ops.unmap(iova, size) != size {
            return Err(Error::Fail);
        }
        if ops.iova_to_phys(iova + 42) != 0 {
            return Err(Error::Fail);
        }
        ops.map(iova, iova, size, prot::WRITE)?;
        if ops.iova_to_phys(iova + 42) != iova + 42 {
            return Err(Error::Fail);
        }
        iova += SZ_16M;
    }

    info!("io-pgtable: self-test ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingTlbState {
        flushes: AtomicU32,
        syncs: AtomicU32,
    }

    #[derive(Clone, Default)]
    struct CountingTlb(Arc<CountingTlbState>);

    impl IoTlbOps for CountingTlb {
        fn flush_all(&self) {}
        fn add_flush(&self, _iova: u64, _size: u64, _granule: u64, _leaf: bool) {
            let _ = self.0.flushes.fetch_add(1, AtomicOrdering::Relaxed);
        }
        fn sync(&self) {
            let _ = self.0.syncs.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    fn table() -> IoPageTable {
        table_with_quirks(quirks::ARM_NS).0
    }

    fn table_with_quirks(q: u32) -> (IoPageTable, CountingTlb) {
        let tlb = CountingTlb::default();
        let cfg = IoPageTableCfg {
            ias: 32,
            oas: 32,
            quirks: q,
            pgsize_bitmap: SZ_4K | SZ_64K | SZ_1M | SZ_16M,
        };
        (
            IoPageTable::alloc(cfg, Box::new(tlb.clone())).unwrap(),
            tlb,
        )
    }

    #[test]
    fn test_selftest_passes() {
        run_selftests().unwrap();
    }

    #[test]
    fn test_alloc_rejects_bad_config() {
        struct NullTlb;
        impl IoTlbOps for NullTlb {
            fn flush_all(&self) {}
            fn add_flush(&self, _: u64, _: u64, _: u64, _: bool) {}
            fn sync(&self) {}
        }
        let cfg = IoPageTableCfg {
            ias: 40,
            oas: 32,
            quirks: 0,
            pgsize_bitmap: SZ_4K,
        };
        assert!(IoPageTable::alloc(cfg, Box::new(NullTlb)).is_err());

        let cfg = IoPageTableCfg {
            ias: 32,
            oas: 32,
            quirks: quirks::ARM_MTK_4GB,
            pgsize_bitmap: SZ_4K,
        };
        // 4 GB mode without NO_PERMS is an invalid combination.
        assert!(IoPageTable::alloc(cfg, Box::new(NullTlb)).is_err());
    }

    #[test]
    fn test_empty_lookup_returns_zero() {
        let ops = table();
        for iova in [0u64, 42, SZ_1M + 7, 0xffff_f000] {
            assert_eq!(ops.iova_to_phys(iova), 0);
        }
    }

    #[test]
    fn test_identity_map_every_size() {
        let mut ops = table();
        let mut iova = 0u64;
        for size in [SZ_4K, SZ_64K, SZ_1M, SZ_16M] {
            ops.map(iova, iova, size, prot::READ | prot::WRITE).unwrap();
            for k in [0u64, 1, size / 2, size - 1] {
                assert_eq!(ops.iova_to_phys(iova + k), iova + k, "size {size:#x}");
            }
            iova += SZ_16M;
        }
    }

    #[test]
    fn test_map_without_access_is_noop() {
        let mut ops = table();
        ops.map(0, 0x1000, SZ_4K, prot::CACHE).unwrap();
        assert_eq!(ops.iova_to_phys(0), 0);
    }

    #[test]
    fn test_unmap_returns_zero_for_absent() {
        let mut ops = table();
        assert_eq!(ops.unmap(SZ_1M, SZ_4K), 0);
    }

    #[test]
    fn test_section_split_on_partial_unmap() {
        let mut ops = table();
        let base = 0x0100_0000u64;
        ops.map(base, base, SZ_1M, prot::READ | prot::WRITE).unwrap();

        assert_eq!(ops.unmap(base + SZ_4K, SZ_4K), SZ_4K);
        // The hole is gone, its neighbors survive.
        assert_eq!(ops.iova_to_phys(base + SZ_4K + 10), 0);
        assert_eq!(ops.iova_to_phys(base + 42), base + 42);
        assert_eq!(ops.iova_to_phys(base + 2 * SZ_4K + 3), base + 2 * SZ_4K + 3);

        // Remapping the hole restores identity.
        ops.map(base + SZ_4K, base + SZ_4K, SZ_4K, prot::READ).unwrap();
        assert_eq!(ops.iova_to_phys(base + SZ_4K + 42), base + SZ_4K + 42);
    }

    #[test]
    fn test_supersection_partial_unmap() {
        let mut ops = table();
        ops.map(0, 0, SZ_16M, prot::READ | prot::WRITE).unwrap();
        assert_eq!(ops.unmap(SZ_4K, SZ_4K), SZ_4K);
        assert_eq!(ops.iova_to_phys(SZ_4K + 1), 0);
        assert_eq!(ops.iova_to_phys(0), 0);
        assert_eq!(ops.iova_to_phys(SZ_1M + 5), SZ_1M + 5);
        assert_eq!(ops.iova_to_phys(15 * SZ_1M + 5), 15 * SZ_1M + 5);
    }

    #[test]
    fn test_large_page_partial_unmap() {
        let mut ops = table();
        let base = SZ_16M;
        ops.map(base, base, SZ_64K, prot::READ | prot::WRITE).unwrap();
        assert_eq!(ops.unmap(base + SZ_4K, SZ_4K), SZ_4K);
        assert_eq!(ops.iova_to_phys(base + SZ_4K), 0);
        assert_eq!(ops.iova_to_phys(base + 2 * SZ_4K), base + 2 * SZ_4K);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut ops = table();
        ops.map(0, 0, SZ_4K, prot::READ).unwrap();
        assert!(ops.map(0, SZ_4K, SZ_4K, prot::READ).is_err());
    }

    #[test]
    fn test_unmap_syncs_tlb(){
        let (mut ops, tlb) = table_with_quirks(quirks::ARM_NS);
        ops.map(0, 0, SZ_4K, prot::READ | prot::WRITE).unwrap();
        assert_eq!(tlb.0.syncs.load(AtomicOrdering::Relaxed), 0);
        assert_eq!(ops.unmap(0, SZ_4K), SZ_4K);
        assert!(tlb.0.syncs.load(AtomicOrdering::Relaxed) >= 1);
        assert!(tlb.0.flushes.load(AtomicOrdering::Relaxed) >= 1);
    }

    #[test]
    fn test_tlbi_on_map_quirk_syncs_on_map() {
        let (mut ops, tlb) = table_with_quirks(quirks::ARM_NS | quirks::TLBI_ON_MAP);
        ops.map(0, 0, SZ_4K, prot::READ).unwrap();
        assert_eq!(tlb.0.syncs.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(tlb.0.flushes.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_ttbr_encoding() {
        let ops = table();
        let ttbr = ops.registers().ttbr[0];
        assert_ne!(ttbr & TTBR_S, 0);
        assert_ne!(ttbr & TTBR_NOS, 0);
        assert_eq!(ops.registers().ttbr[1], 0);
        assert_eq!(ops.registers().tcr, TCR_PD1);
    }

    #[test]
    fn test_readonly_mapping_encodes_rdonly() {
        let mut ops = table();
        ops.map(0, 0x5000, SZ_4K, prot::READ).unwrap();
        assert_eq!(ops.iova_to_phys(0x10), 0x5010);
        // A read-write mapping of the same page must differ in the AP
        // bits.
        let mut rw = table();
        rw.map(0, 0x5000, SZ_4K, prot::READ | prot::WRITE).unwrap();
        let ro_pte = ops.pte(TableRef::L2(0), 0);
        let rw_pte = rw.pte(TableRef::L2(0), 0);
        assert_ne!(ro_pte, rw_pte);
        assert_ne!(ro_pte & (PTE_AP_RDONLY << attr_shift(2)), 0);
    }
}

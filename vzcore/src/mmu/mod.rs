//! The module containing the stage-1 MMU core: the translation table
//! pool, the system-wide default L1 every per-guest L1 inherits from, and
//! the map/unmap/walk operations over short-descriptor tables.
//!
//! The original pointer-linked table lists are re-architected as arenas
//! indexed by handles; attachment is a FAULT-or-pointer descriptor in the
//! parent plus a weak back-reference in the child.

pub mod descriptor;
pub mod pool;

use crate::error::{Error, Result};
use crate::platform::HostCpu;
use alloc::boxed::Box;
use alloc::vec::Vec;
use descriptor::{
    L1Entry, L2Entry, PageRecord, IMP_RESERVED, L1_INDEX_SHIFT, L1_TABLE_SIZE, L1_TYPE_FAULT,
    L1_TYPE_L2TBL, L1_TYPE_SECTION, L2_INDEX_SHIFT, L2_TABLE_SIZE, L2_TYPE_LARGE,
    L2_TYPE_SMALL_X, L2_TYPE_SMALL_XN, LARGE_PAGE_ENTRIES, LARGE_PAGE_SIZE, SECTION_PAGE_SIZE,
    SMALL_PAGE_SIZE, SUPSECTION_PAGE_SIZE,
};
use log::debug;
use pool::{PoolBlock, TablePool};
use spin::Mutex;

/// SCTLR bit: MMU enable.
pub const SCTLR_M: u32 = 1 << 0;
/// SCTLR bit: data cache enable.
pub const SCTLR_C: u32 = 1 << 2;
/// SCTLR bit: instruction cache enable.
pub const SCTLR_I: u32 = 1 << 12;
/// SCTLR bit: high exception vectors.
pub const SCTLR_V: u32 = 1 << 13;

/// Handle to a first-level table in the arena. Handle 0 is the default
/// L1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L1Handle(usize);

impl L1Handle {
    /// The system-wide default L1.
    pub const DEFAULT: L1Handle = L1Handle(0);
}

struct L1Table {
    block: PoolBlock,
    tte_cnt: u32,
    l2tbl_cnt: u32,
    /// Arena indices of attached L2 tables.
    l2list: Vec<usize>,
}

struct L2Table {
    block: PoolBlock,
    /// Arena index of the owning L1 while attached.
    parent: Option<usize>,
    /// L1-slot-aligned virtual address the table is attached at.
    map_va: u32,
    imp: u32,
    dom: u32,
    tte_cnt: u32,
}

/// Configuration of the MMU core, supplied once at init.
#[derive(Clone, Copy, Debug)]
pub struct MmuConfig {
    /// Physical base of the translation table pool.
    pub pool_pa: u32,
    /// Size of the translation table pool in bytes.
    pub pool_size: usize,
    /// Physical base of the hypervisor image.
    pub image_pa: u32,
    /// Virtual base of the hypervisor image.
    pub image_va: u32,
    /// Size of the hypervisor image in bytes.
    pub image_size: u32,
    /// Whether the host uses high exception vectors.
    pub high_vectors: bool,
}

impl MmuConfig {
    /// A configuration placing a default-sized pool right behind the
    /// hypervisor image, aligned to the largest table size.
    pub fn for_image(image_pa: u32, image_va: u32, image_size: u32, high_vectors: bool) -> Self {
        let mut pool_pa = image_pa + image_size;
        if pool_pa & (descriptor::TTBL_MAX_SIZE as u32 - 1) != 0 {
            pool_pa += descriptor::TTBL_MAX_SIZE as u32;
            pool_pa &= !(descriptor::TTBL_MAX_SIZE as u32 - 1);
        }
        Self {
            pool_pa,
            pool_size: crate::config::DEFAULT_TTBL_POOL_SIZE,
            image_pa,
            image_va,
            image_size,
            high_vectors,
        }
    }
}

struct MmuState {
    pool: TablePool,
    /// L1 arena; slot 0 is the default L1.
    l1s: Vec<Option<L1Table>>,
    /// L2 arena.
    l2s: Vec<Option<L2Table>>,
    /// L2 arena slots whose pool memory was released.
    free_l2_slots: Vec<usize>,
    /// Allocated but currently unattached L2s, reused before the pool is
    /// asked for fresh memory.
    detached_l2s: Vec<usize>,
}

/// The MMU core service. All table state lives behind one lock; no
/// operation blocks while holding it.
pub struct Mmu {
    state: Mutex<MmuState>,
    hw: Box<dyn HostCpu + Send + Sync>,
}

impl Mmu {
    /// Builds the pool and handcrafts the default L1: the hypervisor
    /// image and the pool itself become reserved sections, as does the
    /// section holding the active exception vector base. Finishes by
    /// pointing the hardware at the default L1.
    pub fn init(cfg: &MmuConfig, hw: Box<dyn HostCpu + Send + Sync>) -> Result<Self> {
        let mut state = MmuState {
            pool: TablePool::new(cfg.pool_pa, cfg.pool_size)?,
            l1s: Vec::new(),
            l2s: Vec::new(),
            free_l2_slots: Vec::new(),
            detached_l2s: Vec::new(),
        };

        // Domain 0 (hypervisor) is a client of its descriptors.
        hw.write_dacr(descriptor::DACR_CLIENT);

        let block = state.pool.alloc(L1_TABLE_SIZE)?;
        state.l1s.push(Some(L1Table {
            block,
            tte_cnt: 0,
            l2tbl_cnt: 0,
            l2list: Vec::new(),
        }));

        let mmu = Self {
            state: Mutex::new(state),
            hw,
        };

        // Reserve the union of the image and the pool.
        let start_va = cfg.image_va.min(cfg.pool_pa);
        let start_pa = cfg.image_pa.min(cfg.pool_pa);
        let image_end = cfg.image_va.saturating_add(cfg.image_size);
        let pool_end = cfg.pool_pa.saturating_add(cfg.pool_size as u32);
        let end_va = image_end.max(pool_end);
        mmu.map_reserved_sections(start_va, start_pa, end_va - start_va)?;

        // Reserve the section holding the exception vectors.
        let vec_base = if cfg.high_vectors {
            crate::config::IRQ_HIGHVEC_BASE
        } else {
            crate::config::IRQ_LOWVEC_BASE
        };
        let vec_sect = vec_base & !(SECTION_PAGE_SIZE - 1);
        mmu.map_reserved_sections(vec_sect, vec_sect, SECTION_PAGE_SIZE)?;

        mmu.chttbr(L1Handle::DEFAULT)?;
        debug!(
            "mmu: pool {:#x}+{:#x}, default l1 at {:#x}",
            cfg.pool_pa,
            cfg.pool_size,
            mmu.l1_pa(L1Handle::DEFAULT)?
        );
        Ok(mmu)
    }

    /// Maps `[va, va + size)` to `[pa, ...)` as reserved sections. The
    /// walk is done in 64 bits so a range touching the top of the address
    /// space terminates.
    fn map_reserved_sections(&self, va: u32, pa: u32, size: u32) -> Result<()> {
        let sect = u64::from(SECTION_PAGE_SIZE);
        let mut cur = u64::from(va) & !(sect - 1);
        let mut pa = pa & !(SECTION_PAGE_SIZE - 1);
        let end = (u64::from(va) + u64::from(size) + (sect - 1)) & !(sect - 1);
        while cur < end {
            self.map_reserved_page(&PageRecord {
                pa,
                va: cur as u32,
                sz: SECTION_PAGE_SIZE,
                imp: IMP_RESERVED,
                dom: descriptor::DOM_RESERVED,
                ap: descriptor::AP_SRW_U_RW,
                c: 1,
                ..Default::default()
            })?;
            cur += sect;
            pa = pa.wrapping_add(SECTION_PAGE_SIZE);
        }
        Ok(())
    }

    /// Walks `l1` for `va` and fills in a page record. Returns
    /// [`Error::NotAvail`] when no mapping covers `va`.
    pub fn get_page(&self, l1: L1Handle, va: u32) -> Result<PageRecord> {
        self.state.lock().get_page(l1.0, va)
    }

    /// Installs `pg` into `l1`, unmapping any overlapping existing
    /// mappings first. Fails without touching the table if the target
    /// carries a different implementation tag.
    pub fn map_page(&self, l1: L1Handle, pg: &PageRecord) -> Result<()> {
        self.state.lock().map_page(l1.0, pg)
    }

    /// Removes `pg` from `l1`. The installed descriptor's physical base,
    /// size and implementation tag must match `pg`. Invalidates the TLB
    /// line when `l1` is the live table.
    pub fn unmap_page(&self, l1: L1Handle, pg: &PageRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.unmap_page(l1.0, pg)?;
        let pa = state.l1s[l1.0].as_ref().ok_or(Error::Fail)?.block.pa;
        drop(state);
        if self.hw.read_ttbr0() == pa {
            self.hw.invalidate_tlb_line(pg.va);
        }
        Ok(())
    }

    /// Walks the default L1 for `va`.
    pub fn get_reserved_page(&self, va: u32) -> Result<PageRecord> {
        self.get_page(L1Handle::DEFAULT, va)
    }

    /// Installs a reserved page into the default L1 and every allocated
    /// per-guest L1. `pg.imp` must be the reserved tag.
    pub fn map_reserved_page(&self, pg: &PageRecord) -> Result<()> {
        if pg.imp != IMP_RESERVED {
            return Err(Error::Fail);
        }
        let mut state = self.state.lock();
        state.map_page(0, pg)?;
        for slot in 1..state.l1s.len() {
            if state.l1s[slot].is_some() {
                state.map_page(slot, pg)?;
            }
        }
        Ok(())
    }

    /// Removes a reserved page from the default L1 and every allocated
    /// per-guest L1.
    pub fn unmap_reserved_page(&self, pg: &PageRecord) -> Result<()> {
        if pg.imp != IMP_RESERVED {
            return Err(Error::Fail);
        }
        let mut state = self.state.lock();
        state.unmap_page(0, pg)?;
        for slot in 1..state.l1s.len() {
            if state.l1s[slot].is_some() {
                state.unmap_page(slot, pg)?;
            }
        }
        Ok(())
    }

    /// Allocates a per-guest L1 as a deep copy of the default L1,
    /// including cloned L2 tables. A failure part way through unwinds
    /// completely.
    pub fn l1tbl_alloc(&self) -> Result<L1Handle> {
        self.state.lock().l1tbl_alloc().map(L1Handle)
    }

    /// Frees a per-guest L1 and every L2 attached to it. The default L1
    /// cannot be freed.
    pub fn l1tbl_free(&self, l1: L1Handle) -> Result<()> {
        if l1 == L1Handle::DEFAULT {
            return Err(Error::Invalid);
        }
        self.state.lock().l1tbl_free(l1.0)
    }

    /// Physical base address of `l1`.
    pub fn l1_pa(&self, l1: L1Handle) -> Result<u32> {
        let state = self.state.lock();
        Ok(state.l1s[l1.0].as_ref().ok_or(Error::Fail)?.block.pa)
    }

    /// Updates the hardware DACR, preserving the hypervisor's own domain
    /// 0 field.
    pub fn chdacr(&self, new_dacr: u32) {
        let old = self.hw.read_dacr();
        self.hw.write_dacr((new_dacr & !0x3) | (old & 0x3));
    }

    /// Flushes the TLB and switches the hardware translation base to
    /// `l1`.
    pub fn chttbr(&self, l1: L1Handle) -> Result<()> {
        let pa = self.l1_pa(l1)?;
        let sctlr = self.hw.read_sctlr();
        if sctlr & SCTLR_I != 0 {
            self.hw.clean_icache();
        }
        if sctlr & SCTLR_C != 0 {
            self.hw.clean_dcache();
        }
        self.hw.invalidate_tlb();
        self.hw.write_ttbr0(pa);
        Ok(())
    }

    /// The host CPU hooks the service was built with.
    pub fn hw(&self) -> &dyn HostCpu {
        &*self.hw
    }
}

impl MmuState {
    fn l1_word(&self, l1: usize, va: u32) -> Result<u32> {
        let tbl = self.l1s[l1].as_ref().ok_or(Error::Fail)?;
        let idx = (va >> L1_INDEX_SHIFT) as usize;
        Ok(self.pool.table(tbl.block.offset, L1_TABLE_SIZE)[idx])
    }

    fn set_l1_word(&mut self, l1: usize, va: u32, word: u32) -> Result<()> {
        let offset = self.l1s[l1].as_ref().ok_or(Error::Fail)?.block.offset;
        let idx = (va >> L1_INDEX_SHIFT) as usize;
        self.pool.table_mut(offset, L1_TABLE_SIZE)[idx] = word;
        Ok(())
    }

    fn l2_word(&self, l2: usize, va: u32) -> u32 {
        let tbl = self.l2s[l2].as_ref().unwrap();
        let idx = ((va >> L2_INDEX_SHIFT) & 0xff) as usize;
        self.pool.table(tbl.block.offset, L2_TABLE_SIZE)[idx]
    }

    fn set_l2_word(&mut self, l2: usize, va: u32, word: u32) {
        let offset = self.l2s[l2].as_ref().unwrap().block.offset;
        let idx = ((va >> L2_INDEX_SHIFT) & 0xff) as usize;
        self.pool.table_mut(offset, L2_TABLE_SIZE)[idx] = word;
    }

    /// Finds the attached L2 of `l1` whose table memory sits at physical
    /// `tbl_pa`.
    fn l2_by_pa(&self, l1: usize, tbl_pa: u32) -> Option<usize> {
        let tbl = self.l1s[l1].as_ref()?;
        tbl.l2list
            .iter()
            .copied()
            .find(|&i| self.l2s[i].as_ref().is_some_and(|l2| l2.block.pa == tbl_pa))
    }

    /// Returns a zeroed, detached L2, reusing one from the detached list
    /// before asking the pool for fresh memory.
    fn l2tbl_alloc(&mut self) -> Result<usize> {
        if let Some(idx) = self.detached_l2s.last() {
            return Ok(*idx);
        }
        let block = self.pool.alloc(L2_TABLE_SIZE)?;
        let table = L2Table {
            block,
            parent: None,
            map_va: 0,
            imp: 0,
            dom: 0,
            tte_cnt: 0,
        };
        let idx = if let Some(slot) = self.free_l2_slots.pop() {
            self.l2s[slot] = Some(table);
            slot
        } else {
            self.l2s.push(Some(table));
            self.l2s.len() - 1
        };
        self.detached_l2s.push(idx);
        Ok(idx)
    }

    /// Returns an L2's memory to the pool and retires its arena slot.
    fn l2tbl_free(&mut self, idx: usize) -> Result<()> {
        if self.l2s[idx].as_ref().ok_or(Error::Fail)?.parent.is_some() {
            self.l2tbl_detach(idx)?;
        }
        let block = self.l2s[idx].as_ref().unwrap().block;
        self.pool.free(block.offset, L2_TABLE_SIZE)?;
        self.detached_l2s.retain(|&i| i != idx);
        self.l2s[idx] = None;
        self.free_l2_slots.push(idx);
        Ok(())
    }

    /// Attaches `l2` to `l1` at the L1 slot covering `map_va`. The slot
    /// must currently be a FAULT descriptor.
    fn l2tbl_attach(&mut self, l1: usize, l2: usize, imp: u32, dom: u32, map_va: u32) -> Result<()> {
        if self.l2s[l2].as_ref().ok_or(Error::Fail)?.parent.is_some() {
            self.l2tbl_detach(l2)?;
        }
        let tte = L1Entry(self.l1_word(l1, map_va)?);
        if tte.tte_type() != L1_TYPE_FAULT {
            return Err(Error::Fail);
        }

        let pa = self.l2s[l2].as_ref().unwrap().block.pa;
        let imp = imp & 0x1;
        let dom = dom & 0xf;
        {
            let table = self.l2s[l2].as_mut().unwrap();
            table.parent = Some(l1);
            table.imp = imp;
            table.dom = dom;
            table.map_va = map_va & !(SECTION_PAGE_SIZE - 1);
        }

        let mut new_tte = L1Entry::default();
        new_tte.set_imp(imp);
        new_tte.set_dom(dom);
        new_tte.set_table_base(pa >> 10);
        new_tte.set_tte_type(L1_TYPE_L2TBL);
        self.set_l1_word(l1, map_va, new_tte.0)?;

        let tbl = self.l1s[l1].as_mut().ok_or(Error::Fail)?;
        tbl.tte_cnt += 1;
        tbl.l2tbl_cnt += 1;
        tbl.l2list.push(l2);
        self.detached_l2s.retain(|&i| i != l2);
        Ok(())
    }

    /// Detaches `l2` from its parent: the parent slot becomes FAULT and
    /// the zeroed table goes back on the detached list.
    fn l2tbl_detach(&mut self, l2: usize) -> Result<()> {
        let (parent, map_va, block) = {
            let table = self.l2s[l2].as_ref().ok_or(Error::Fail)?;
            match table.parent {
                Some(p) => (p, table.map_va, table.block),
                None => return Ok(()),
            }
        };
        let tte = L1Entry(self.l1_word(parent, map_va)?);
        if tte.tte_type() == L1_TYPE_FAULT {
            return Err(Error::Fail);
        }

        self.set_l1_word(parent, map_va, 0)?;
        let tbl = self.l1s[parent].as_mut().ok_or(Error::Fail)?;
        tbl.tte_cnt -= 1;
        tbl.l2tbl_cnt -= 1;
        tbl.l2list.retain(|&i| i != l2);

        let table = self.l2s[l2].as_mut().unwrap();
        table.parent = None;
        table.tte_cnt = 0;
        self.pool.zero(block.offset, L2_TABLE_SIZE);
        self.detached_l2s.push(l2);
        Ok(())
    }

    fn get_page(&self, l1: usize, va: u32) -> Result<PageRecord> {
        let tte = L1Entry(self.l1_word(l1, va)?);
        let mut pg = PageRecord::default();
        match tte.tte_type() {
            L1_TYPE_FAULT => Err(Error::NotAvail),
            L1_TYPE_SECTION => {
                pg.ns = tte.ns_section();
                pg.ng = tte.ng();
                pg.s = tte.s();
                pg.ap = (tte.ap2() << 2) | tte.ap();
                pg.tex = tte.tex();
                pg.imp = tte.imp();
                pg.xn = tte.xn();
                pg.c = tte.c();
                pg.b = tte.b();
                if tte.supersection() != 0 {
                    pg.pa = tte.supsection_base() << 24;
                    pg.va = va & !(SUPSECTION_PAGE_SIZE - 1);
                    pg.sz = SUPSECTION_PAGE_SIZE;
                    pg.dom = 0;
                } else {
                    pg.pa = tte.section_base() << 20;
                    pg.va = va & !(SECTION_PAGE_SIZE - 1);
                    pg.sz = SECTION_PAGE_SIZE;
                    pg.dom = tte.dom();
                }
                Ok(pg)
            }
            L1_TYPE_L2TBL => {
                let l2base = tte.table_base() << 10;
                let l2 = self.l2_by_pa(l1, l2base).ok_or(Error::Fail)?;
                let l2_tte = L2Entry(self.l2_word(l2, va));
                pg.imp = tte.imp();
                pg.dom = tte.dom();
                pg.ns = tte.ns_table();
                pg.ng = l2_tte.ng();
                pg.s = l2_tte.s();
                pg.ap = (l2_tte.ap2() << 2) | l2_tte.ap();
                pg.c = l2_tte.c();
                pg.b = l2_tte.b();
                match l2_tte.tte_type() {
                    L2_TYPE_LARGE => {
                        pg.pa = l2_tte.large_base() << 16;
                        pg.va = va & !(LARGE_PAGE_SIZE - 1);
                        pg.sz = LARGE_PAGE_SIZE;
                        pg.tex = l2_tte.ltex();
                        pg.xn = l2_tte.lxn();
                        Ok(pg)
                    }
                    L2_TYPE_SMALL_X | L2_TYPE_SMALL_XN => {
                        pg.pa = l2_tte.small_base() << 12;
                        pg.va = va & !(SMALL_PAGE_SIZE - 1);
                        pg.sz = SMALL_PAGE_SIZE;
                        pg.tex = l2_tte.stex();
                        pg.xn = l2_tte.sxn();
                        Ok(pg)
                    }
                    _ => Err(Error::NotAvail),
                }
            }
            _ => Err(Error::NotAvail),
        }
    }

    fn unmap_page(&mut self, l1: usize, pg: &PageRecord) -> Result<()> {
        let tte = L1Entry(self.l1_word(l1, pg.va)?);
        match tte.tte_type() {
            L1_TYPE_SECTION => {
                let (chkpa, chksz) = if tte.supersection() != 0 {
                    (tte.supsection_base() << 24, SUPSECTION_PAGE_SIZE)
                } else {
                    (tte.section_base() << 20, SECTION_PAGE_SIZE)
                };
                if pg.sz != chksz || pg.imp != tte.imp() || pg.pa != chkpa {
                    return Err(Error::Fail);
                }
                self.set_l1_word(l1, pg.va, 0)?;
                self.l1s[l1].as_mut().unwrap().tte_cnt -= 1;
                Ok(())
            }
            L1_TYPE_L2TBL => {
                if pg.imp != tte.imp() {
                    return Err(Error::Fail);
                }
                let l2base = tte.table_base() << 10;
                let l2 = self.l2_by_pa(l1, l2base).ok_or(Error::Fail)?;
                let l2_tte = L2Entry(self.l2_word(l2, pg.va));
                match l2_tte.tte_type() {
                    L2_TYPE_LARGE => {
                        if pg.sz != LARGE_PAGE_SIZE || pg.pa != l2_tte.large_base() << 16 {
                            return Err(Error::Fail);
                        }
                        let base = pg.va & !(LARGE_PAGE_SIZE - 1);
                        for i in 0..LARGE_PAGE_ENTRIES {
                            self.set_l2_word(l2, base + (i as u32) * SMALL_PAGE_SIZE, 0);
                        }
                        let table = self.l2s[l2].as_mut().unwrap();
                        table.tte_cnt -= LARGE_PAGE_ENTRIES as u32;
                        if table.tte_cnt == 0 {
                            self.l2tbl_detach(l2)?;
                        }
                        Ok(())
                    }
                    L2_TYPE_SMALL_X | L2_TYPE_SMALL_XN => {
                        if pg.sz != SMALL_PAGE_SIZE || pg.pa != l2_tte.small_base() << 12 {
                            return Err(Error::Fail);
                        }
                        self.set_l2_word(l2, pg.va, 0);
                        let table = self.l2s[l2].as_mut().unwrap();
                        table.tte_cnt -= 1;
                        if table.tte_cnt == 0 {
                            self.l2tbl_detach(l2)?;
                        }
                        Ok(())
                    }
                    _ => Err(Error::Fail),
                }
            }
            _ => Err(Error::Fail),
        }
    }

    fn map_page(&mut self, l1: usize, pg: &PageRecord) -> Result<()> {
        let tte = L1Entry(self.l1_word(l1, pg.va)?);
        if tte.tte_type() != L1_TYPE_FAULT {
            // A populated target is only acceptable when the tags agree.
            if tte.imp() != 0 && pg.imp != tte.imp() {
                return Err(Error::Fail);
            }
            let minpgsz = if tte.tte_type() == L1_TYPE_L2TBL {
                SMALL_PAGE_SIZE
            } else {
                SECTION_PAGE_SIZE
            };
            // Unmap everything the new page overlaps, one existing
            // mapping (or one minimum-size stride) at a time.
            let mut pgva = pg.va & !(minpgsz - 1);
            let mut pgsz = pg.sz;
            while pgsz != 0 {
                match self.get_page(l1, pgva) {
                    Err(_) => {
                        pgva = pgva.wrapping_add(minpgsz);
                        pgsz = if pgsz < minpgsz { 0 } else { pgsz - minpgsz };
                    }
                    Ok(upg) => {
                        self.unmap_page(l1, &upg)?;
                        pgva = pgva.wrapping_add(upg.sz);
                        pgsz = if pgsz < upg.sz { 0 } else { pgsz - upg.sz };
                    }
                }
            }
        }

        // Small and large pages need an L2 under the (now FAULT) slot.
        let tte = L1Entry(self.l1_word(l1, pg.va)?);
        if tte.tte_type() == L1_TYPE_FAULT
            && (pg.sz == SMALL_PAGE_SIZE || pg.sz == LARGE_PAGE_SIZE)
        {
            let l2 = self.l2tbl_alloc()?;
            if let Err(e) = self.l2tbl_attach(l1, l2, pg.imp, pg.dom, pg.va) {
                // A fresh table must not leak out of the pool on failure.
                let _ = self.l2tbl_free(l2);
                return Err(e);
            }
        }

        match pg.sz {
            SUPSECTION_PAGE_SIZE | SECTION_PAGE_SIZE => {
                self.set_l1_word(l1, pg.va, pg.encode_section().0)?;
                self.l1s[l1].as_mut().ok_or(Error::Fail)?.tte_cnt += 1;
                Ok(())
            }
            LARGE_PAGE_SIZE => {
                let tte = L1Entry(self.l1_word(l1, pg.va)?);
                let l2 = self
                    .l2_by_pa(l1, tte.table_base() << 10)
                    .ok_or(Error::Fail)?;
                let base = pg.va & !(LARGE_PAGE_SIZE - 1);
                let word = pg.encode_large().0;
                for i in 0..LARGE_PAGE_ENTRIES {
                    self.set_l2_word(l2, base + (i as u32) * SMALL_PAGE_SIZE, word);
                }
                self.l2s[l2].as_mut().unwrap().tte_cnt += LARGE_PAGE_ENTRIES as u32;
                Ok(())
            }
            SMALL_PAGE_SIZE => {
                let tte = L1Entry(self.l1_word(l1, pg.va)?);
                let l2 = self
                    .l2_by_pa(l1, tte.table_base() << 10)
                    .ok_or(Error::Fail)?;
                self.set_l2_word(l2, pg.va, pg.encode_small().0);
                self.l2s[l2].as_mut().unwrap().tte_cnt += 1;
                Ok(())
            }
            _ => Err(Error::Invalid),
        }
    }

    fn l1tbl_alloc(&mut self) -> Result<usize> {
        let block = self.pool.alloc(L1_TABLE_SIZE)?;
        let default = self.l1s[0].as_ref().ok_or(Error::Fail)?;
        let default_offset = default.block.offset;
        let default_tte_cnt = default.tte_cnt;
        let default_l2list = default.l2list.clone();
        let default_l2tbl_cnt = default.l2tbl_cnt;

        // Copy the default L1 wholesale, then replace each L2 pointer
        // with a pointer to a cloned L2.
        let words: Vec<u32> = self.pool.table(default_offset, L1_TABLE_SIZE).to_vec();
        self.pool
            .table_mut(block.offset, L1_TABLE_SIZE)
            .copy_from_slice(&words);

        let slot = self.l1s.len();
        self.l1s.push(Some(L1Table {
            block,
            tte_cnt: default_tte_cnt,
            l2tbl_cnt: 0,
            l2list: Vec::new(),
        }));

        let mut ok = true;
        for &src in &default_l2list {
            let (src_offset, src_imp, src_dom, src_map_va, src_tte_cnt) = {
                let l2 = self.l2s[src].as_ref().unwrap();
                (l2.block.offset, l2.imp, l2.dom, l2.map_va, l2.tte_cnt)
            };
            // The copied slot still points at the default's L2; reset it
            // to FAULT so the clone can attach.
            if self.set_l1_word(slot, src_map_va, 0).is_err() {
                ok = false;
                break;
            }
            self.l1s[slot].as_mut().unwrap().tte_cnt -= 1;

            let Ok(nl2) = self.l2tbl_alloc() else {
                ok = false;
                break;
            };
            let src_words: Vec<u32> = self.pool.table(src_offset, L2_TABLE_SIZE).to_vec();
            let dst_offset = self.l2s[nl2].as_ref().unwrap().block.offset;
            self.pool
                .table_mut(dst_offset, L2_TABLE_SIZE)
                .copy_from_slice(&src_words);
            if self
                .l2tbl_attach(slot, nl2, src_imp, src_dom, src_map_va)
                .is_err()
            {
                let _ = self.l2tbl_free(nl2);
                ok = false;
                break;
            }
            self.l2s[nl2].as_mut().unwrap().tte_cnt = src_tte_cnt;
        }

        if !ok {
            let _ = self.l1tbl_free(slot);
            return Err(Error::NoMem);
        }
        self.l1s[slot].as_mut().unwrap().l2tbl_cnt = default_l2tbl_cnt;
        Ok(slot)
    }

    fn l1tbl_free(&mut self, slot: usize) -> Result<()> {
        let l2list = self.l1s[slot].as_ref().ok_or(Error::Fail)?.l2list.clone();
        for l2 in l2list {
            self.l2tbl_free(l2)?;
        }
        let block = self.l1s[slot].as_ref().unwrap().block;
        self.pool.free(block.offset, L1_TABLE_SIZE)?;
        self.l1s[slot] = None;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Observable state of the host CPU double.
    #[derive(Default)]
    pub(crate) struct FakeCpuState {
        pub(crate) ttbr0: AtomicU32,
        pub(crate) dacr: AtomicU32,
        pub(crate) sctlr: AtomicU32,
        pub(crate) tlb_flushes: AtomicU32,
        pub(crate) tlb_line_flushes: AtomicU32,
        pub(crate) clrex_count: AtomicU32,
    }

    /// Host CPU double recording register writes and TLB maintenance.
    /// Clones share state so tests can keep a handle after giving one to
    /// the service under test.
    #[derive(Clone, Default)]
    pub(crate) struct FakeHostCpu(pub(crate) alloc::sync::Arc<FakeCpuState>);

    impl HostCpu for FakeHostCpu {
        fn read_ttbr0(&self) -> u32 {
            self.0.ttbr0.load(Ordering::Relaxed)
        }
        fn write_ttbr0(&self, pa: u32) {
            self.0.ttbr0.store(pa, Ordering::Relaxed);
        }
        fn read_dacr(&self) -> u32 {
            self.0.dacr.load(Ordering::Relaxed)
        }
        fn write_dacr(&self, dacr: u32) {
            self.0.dacr.store(dacr, Ordering::Relaxed);
        }
        fn read_sctlr(&self) -> u32 {
            self.0.sctlr.load(Ordering::Relaxed)
        }
        fn invalidate_tlb(&self) {
            let _ = self.0.tlb_flushes.fetch_add(1, Ordering::Relaxed);
        }
        fn invalidate_tlb_line(&self, _va: u32) {
            let _ = self.0.tlb_line_flushes.fetch_add(1, Ordering::Relaxed);
        }
        fn clear_exclusive_monitor(&self) {
            let _ = self.0.clrex_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn test_config() -> MmuConfig {
        MmuConfig {
            pool_pa: 0x0100_0000,
            pool_size: 0x4_0000,
            image_pa: 0x0100_0000,
            image_va: 0x0100_0000,
            image_size: 0x4_0000,
            high_vectors: true,
        }
    }

    pub(crate) fn test_mmu() -> Mmu {
        Mmu::init(&test_config(), Box::new(FakeHostCpu::default())).unwrap()
    }

    fn small_page(va: u32, pa: u32) -> PageRecord {
        PageRecord {
            pa,
            va,
            sz: SMALL_PAGE_SIZE,
            imp: 0,
            dom: descriptor::DOM_VCPU_NOMMU,
            ap: descriptor::AP_SRW_U_RW,
            ..Default::default()
        }
    }

    #[test]
    fn test_for_image_aligns_pool_behind_image() {
        let cfg = MmuConfig::for_image(0x0100_0000, 0x0100_0000, 0x1234, true);
        assert_eq!(cfg.pool_pa % descriptor::TTBL_MAX_SIZE as u32, 0);
        assert!(cfg.pool_pa >= 0x0100_1234);
        assert_eq!(cfg.pool_size, crate::config::DEFAULT_TTBL_POOL_SIZE);
    }

    #[test]
    fn test_init_maps_image_and_vectors() {
        let mmu = test_mmu();
        let pg = mmu.get_reserved_page(0x0100_0000).unwrap();
        assert_eq!(pg.pa, 0x0100_0000);
        assert_eq!(pg.sz, SECTION_PAGE_SIZE);
        assert_eq!(pg.imp, IMP_RESERVED);
        let vec = mmu.get_reserved_page(crate::config::IRQ_HIGHVEC_BASE).unwrap();
        assert_eq!(vec.va, 0xfff0_0000);
    }

    #[test]
    fn test_map_get_unmap_roundtrip() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let pg = small_page(0x4000_1000, 0x8000_1000);
        mmu.map_page(l1, &pg).unwrap();

        let got = mmu.get_page(l1, 0x4000_1000).unwrap();
        assert_eq!(got.pa, pg.pa);
        assert_eq!(got.sz, pg.sz);
        assert_eq!(got.imp, pg.imp);
        assert_eq!(got.ap, pg.ap);
        assert_eq!(got.dom, pg.dom);

        mmu.unmap_page(l1, &got).unwrap();
        assert_eq!(mmu.get_page(l1, 0x4000_1000), Err(Error::NotAvail));
    }

    #[test]
    fn test_unmap_twice_fails_second_time() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let pg = small_page(0x4000_0000, 0x8000_0000);
        mmu.map_page(l1, &pg).unwrap();
        assert!(mmu.unmap_page(l1, &pg).is_ok());
        assert!(mmu.unmap_page(l1, &pg).is_err());
    }

    #[test]
    fn test_unmap_absent_page_fails() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        assert!(mmu.unmap_page(l1, &small_page(0x5000_0000, 0x5000_0000)).is_err());
    }

    #[test]
    fn test_map_rejects_differing_imp_tag() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        // The image section carries the reserved tag; a non-reserved page
        // overlapping it must be refused.
        let pg = small_page(0x0100_0000, 0x9000_0000);
        assert_eq!(mmu.map_page(l1, &pg), Err(Error::Fail));
    }

    #[test]
    fn test_section_replaces_overlapping_small_pages() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        mmu.map_page(l1, &small_page(0x4000_0000, 0x8000_0000)).unwrap();
        mmu.map_page(l1, &small_page(0x4000_2000, 0x8000_2000)).unwrap();

        let sect = PageRecord {
            pa: 0x9000_0000,
            va: 0x4000_0000,
            sz: SECTION_PAGE_SIZE,
            dom: descriptor::DOM_VCPU_NOMMU,
            ap: descriptor::AP_SRW_U_RW,
            ..Default::default()
        };
        mmu.map_page(l1, &sect).unwrap();
        let got = mmu.get_page(l1, 0x4000_2000).unwrap();
        assert_eq!(got.sz, SECTION_PAGE_SIZE);
        assert_eq!(got.pa, 0x9000_0000);
    }

    #[test]
    fn test_large_page_roundtrip() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let pg = PageRecord {
            pa: 0x8001_0000,
            va: 0x4001_0000,
            sz: LARGE_PAGE_SIZE,
            dom: descriptor::DOM_VCPU_NOMMU,
            ap: descriptor::AP_SRW_U_RW,
            ..Default::default()
        };
        mmu.map_page(l1, &pg).unwrap();
        // Any address inside the 64K block resolves to the same record.
        let got = mmu.get_page(l1, 0x4001_e000).unwrap();
        assert_eq!(got.pa, 0x8001_0000);
        assert_eq!(got.sz, LARGE_PAGE_SIZE);
        mmu.unmap_page(l1, &got).unwrap();
        assert_eq!(mmu.get_page(l1, 0x4001_0000), Err(Error::NotAvail));
    }

    #[test]
    fn test_reserved_page_mirrored_into_new_l1() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let pg = PageRecord {
            pa: 0x8000_0000,
            va: 0x8000_0000,
            sz: SECTION_PAGE_SIZE,
            imp: IMP_RESERVED,
            dom: descriptor::DOM_RESERVED,
            ap: descriptor::AP_SRW_U_RW,
            ..Default::default()
        };
        mmu.map_reserved_page(&pg).unwrap();

        let a = mmu.get_reserved_page(0x8000_0000).unwrap();
        let b = mmu.get_page(l1, 0x8000_0000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pa, 0x8000_0000);

        mmu.unmap_reserved_page(&pg).unwrap();
        assert_eq!(mmu.get_reserved_page(0x8000_0000), Err(Error::NotAvail));
        assert_eq!(mmu.get_page(l1, 0x8000_0000), Err(Error::NotAvail));
    }

    #[test]
    fn test_reserved_page_requires_tag() {
        let mmu = test_mmu();
        let pg = PageRecord {
            pa: 0x8000_0000,
            va: 0x8000_0000,
            sz: SECTION_PAGE_SIZE,
            imp: 0,
            ..Default::default()
        };
        assert_eq!(mmu.map_reserved_page(&pg), Err(Error::Fail));
    }

    #[test]
    fn test_l1_clone_sees_default_mappings() {
        let mmu = test_mmu();
        // Install a reserved small page first so the default L1 owns an
        // L2 that must be deep-copied.
        let pg = PageRecord {
            pa: 0x8000_3000,
            va: 0x8000_3000,
            sz: SMALL_PAGE_SIZE,
            imp: IMP_RESERVED,
            dom: descriptor::DOM_RESERVED,
            ap: descriptor::AP_SRW_U_RW,
            ..Default::default()
        };
        mmu.map_reserved_page(&pg).unwrap();

        let l1 = mmu.l1tbl_alloc().unwrap();
        let got = mmu.get_page(l1, 0x8000_3000).unwrap();
        assert_eq!(got.pa, 0x8000_3000);
        assert_eq!(got.sz, SMALL_PAGE_SIZE);

        // The clone's mapping is backed by its own L2: unmapping in the
        // clone leaves the default untouched.
        mmu.unmap_page(l1, &got).unwrap();
        assert!(mmu.get_reserved_page(0x8000_3000).is_ok());
    }

    #[test]
    fn test_unmap_line_invalidates_tlb_when_current() {
        let hw = FakeHostCpu::default();
        let mmu = Mmu::init(&test_config(), Box::new(hw.clone())).unwrap();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let pg = small_page(0x4000_0000, 0x8000_0000);
        mmu.map_page(l1, &pg).unwrap();

        // Not current: no line invalidation.
        mmu.unmap_page(l1, &pg).unwrap();
        assert_eq!(hw.0.tlb_line_flushes.load(Ordering::Relaxed), 0);

        // Current: line invalidation recorded.
        mmu.map_page(l1, &pg).unwrap();
        mmu.chttbr(l1).unwrap();
        mmu.unmap_page(l1, &pg).unwrap();
        assert_eq!(hw.0.tlb_line_flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_detached_l2_reuse_carries_no_stale_entries() {
        let mmu = test_mmu();
        let l1 = mmu.l1tbl_alloc().unwrap();
        let a = small_page(0x4000_1000, 0x8000_1000);
        mmu.map_page(l1, &a).unwrap();
        // Unmapping the only page detaches and zeroes the L2.
        mmu.unmap_page(l1, &a).unwrap();

        // The next small-page map in the same section reuses that L2;
        // nothing of the old mapping may shine through.
        let b = small_page(0x4000_2000, 0x8000_2000);
        mmu.map_page(l1, &b).unwrap();
        assert_eq!(mmu.get_page(l1, 0x4000_1000), Err(Error::NotAvail));
        assert_eq!(mmu.get_page(l1, 0x4000_2000).unwrap().pa, 0x8000_2000);
    }

    #[test]
    fn test_chdacr_preserves_domain_zero() {
        let mmu = test_mmu();
        // Init left domain 0 as client.
        mmu.chdacr(0xffff_fffc);
        let dacr = mmu.hw().read_dacr();
        assert_eq!(dacr & 0x3, descriptor::DACR_CLIENT);
    }
}

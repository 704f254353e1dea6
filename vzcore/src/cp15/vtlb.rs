//! The module containing the per-vcpu virtual TLB: a bounded round-robin
//! cache of stage-1 mappings installed on behalf of a guest running with
//! its MMU disabled.

use crate::error::Result;
use crate::mmu::descriptor::PageRecord;
use crate::mmu::{L1Handle, Mmu};
use alloc::vec;
use alloc::vec::Vec;

/// One virtual TLB slot.
#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    page: PageRecord,
    asid: u8,
    dom: u8,
    valid: bool,
}

/// The virtual TLB. The victim cursor advances modulo the configured
/// entry count; installing into an occupied victim slot first unmaps its
/// previous backing.
#[derive(Debug)]
pub struct VirtTlb {
    slots: Vec<Slot>,
    victim: usize,
}

impl VirtTlb {
    /// Creates a TLB with `count` slots, all invalid.
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![Slot::default(); count.max(1)],
            victim: 0,
        }
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Current victim index.
    pub fn victim(&self) -> usize {
        self.victim
    }

    /// Unmaps the current victim's backing from `l1` if the slot is
    /// valid, leaving the slot free for [`VirtTlb::install`].
    pub fn evict_victim(&mut self, mmu: &Mmu, l1: L1Handle) -> Result<()> {
        let slot = &mut self.slots[self.victim];
        if slot.valid {
            mmu.unmap_page(l1, &slot.page)?;
            slot.valid = false;
        }
        Ok(())
    }

    /// Maps `page` into `l1`, records it in the victim slot and advances
    /// the victim cursor.
    pub fn install(
        &mut self,
        mmu: &Mmu,
        l1: L1Handle,
        page: &PageRecord,
        asid: u8,
        dom: u8,
    ) -> Result<()> {
        mmu.map_page(l1, page)?;
        self.slots[self.victim] = Slot {
            page: *page,
            asid,
            dom,
            valid: true,
        };
        self.victim = (self.victim + 1) % self.slots.len();
        Ok(())
    }

    /// Unmaps every valid entry from `l1` and invalidates the whole
    /// cache.
    pub fn flush(&mut self, mmu: &Mmu, l1: L1Handle) -> Result<()> {
        for slot in &mut self.slots {
            if slot.valid {
                mmu.unmap_page(l1, &slot.page)?;
                slot.valid = false;
            }
        }
        Ok(())
    }

    /// The page record cached in `slot`, if valid.
    pub fn page(&self, slot: usize) -> Option<&PageRecord> {
        let s = self.slots.get(slot)?;
        s.valid.then_some(&s.page)
    }
}

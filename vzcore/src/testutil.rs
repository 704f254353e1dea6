//! Shared collaborator doubles for the unit tests.

use crate::config::VcpuConfig;
use crate::mmu::tests::{test_config, FakeHostCpu};
use crate::mmu::Mmu;
use crate::platform::{
    AddressSpace, DeviceBus, GenTimerContext, GenericTimerHooks, GuestId, GuestIrq, GuestRegion,
    IrqSink, Platform, Scheduler, Vgic, VcpuId,
};
use crate::vcpu::Vcpu;
use alloc::boxed::Box;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct FakeScheduler {
    pub(crate) current: Mutex<Option<VcpuId>>,
    pub(crate) halted: Mutex<Vec<VcpuId>>,
    pub(crate) irq_waits: AtomicU32,
}

impl Scheduler for FakeScheduler {
    fn current_vcpu(&self) -> Option<VcpuId> {
        *self.current.lock().unwrap()
    }
    fn halt(&self, vcpu: VcpuId) {
        self.halted.lock().unwrap().push(vcpu);
    }
    fn irq_wait(&self, _vcpu: VcpuId) {
        let _ = self.irq_waits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Device bus double: a sparse byte store keyed by guest-physical
/// address, plus an access log.
#[derive(Default)]
pub(crate) struct FakeBus {
    pub(crate) mem: Mutex<BTreeMap<u32, u8>>,
    pub(crate) reads: AtomicU32,
    pub(crate) writes: AtomicU32,
}

impl DeviceBus for FakeBus {
    fn emulate_read(&self, _guest: GuestId, gpa: u32, buf: &mut [u8]) -> crate::Result<()> {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
        let mem = self.mem.lock().unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = mem.get(&(gpa + i as u32)).copied().unwrap_or(0);
        }
        Ok(())
    }
    fn emulate_write(&self, _guest: GuestId, gpa: u32, buf: &[u8]) -> crate::Result<()> {
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
        let mut mem = self.mem.lock().unwrap();
        for (i, b) in buf.iter().enumerate() {
            let _ = mem.insert(gpa + i as u32, *b);
        }
        Ok(())
    }
}

/// Address space double: a fixed region list over a sparse backing
/// store.
#[derive(Default)]
pub(crate) struct FakeAddressSpace {
    pub(crate) regions: Vec<GuestRegion>,
    pub(crate) mem: Mutex<BTreeMap<u32, u8>>,
}

impl AddressSpace for FakeAddressSpace {
    fn get_region(&self, _guest: GuestId, gpa: u32) -> Option<GuestRegion> {
        self.regions
            .iter()
            .copied()
            .find(|r| gpa >= r.gphys && gpa - r.gphys < r.size)
    }
    fn read(&self, pa: u32, buf: &mut [u8]) -> crate::Result<()> {
        let mem = self.mem.lock().unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = mem.get(&(pa + i as u32)).copied().unwrap_or(0);
        }
        Ok(())
    }
    fn write(&self, pa: u32, buf: &[u8]) -> crate::Result<()> {
        let mut mem = self.mem.lock().unwrap();
        for (i, b) in buf.iter().enumerate() {
            let _ = mem.insert(pa + i as u32, *b);
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeIrqSink {
    pub(crate) asserted: Mutex<Vec<(VcpuId, GuestIrq, u32)>>,
}

impl IrqSink for FakeIrqSink {
    fn assert(&self, vcpu: VcpuId, irq: GuestIrq, data: u32) {
        self.asserted.lock().unwrap().push((vcpu, irq, data));
    }
}

#[derive(Default)]
pub(crate) struct FakeVgic {
    pub(crate) saves: AtomicU32,
    pub(crate) restores: AtomicU32,
    pub(crate) cleanups: AtomicU32,
}

impl Vgic for FakeVgic {
    fn save(&self, _vcpu: VcpuId) {
        let _ = self.saves.fetch_add(1, Ordering::Relaxed);
    }
    fn restore(&self, _vcpu: VcpuId) {
        let _ = self.restores.fetch_add(1, Ordering::Relaxed);
    }
    fn cleanup(&self, _vcpu: VcpuId) {
        let _ = self.cleanups.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub(crate) struct FakeTimer {
    pub(crate) inits: AtomicU32,
    pub(crate) saves: AtomicU32,
    pub(crate) restores: AtomicU32,
}

impl GenericTimerHooks for FakeTimer {
    fn context_init(&self, _ctx: &mut GenTimerContext) {
        let _ = self.inits.fetch_add(1, Ordering::Relaxed);
    }
    fn context_save(&self, _ctx: &mut GenTimerContext) {
        let _ = self.saves.fetch_add(1, Ordering::Relaxed);
    }
    fn context_restore(&self, _ctx: &GenTimerContext) {
        let _ = self.restores.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bundle of doubles plus the MMU, ready to hand to the core.
pub(crate) struct TestEnv {
    pub(crate) mmu: Mmu,
    pub(crate) hw: FakeHostCpu,
    pub(crate) sched: FakeScheduler,
    pub(crate) bus: FakeBus,
    pub(crate) aspace: FakeAddressSpace,
    pub(crate) irq: FakeIrqSink,
    pub(crate) vgic: FakeVgic,
    pub(crate) timer: FakeTimer,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let hw = FakeHostCpu::default();
        let mmu = Mmu::init(&test_config(), Box::new(hw.clone())).unwrap();
        Self {
            mmu,
            hw,
            sched: FakeScheduler::default(),
            bus: FakeBus::default(),
            aspace: FakeAddressSpace::default(),
            irq: FakeIrqSink::default(),
            vgic: FakeVgic::default(),
            timer: FakeTimer::default(),
        }
    }

    pub(crate) fn with_regions(regions: Vec<GuestRegion>) -> Self {
        let mut env = Self::new();
        env.aspace.regions = regions;
        env
    }

    pub(crate) fn platform(&self) -> Platform<'_> {
        Platform {
            sched: &self.sched,
            bus: &self.bus,
            aspace: &self.aspace,
            irq: &self.irq,
            vgic: &self.vgic,
            timer: &self.timer,
        }
    }

    /// Builds and initializes a normal vcpu of the given model.
    pub(crate) fn vcpu(&self, id: VcpuId, guest_index: u32, compatible: &str) -> Vcpu {
        let mut vcpu = Vcpu::new(id, 1, guest_index, true);
        vcpu.start_pc = 0x8000;
        let cfg = VcpuConfig::new(compatible);
        vcpu.init(&cfg, &self.mmu, &self.platform()).unwrap();
        vcpu
    }
}

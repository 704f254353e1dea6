//! The module containing the contracts between the core and its
//! collaborator subsystems: scheduler, device-emulation bus, guest
//! address space, interrupt injection, vGIC, generic timer and the host
//! CPU itself.
//!
//! The core never reaches outside these traits. Embedders implement them
//! against the real hypervisor services; the unit tests implement them as
//! recording doubles.

use crate::error::Result;

/// Identifier of a vcpu within the whole system.
pub type VcpuId = u32;

/// Identifier of a guest.
pub type GuestId = u32;

/// Exceptions the core can inject into a guest, in architectural vector
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestIrq {
    /// Reset vector.
    Reset = 0,
    /// Undefined instruction.
    UndefinedInstruction = 1,
    /// Software interrupt.
    SoftIrq = 2,
    /// Prefetch abort.
    PrefetchAbort = 3,
    /// Data abort.
    DataAbort = 4,
    /// Hypervisor trap slot; unused by guests.
    HypTrap = 5,
    /// External interrupt.
    ExternalIrq = 6,
    /// External fast interrupt.
    ExternalFiq = 7,
}

/// Number of exception vectors.
pub const IRQ_COUNT: u32 = 8;

/// A record of one guest-physical region, as kept by the guest address
/// space collaborator.
#[derive(Clone, Copy, Debug)]
pub struct GuestRegion {
    /// Guest-physical base of the region.
    pub gphys: u32,
    /// Host-physical base backing the region.
    pub hphys: u32,
    /// Region size in bytes.
    pub size: u32,
    /// Whether the region is emulated (device) rather than real memory.
    pub is_virtual: bool,
}

/// The scheduler owning every vcpu's run state. Halt is idempotent; the
/// core may call it from within a trap handler.
pub trait Scheduler {
    /// The vcpu currently running on the calling host CPU, if any.
    fn current_vcpu(&self) -> Option<VcpuId>;

    /// Makes `vcpu` unschedulable until its guest is reset.
    fn halt(&self, vcpu: VcpuId);

    /// Blocks `vcpu` until an interrupt is asserted for it. Backs WFI/WFE
    /// trap handling.
    fn irq_wait(&self, vcpu: VcpuId);
}

/// The device-emulation bus. Reads and writes are addressed by
/// guest-physical address; the core routes permission-faulting guest
/// loads/stores on virtual regions here. The core never holds one of its
/// own locks across these calls.
pub trait DeviceBus {
    /// Emulates a read of `buf.len()` bytes at `gpa`.
    fn emulate_read(&self, guest: GuestId, gpa: u32, buf: &mut [u8]) -> Result<()>;

    /// Emulates a write of `buf.len()` bytes at `gpa`.
    fn emulate_write(&self, guest: GuestId, gpa: u32, buf: &[u8]) -> Result<()>;
}

/// The guest address space: region lookup for the virtual TLB refill path
/// plus raw access to the host memory backing real regions.
pub trait AddressSpace {
    /// Returns the region containing `gpa`, if any.
    fn get_region(&self, guest: GuestId, gpa: u32) -> Option<GuestRegion>;

    /// Reads host memory at host-physical `pa`.
    fn read(&self, pa: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes host memory at host-physical `pa`.
    fn write(&self, pa: u32, buf: &[u8]) -> Result<()>;
}

/// Interrupt injection into a guest vcpu.
pub trait IrqSink {
    /// Asserts exception `irq` on `vcpu` with auxiliary `data`.
    fn assert(&self, vcpu: VcpuId, irq: GuestIrq, data: u32);
}

/// The virtual GIC state hooks called from the context-switch path.
pub trait Vgic {
    /// Saves the distributor/CPU-interface state of `vcpu`.
    fn save(&self, vcpu: VcpuId);

    /// Restores the distributor/CPU-interface state of `vcpu`.
    fn restore(&self, vcpu: VcpuId);

    /// Drops any state held for `vcpu`.
    fn cleanup(&self, vcpu: VcpuId);
}

/// Per-vcpu context of the architected generic timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenTimerContext {
    /// Virtual offset applied to the guest's counter reads.
    pub cntvoff: u64,
    /// Timer control register image.
    pub cntkctl: u32,
    /// Virtual timer compare value.
    pub cntv_cval: u64,
    /// Virtual timer control image.
    pub cntv_ctl: u32,
    /// Host interrupt of the guest's physical timer.
    pub phys_timer_irq: u32,
    /// Host interrupt of the guest's virtual timer.
    pub virt_timer_irq: u32,
}

/// The generic-timer driver hooks, called only when the vcpu's model has
/// the feature bit.
pub trait GenericTimerHooks {
    /// Initializes the context at vcpu reset.
    fn context_init(&self, ctx: &mut GenTimerContext);

    /// Saves the hardware timer state into `ctx`.
    fn context_save(&self, ctx: &mut GenTimerContext);

    /// Loads the hardware timer state from `ctx`.
    fn context_restore(&self, ctx: &GenTimerContext);
}

/// The host CPU's MMU and synchronization primitives, used by the MMU
/// core and the context-switch path. On a real host these are single
/// system-register or TLB-maintenance instructions; the unit tests record
/// them.
pub trait HostCpu {
    /// Reads the active translation table base.
    fn read_ttbr0(&self) -> u32;

    /// Points the hardware at a new translation table base.
    fn write_ttbr0(&self, pa: u32);

    /// Reads the domain access control register.
    fn read_dacr(&self) -> u32;

    /// Writes the domain access control register.
    fn write_dacr(&self, dacr: u32);

    /// Reads the system control register.
    fn read_sctlr(&self) -> u32;

    /// Invalidates the entire TLB.
    fn invalidate_tlb(&self);

    /// Invalidates the TLB entry covering `va`.
    fn invalidate_tlb_line(&self, va: u32);

    /// Clears the local exclusive monitor.
    fn clear_exclusive_monitor(&self);

    /// Loads the hypervisor configuration register before entering a
    /// guest. No-op on hosts without the virtualization extension.
    fn write_hcr(&self, _hcr: u32) {}

    /// Loads the coprocessor trap register before entering a guest.
    fn write_hcptr(&self, _hcptr: u32) {}

    /// Loads the system-register trap register before entering a guest.
    fn write_hstr(&self, _hstr: u32) {}

    /// Cleans the instruction cache before a table switch. Platforms that
    /// do not need it leave the default no-op.
    fn clean_icache(&self) {}

    /// Cleans the data cache before a table switch. Platforms that do not
    /// need it leave the default no-op.
    fn clean_dcache(&self) {}
}

/// The collaborator bundle threaded through trap handling and context
/// switching.
pub struct Platform<'a> {
    /// Scheduler owning vcpu run states.
    pub sched: &'a dyn Scheduler,
    /// Device-emulation bus.
    pub bus: &'a dyn DeviceBus,
    /// Guest address space.
    pub aspace: &'a dyn AddressSpace,
    /// Exception injection.
    pub irq: &'a dyn IrqSink,
    /// Virtual GIC hooks.
    pub vgic: &'a dyn Vgic,
    /// Generic-timer hooks.
    pub timer: &'a dyn GenericTimerHooks,
}

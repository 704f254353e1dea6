//! The module containing the [`Vcpu`] type: one virtual CPU, its
//! user-register frame, its mode-banked private frame, and the CPSR/SPSR
//! arbitration between them.

use crate::config::VcpuConfig;
use crate::cp15::{self, Cp15};
use crate::dispatch::{HCPTR_RESET, HCR_RESET, HCR_VIRT_EXC_MASK, HSTR_RESET};
use crate::error::{Error, Result};
use crate::features::{CpuModel, Feature, Features};
use crate::mmu::{L1Handle, Mmu};
use crate::platform::{GenTimerContext, GuestId, Platform, Scheduler, VcpuId};
use crate::psr::{
    Mode, PSR_ASYNC_ABORT_MASKED, PSR_FIQ_MASKED, PSR_IRQ_MASKED, PSR_MODE_MASK, PSR_PRIV_BITS,
    PSR_USER_BITS, PSR_Z,
};
use crate::reg_bank::{banked_restore, banked_save, BankedRegs};
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::info;
use spin::{Mutex, MutexGuard};

/// Number of general-purpose registers in the user frame.
pub const GPR_COUNT: usize = 13;

/// The frame written by the low-level trap entry and read by the
/// dispatcher. Field order is frozen; assembly addresses it through
/// [`layout`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UserRegs {
    /// r0-r12.
    pub gpr: [u32; GPR_COUNT],
    /// Stack pointer of the current mode.
    pub sp: u32,
    /// Link register of the current mode.
    pub lr: u32,
    /// Program counter.
    pub pc: u32,
    /// The live PSR: user-visible bits are authoritative here, the
    /// privileged bits live in the shadow PSR of the private frame.
    pub cpsr: u32,
}
const _: () = assert!(core::mem::size_of::<UserRegs>() == (GPR_COUNT + 4) * 4);

/// The private frame of a normal vcpu: everything that exists only for
/// guest vcpus and not for hypervisor worker contexts.
#[derive(Debug)]
pub struct PrivateRegs {
    /// Shadow PSR carrying the privileged bits.
    pub cpsr: u32,
    /// The mode-banked register file.
    pub bank: BankedRegs,
    /// Feature bitmap of the emulated model.
    pub features: Features,
    /// Shadow cp15 state.
    pub cp15: Cp15,
    /// Hypervisor configuration register shadow.
    pub hcr: u32,
    /// Coprocessor trap register shadow.
    pub hcptr: u32,
    /// System-register trap register shadow.
    pub hstr: u32,
    /// Generic-timer context; meaningful only with the feature bit.
    pub gentimer: GenTimerContext,
}

/// Scheduling states of a vcpu. Transitions are owned by the scheduler;
/// the core only ever forces [`VcpuState::Halted`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VcpuState {
    /// Not yet initialized.
    #[default]
    Unknown,
    /// Initialized and waiting for the first run.
    Reset,
    /// Runnable.
    Ready,
    /// Executing on some host CPU.
    Running,
    /// Stopped, resumable.
    Paused,
    /// Terminally stopped until guest reset.
    Halted,
}

/// One virtual CPU.
#[derive(Debug)]
pub struct Vcpu {
    /// System-wide identifier.
    pub id: VcpuId,
    /// Owning guest.
    pub guest: GuestId,
    /// Index of this vcpu within its guest; feeds the synthesized MPIDR.
    pub guest_index: u32,
    /// Scheduling state.
    pub state: VcpuState,
    /// Entry point installed at reset.
    pub start_pc: u32,
    /// Initial stack pointer of orphan vcpus.
    pub start_sp: u32,
    /// True for guest vcpus; false for hypervisor worker contexts, which
    /// have no private frame.
    pub is_normal: bool,
    /// Number of resets so far; distinguishes first-init from re-init.
    pub reset_count: u32,
    /// The user-register frame.
    pub regs: UserRegs,
    priv_regs: Option<Box<PrivateRegs>>,
}

impl Vcpu {
    /// Creates an uninitialized vcpu. [`Vcpu::init`] must run before any
    /// other operation.
    pub fn new(id: VcpuId, guest: GuestId, guest_index: u32, is_normal: bool) -> Self {
        Self {
            id,
            guest,
            guest_index,
            state: VcpuState::Unknown,
            start_pc: 0,
            start_sp: 0,
            is_normal,
            reset_count: 0,
            regs: UserRegs::default(),
            priv_regs: None,
        }
    }

    /// The private frame. Fails for orphan vcpus, which must never
    /// dereference one.
    pub fn private(&self) -> Result<&PrivateRegs> {
        self.priv_regs.as_deref().ok_or(Error::Fail)
    }

    /// The private frame, mutably.
    pub fn private_mut(&mut self) -> Result<&mut PrivateRegs> {
        self.priv_regs.as_deref_mut().ok_or(Error::Fail)
    }

    /// Feature bitmap; empty for orphan vcpus.
    pub fn features(&self) -> Features {
        self.priv_regs
            .as_deref()
            .map_or(Features::none(), |p| p.features)
    }

    /// Whether the emulated model has `feature`.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features().has(feature)
    }

    /// The current mode according to the shadow PSR (live PSR for
    /// orphans).
    pub fn mode(&self) -> Result<Mode> {
        let bits = match self.priv_regs.as_deref() {
            Some(p) => p.cpsr,
            None => self.regs.cpsr,
        };
        Mode::try_from(bits)
    }

    /// Initializes (or re-initializes) the vcpu: zeroes the user frame,
    /// installs the reset PC and PSR, allocates the private frame on the
    /// first reset, and sets up cp15 state.
    pub fn init(&mut self, cfg: &VcpuConfig, mmu: &Mmu, platform: &Platform<'_>) -> Result<()> {
        self.regs = UserRegs::default();
        self.regs.pc = self.start_pc;
        if self.is_normal {
            self.regs.cpsr = PSR_Z | PSR_ASYNC_ABORT_MASKED | Mode::User as u32;
        } else {
            self.regs.cpsr = PSR_Z | PSR_ASYNC_ABORT_MASKED | Mode::Supervisor as u32;
            self.regs.sp = self.start_sp;
            self.state = VcpuState::Reset;
            return Ok(());
        }

        let model = CpuModel::from_compatible(&cfg.compatible).ok_or(Error::Invalid)?;
        if self.reset_count == 0 {
            self.priv_regs = Some(Box::new(PrivateRegs {
                cpsr: PSR_ASYNC_ABORT_MASKED
                    | PSR_IRQ_MASKED
                    | PSR_FIQ_MASKED
                    | Mode::Supervisor as u32,
                bank: BankedRegs::default(),
                features: model.features(),
                cp15: Cp15::default(),
                hcr: HCR_RESET,
                hcptr: HCPTR_RESET,
                hstr: HSTR_RESET,
                gentimer: GenTimerContext::default(),
            }));
            platform.vgic.cleanup(self.id);
            cp15::init(self, model, cfg, mmu)?;
        } else {
            let p = self.private_mut()?;
            p.bank = BankedRegs::default();
            p.hcr &= !HCR_VIRT_EXC_MASK;
            let mut regs = self.regs;
            self.cpsr_update(
                &mut regs,
                PSR_Z
                    | PSR_ASYNC_ABORT_MASKED
                    | PSR_IRQ_MASKED
                    | PSR_FIQ_MASKED
                    | Mode::Supervisor as u32,
                crate::psr::PSR_ALL_BITS,
                mmu,
                platform.sched,
            )?;
            self.regs = regs;
            cp15::reset(self, mmu)?;
        }

        if self.has_feature(Feature::GenTimer) {
            let p = self.private_mut()?;
            p.gentimer.phys_timer_irq = cfg.gentimer_phys_irq;
            p.gentimer.virt_timer_irq = cfg.gentimer_virt_irq;
            let mut ctx = p.gentimer;
            platform.timer.context_init(&mut ctx);
            self.private_mut()?.gentimer = ctx;
        }

        self.reset_count += 1;
        self.state = VcpuState::Reset;
        Ok(())
    }

    /// Tears the vcpu down: cp15 first, then the private frame, then the
    /// user frame.
    pub fn deinit(&mut self, mmu: &Mmu) -> Result<()> {
        if self.is_normal {
            cp15::deinit(self, mmu)?;
            self.priv_regs = None;
        }
        self.regs = UserRegs::default();
        self.state = VcpuState::Unknown;
        Ok(())
    }

    /// Returns a PSR merging the user-visible bits of the live frame with
    /// the privileged bits of the shadow PSR.
    pub fn cpsr_retrieve(&self, regs: &UserRegs) -> u32 {
        match self.priv_regs.as_deref() {
            Some(p) => (regs.cpsr & PSR_USER_BITS) | (p.cpsr & !PSR_USER_BITS),
            None => regs.cpsr,
        }
    }

    /// Applies `new & mask` to the PSR pair. When the mode field changes,
    /// the outgoing mode's banked registers are saved, the incoming
    /// mode's are loaded, and cp15 recomputes the DACR implied by the new
    /// mode. An unknown mode in `new` fails with no state change.
    pub fn cpsr_update(
        &mut self,
        regs: &mut UserRegs,
        new: u32,
        mask: u32,
        mmu: &Mmu,
        sched: &dyn Scheduler,
    ) -> Result<()> {
        if !self.is_normal {
            return Err(Error::Fail);
        }
        let new = new & mask;
        let cur_mode = self.mode()?;
        let mut mode_change = false;
        let mut new_mode = cur_mode;
        if mask & PSR_MODE_MASK != 0 && (cur_mode as u32) != (new & PSR_MODE_MASK) {
            new_mode = Mode::try_from(new)?;
            mode_change = true;
            let p = self.private_mut()?;
            banked_save(&mut p.bank, cur_mode, regs);
        }

        let p = self.private_mut()?;
        p.cpsr &= !PSR_PRIV_BITS | !mask;
        p.cpsr |= new & PSR_PRIV_BITS & mask;
        regs.cpsr &= !PSR_USER_BITS | !mask;
        regs.cpsr |= new & PSR_USER_BITS & mask;

        if mode_change {
            let p = self.private_mut()?;
            banked_restore(&p.bank, new_mode, regs);
            cp15::sync_cpsr(self, mmu, sched)?;
        }
        Ok(())
    }

    /// The SPSR belonging to the current mode; 0 where the mode has
    /// none.
    pub fn spsr_retrieve(&self) -> u32 {
        let Ok(p) = self.private() else {
            return 0;
        };
        let Ok(mode) = Mode::try_from(p.cpsr) else {
            return 0;
        };
        p.bank.spsr(mode)
    }

    /// Applies `new & mask` to the current mode's SPSR. Fails from User
    /// mode (no SPSR there) without modifying anything.
    pub fn spsr_update(&mut self, new: u32, mask: u32) -> Result<()> {
        if !self.is_normal {
            return Err(Error::Fail);
        }
        let mode = self.mode()?;
        if mode == Mode::User {
            return Err(Error::Fail);
        }
        let new = new & mask;
        let p = self.private_mut()?;
        // System shares the User bank and has no SPSR either; writes
        // from it are discarded.
        if let Some(slot) = p.bank.spsr_mut(mode) {
            *slot &= !mask;
            *slot |= new;
        }
        Ok(())
    }

    /// Reads register `n` in the current mode, out of the live frame.
    pub fn reg_read(&self, regs: &UserRegs, num: u32) -> u32 {
        match num {
            0..=12 => regs.gpr[num as usize],
            13 => regs.sp,
            14 => regs.lr,
            15 => regs.pc,
            _ => 0,
        }
    }

    /// Writes register `n` in the current mode: the live frame always,
    /// and the current mode's banked slot for r8-r14 so the banked store
    /// stays coherent.
    pub fn reg_write(&mut self, regs: &mut UserRegs, num: u32, val: u32) {
        let mode = self.mode().unwrap_or(Mode::User);
        match num {
            0..=7 => regs.gpr[num as usize] = val,
            8..=12 => {
                regs.gpr[num as usize] = val;
                if let Ok(p) = self.private_mut() {
                    p.bank.gpr_bank_mut(mode)[num as usize - 8] = val;
                }
            }
            13 => {
                regs.sp = val;
                if let Ok(p) = self.private_mut() {
                    p.bank.set_sp(mode, val);
                }
            }
            14 => {
                regs.lr = val;
                if let Ok(p) = self.private_mut() {
                    p.bank.set_lr(mode, val);
                }
            }
            15 => regs.pc = val,
            _ => {}
        }
    }

    /// Reads register `n` as seen from `mode`. Delegates to the simple
    /// form when `mode` is current; otherwise consults the banked store.
    pub fn regmode_read(&self, regs: &UserRegs, mode: Mode, num: u32) -> u32 {
        let cur = self.mode().unwrap_or(Mode::User);
        if mode == cur {
            return self.reg_read(regs, num);
        }
        let Ok(p) = self.private() else {
            return self.reg_read(regs, num);
        };
        match num {
            0..=7 => regs.gpr[num as usize],
            8..=12 => {
                if cur == Mode::Fiq {
                    p.bank.gpr_usr[num as usize - 8]
                } else if mode == Mode::Fiq {
                    p.bank.gpr_fiq[num as usize - 8]
                } else {
                    regs.gpr[num as usize]
                }
            }
            13 => p.bank.sp_lr(mode).map_or(0, |(sp, _)| sp),
            14 => p.bank.sp_lr(mode).map_or(0, |(_, lr)| lr),
            15 => regs.pc,
            _ => 0,
        }
    }

    /// Writes register `n` as seen from `mode`.
    pub fn regmode_write(&mut self, regs: &mut UserRegs, mode: Mode, num: u32, val: u32) {
        let cur = self.mode().unwrap_or(Mode::User);
        if mode == cur {
            self.reg_write(regs, num, val);
            return;
        }
        let Ok(p) = self.private_mut() else {
            return;
        };
        match num {
            0..=7 => regs.gpr[num as usize] = val,
            8..=12 => {
                if cur == Mode::Fiq {
                    p.bank.gpr_usr[num as usize - 8] = val;
                } else if mode == Mode::Fiq {
                    p.bank.gpr_fiq[num as usize - 8] = val;
                } else {
                    regs.gpr[num as usize] = val;
                }
            }
            13 => p.bank.set_sp(mode, val),
            14 => p.bank.set_lr(mode, val),
            15 => regs.pc = val,
            _ => {}
        }
    }

    /// Dumps the frame and makes the vcpu unschedulable. Idempotent.
    pub fn halt(&mut self, regs: &UserRegs, sched: &dyn Scheduler) {
        if self.state != VcpuState::Halted {
            self.dump_user_regs(regs);
            self.state = VcpuState::Halted;
            sched.halt(self.id);
        }
    }

    /// Pretty-prints the live frame.
    pub fn dump_user_regs(&self, regs: &UserRegs) {
        info!("  Core Registers");
        info!(
            "    SP={:#010x}  LR={:#010x}  PC={:#010x}",
            regs.sp, regs.lr, regs.pc
        );
        info!("    CPSR={:#010x}", self.cpsr_retrieve(regs));
        info!("  General Purpose Registers");
        for (i, gpr) in regs.gpr.iter().enumerate() {
            info!("    R{i:02}={gpr:#010x}");
        }
    }

    /// Diagnostic dump of the whole register state.
    pub fn dump(&self) {
        self.dump_user_regs(&self.regs);
        let Ok(p) = self.private() else {
            return;
        };
        let b = &p.bank;
        info!("  User Mode Registers (Banked)");
        info!("    SP={:#010x}  LR={:#010x}", b.sp_usr, b.lr_usr);
        info!("  Supervisor Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_svc, b.lr_svc, b.spsr_svc
        );
        info!("  Monitor Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_mon, b.lr_mon, b.spsr_mon
        );
        info!("  Abort Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_abt, b.lr_abt, b.spsr_abt
        );
        info!("  Undefined Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_und, b.lr_und, b.spsr_und
        );
        info!("  IRQ Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_irq, b.lr_irq, b.spsr_irq
        );
        info!("  FIQ Mode Registers (Banked)");
        info!(
            "    SP={:#010x}  LR={:#010x}  SPSR={:#010x}",
            b.sp_fiq, b.lr_fiq, b.spsr_fiq
        );
        for (i, gpr) in b.gpr_fiq.iter().enumerate() {
            info!("    R{:02}={gpr:#010x}", i + 8);
        }
    }
}

/// A guest: a set of vcpus and one stage-2 translation table behind its
/// own lock.
#[derive(Debug)]
pub struct Guest {
    /// Identifier.
    pub id: GuestId,
    /// Member vcpus.
    pub vcpus: Vec<VcpuId>,
    stage2: Mutex<Stage2>,
}

/// The stage-2 table of a guest.
#[derive(Debug, Default)]
pub struct Stage2 {
    /// Handle of the intermediate-physical to host-physical table, once
    /// built.
    pub l1: Option<L1Handle>,
}

impl Guest {
    /// Creates an empty guest.
    pub fn new(id: GuestId) -> Self {
        Self {
            id,
            vcpus: Vec::new(),
            stage2: Mutex::new(Stage2::default()),
        }
    }

    /// Locks and returns the stage-2 table state.
    pub fn stage2(&self) -> MutexGuard<'_, Stage2> {
        self.stage2.lock()
    }

    /// Releases the stage-2 table back to the pool.
    pub fn destroy(&self, mmu: &Mmu) -> Result<()> {
        let mut s2 = self.stage2.lock();
        if let Some(l1) = s2.l1.take() {
            mmu.l1tbl_free(l1)?;
        }
        Ok(())
    }
}

/// Compile-time field offsets referenced by the assembly trap trampoline.
pub mod layout {
    use super::UserRegs;
    use crate::reg_bank::BankedRegs;
    use core::mem::offset_of;

    /// Offset of r0-r12 in the user frame.
    pub const UREGS_GPR: usize = offset_of!(UserRegs, gpr);
    /// Offset of sp in the user frame.
    pub const UREGS_SP: usize = offset_of!(UserRegs, sp);
    /// Offset of lr in the user frame.
    pub const UREGS_LR: usize = offset_of!(UserRegs, lr);
    /// Offset of pc in the user frame.
    pub const UREGS_PC: usize = offset_of!(UserRegs, pc);
    /// Offset of cpsr in the user frame.
    pub const UREGS_CPSR: usize = offset_of!(UserRegs, cpsr);

    /// Offset of the shared r8-r12 bank.
    pub const BANK_GPR_USR: usize = offset_of!(BankedRegs, gpr_usr);
    /// Offset of the FIQ r8-r12 bank.
    pub const BANK_GPR_FIQ: usize = offset_of!(BankedRegs, gpr_fiq);
    /// Offset of sp_usr.
    pub const BANK_SP_USR: usize = offset_of!(BankedRegs, sp_usr);
    /// Offset of lr_usr.
    pub const BANK_LR_USR: usize = offset_of!(BankedRegs, lr_usr);
    /// Offset of sp_svc.
    pub const BANK_SP_SVC: usize = offset_of!(BankedRegs, sp_svc);
    /// Offset of lr_svc.
    pub const BANK_LR_SVC: usize = offset_of!(BankedRegs, lr_svc);
    /// Offset of spsr_svc.
    pub const BANK_SPSR_SVC: usize = offset_of!(BankedRegs, spsr_svc);
    /// Offset of sp_mon.
    pub const BANK_SP_MON: usize = offset_of!(BankedRegs, sp_mon);
    /// Offset of lr_mon.
    pub const BANK_LR_MON: usize = offset_of!(BankedRegs, lr_mon);
    /// Offset of spsr_mon.
    pub const BANK_SPSR_MON: usize = offset_of!(BankedRegs, spsr_mon);
    /// Offset of sp_abt.
    pub const BANK_SP_ABT: usize = offset_of!(BankedRegs, sp_abt);
    /// Offset of lr_abt.
    pub const BANK_LR_ABT: usize = offset_of!(BankedRegs, lr_abt);
    /// Offset of spsr_abt.
    pub const BANK_SPSR_ABT: usize = offset_of!(BankedRegs, spsr_abt);
    /// Offset of sp_und.
    pub const BANK_SP_UND: usize = offset_of!(BankedRegs, sp_und);
    /// Offset of lr_und.
    pub const BANK_LR_UND: usize = offset_of!(BankedRegs, lr_und);
    /// Offset of spsr_und.
    pub const BANK_SPSR_UND: usize = offset_of!(BankedRegs, spsr_und);
    /// Offset of sp_irq.
    pub const BANK_SP_IRQ: usize = offset_of!(BankedRegs, sp_irq);
    /// Offset of lr_irq.
    pub const BANK_LR_IRQ: usize = offset_of!(BankedRegs, lr_irq);
    /// Offset of spsr_irq.
    pub const BANK_SPSR_IRQ: usize = offset_of!(BankedRegs, spsr_irq);
    /// Offset of sp_fiq.
    pub const BANK_SP_FIQ: usize = offset_of!(BankedRegs, sp_fiq);
    /// Offset of lr_fiq.
    pub const BANK_LR_FIQ: usize = offset_of!(BankedRegs, lr_fiq);
    /// Offset of spsr_fiq.
    pub const BANK_SPSR_FIQ: usize = offset_of!(BankedRegs, spsr_fiq);

    const _: () = assert!(UREGS_SP == super::GPR_COUNT * 4);
    const _: () = assert!(UREGS_CPSR == UREGS_PC + 4);
    const _: () = assert!(BANK_GPR_FIQ == BANK_GPR_USR + 5 * 4);
    const _: () = assert!(BANK_SPSR_FIQ == BANK_SP_FIQ + 8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psr::{PSR_ALL_BITS, PSR_C, PSR_N};
    use crate::testutil::TestEnv;

    #[test]
    fn test_init_reset_values() {
        let env = TestEnv::new();
        let vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert_eq!(vcpu.state, VcpuState::Reset);
        assert_eq!(vcpu.regs.pc, 0x8000);
        assert_eq!(
            vcpu.regs.cpsr,
            PSR_Z | PSR_ASYNC_ABORT_MASKED | Mode::User as u32
        );
        // The shadow PSR starts in Supervisor with exceptions masked.
        assert_eq!(vcpu.mode().unwrap(), Mode::Supervisor);
        assert_eq!(vcpu.reset_count, 1);
    }

    #[test]
    fn test_orphan_init() {
        let env = TestEnv::new();
        let mut vcpu = Vcpu::new(9, 0, 0, false);
        vcpu.start_pc = 0x100;
        vcpu.start_sp = 0xdead_0000;
        vcpu.init(&crate::config::VcpuConfig::new("arm,cortex-a8"), &env.mmu, &env.platform())
            .unwrap();
        assert_eq!(vcpu.regs.sp, 0xdead_0000);
        assert_eq!(vcpu.mode().unwrap(), Mode::Supervisor);
        assert!(vcpu.private().is_err());
    }

    #[test]
    fn test_init_rejects_unknown_model() {
        let env = TestEnv::new();
        let mut vcpu = Vcpu::new(2, 1, 0, true);
        let cfg = crate::config::VcpuConfig::new("arm,arm926");
        assert_eq!(
            vcpu.init(&cfg, &env.mmu, &env.platform()),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn test_mode_roundtrip_banked_sp() {
        // Supervisor writes sp, IRQ writes its own, and each mode sees
        // its value again on return.
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;

        vcpu.reg_write(&mut regs, 13, 0xaaaa);
        vcpu.cpsr_update(&mut regs, Mode::Irq as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
            .unwrap();
        assert_eq!(vcpu.mode().unwrap(), Mode::Irq);
        vcpu.reg_write(&mut regs, 13, 0xbbbb);
        vcpu.cpsr_update(
            &mut regs,
            Mode::Supervisor as u32,
            PSR_MODE_MASK,
            &env.mmu,
            &env.sched,
        )
        .unwrap();

        assert_eq!(vcpu.reg_read(&regs, 13), 0xaaaa);
        assert_eq!(vcpu.regmode_read(&regs, Mode::Irq, 13), 0xbbbb);
    }

    #[test]
    fn test_banked_write_roundtrip_every_mode() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;

        let modes = [
            Mode::Supervisor,
            Mode::Irq,
            Mode::Fiq,
            Mode::Abort,
            Mode::Undefined,
            Mode::Monitor,
            Mode::System,
        ];
        for (i, &mode) in modes.iter().enumerate() {
            vcpu.cpsr_update(&mut regs, mode as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
                .unwrap();
            vcpu.reg_write(&mut regs, 13, 0x1000 + i as u32);
            vcpu.reg_write(&mut regs, 14, 0x2000 + i as u32);
        }
        for (i, &mode) in modes.iter().enumerate() {
            vcpu.cpsr_update(&mut regs, mode as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
                .unwrap();
            assert_eq!(vcpu.reg_read(&regs, 13), 0x1000 + i as u32, "{mode:?}");
            assert_eq!(vcpu.reg_read(&regs, 14), 0x2000 + i as u32, "{mode:?}");
        }
    }

    #[test]
    fn test_fiq_gprs_are_separate() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;

        vcpu.reg_write(&mut regs, 8, 0x111);
        vcpu.cpsr_update(&mut regs, Mode::Fiq as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
            .unwrap();
        assert_eq!(vcpu.reg_read(&regs, 8), 0);
        vcpu.reg_write(&mut regs, 8, 0x222);
        vcpu.cpsr_update(
            &mut regs,
            Mode::Supervisor as u32,
            PSR_MODE_MASK,
            &env.mmu,
            &env.sched,
        )
        .unwrap();
        assert_eq!(vcpu.reg_read(&regs, 8), 0x111);
        assert_eq!(vcpu.regmode_read(&regs, Mode::Fiq, 8), 0x222);
    }

    #[test]
    fn test_cpsr_mask_discipline() {
        // Bits outside the mask keep their value, bits inside take the
        // new one.
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;
        let before = vcpu.cpsr_retrieve(&regs);

        vcpu.cpsr_update(&mut regs, PSR_N | PSR_C, PSR_N | PSR_C, &env.mmu, &env.sched)
            .unwrap();
        let after = vcpu.cpsr_retrieve(&regs);
        assert_eq!(after & !(PSR_N | PSR_C), before & !(PSR_N | PSR_C));
        assert_eq!(after & (PSR_N | PSR_C), PSR_N | PSR_C);

        // Full-mask update round-trips modulo nothing: every bit we set
        // reads back.
        let target = PSR_N | PSR_Z | Mode::Abort as u32 | PSR_IRQ_MASKED;
        vcpu.cpsr_update(&mut regs, target, PSR_ALL_BITS, &env.mmu, &env.sched)
            .unwrap();
        assert_eq!(vcpu.cpsr_retrieve(&regs), target);
    }

    #[test]
    fn test_cpsr_update_rejects_unknown_mode() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;
        let before = vcpu.cpsr_retrieve(&regs);
        assert!(vcpu
            .cpsr_update(&mut regs, 0x14, PSR_MODE_MASK, &env.mmu, &env.sched)
            .is_err());
        assert_eq!(vcpu.cpsr_retrieve(&regs), before);
    }

    #[test]
    fn test_cpsr_update_rejects_orphan() {
        let env = TestEnv::new();
        let mut vcpu = Vcpu::new(3, 0, 0, false);
        vcpu.init(&crate::config::VcpuConfig::new("arm,cortex-a8"), &env.mmu, &env.platform())
            .unwrap();
        let mut regs = vcpu.regs;
        assert_eq!(
            vcpu.cpsr_update(&mut regs, Mode::Irq as u32, PSR_MODE_MASK, &env.mmu, &env.sched),
            Err(Error::Fail)
        );
    }

    #[test]
    fn test_spsr_denied_in_user_mode() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;

        // Park something in every SPSR first.
        for mode in [Mode::Supervisor, Mode::Irq, Mode::Abort] {
            vcpu.cpsr_update(&mut regs, mode as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
                .unwrap();
            vcpu.spsr_update(0x5a5a_0000 | mode as u32, PSR_ALL_BITS).unwrap();
        }

        vcpu.cpsr_update(&mut regs, Mode::User as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
            .unwrap();
        assert_eq!(vcpu.spsr_update(0xffff_ffff, PSR_ALL_BITS), Err(Error::Fail));

        // No SPSR slot changed.
        let bank = &vcpu.private().unwrap().bank;
        assert_eq!(bank.spsr_svc, 0x5a5a_0000 | Mode::Supervisor as u32);
        assert_eq!(bank.spsr_irq, 0x5a5a_0000 | Mode::Irq as u32);
        assert_eq!(bank.spsr_abt, 0x5a5a_0000 | Mode::Abort as u32);
        assert_eq!(bank.spsr_und, 0);
    }

    #[test]
    fn test_spsr_follows_current_mode() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;

        vcpu.spsr_update(0x1111, PSR_ALL_BITS).unwrap();
        assert_eq!(vcpu.spsr_retrieve(), 0x1111);

        vcpu.cpsr_update(&mut regs, Mode::Irq as u32, PSR_MODE_MASK, &env.mmu, &env.sched)
            .unwrap();
        assert_eq!(vcpu.spsr_retrieve(), 0);
        vcpu.spsr_update(0x2222, PSR_ALL_BITS).unwrap();
        assert_eq!(vcpu.spsr_retrieve(), 0x2222);
        assert_eq!(vcpu.private().unwrap().bank.spsr_svc, 0x1111);
    }

    #[test]
    fn test_reinit_zeroes_banked_state() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;
        vcpu.reg_write(&mut regs, 13, 0x7777);
        vcpu.spsr_update(0x99, PSR_ALL_BITS).unwrap();

        let cfg = crate::config::VcpuConfig::new("arm,cortex-a8");
        vcpu.init(&cfg, &env.mmu, &env.platform()).unwrap();
        assert_eq!(vcpu.reset_count, 2);
        assert_eq!(vcpu.mode().unwrap(), Mode::Supervisor);
        let bank = &vcpu.private().unwrap().bank;
        assert_eq!(bank.sp_svc, 0);
        assert_eq!(bank.spsr_svc, 0);
    }

    #[test]
    fn test_halt_dumps_once_and_sticks() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        vcpu.halt(&regs, &env.sched);
        vcpu.halt(&regs, &env.sched);
        assert_eq!(vcpu.state, VcpuState::Halted);
        assert_eq!(env.sched.halted.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_deinit_releases_private_frame() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        vcpu.deinit(&env.mmu).unwrap();
        assert!(vcpu.private().is_err());
        assert_eq!(vcpu.state, VcpuState::Unknown);
        assert_eq!(vcpu.regs, UserRegs::default());
    }

    #[test]
    fn test_guest_stage2_lifecycle() {
        let env = TestEnv::new();
        let mut guest = Guest::new(1);
        guest.vcpus.push(1);

        let l1 = env.mmu.l1tbl_alloc().unwrap();
        guest.stage2().l1 = Some(l1);
        assert_eq!(guest.stage2().l1, Some(l1));

        guest.destroy(&env.mmu).unwrap();
        assert!(guest.stage2().l1.is_none());
        // The table went back to the pool: the handle is dead.
        assert!(env.mmu.l1_pa(l1).is_err());
    }

    #[test]
    fn test_gentimer_context_initialized_for_a15() {
        let env = TestEnv::new();
        let mut vcpu = Vcpu::new(4, 1, 0, true);
        let mut cfg = crate::config::VcpuConfig::new("arm,cortex-a15");
        cfg.gentimer_phys_irq = 29;
        cfg.gentimer_virt_irq = 27;
        vcpu.init(&cfg, &env.mmu, &env.platform()).unwrap();
        assert!(vcpu.has_feature(Feature::GenTimer));
        assert_eq!(vcpu.private().unwrap().gentimer.phys_timer_irq, 29);
        assert_eq!(
            env.timer.inits.load(core::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}

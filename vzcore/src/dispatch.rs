//! The module containing trap dispatch and the vcpu context switch: the
//! hardware syndrome is decoded into an exception class, routed to the
//! cp15 emulator or the fault paths, and vcpu switches save and restore
//! the minimum state needed for correctness.

use crate::cp15::{
    self,
    faults::{self, FaultAccess, FaultKind, FaultResolution},
};
use crate::error::{Error, Result};
use crate::features::Feature;
use crate::mmu::Mmu;
use crate::platform::{GuestIrq, Platform};
use crate::reg_bank;
use crate::vcpu::{UserRegs, Vcpu};
use bitfield::bitfield;
use log::warn;

/// HCR: virtualize the guest's MMU view.
pub const HCR_VM: u32 = 1 << 0;
/// HCR: set/way invalidation override.
pub const HCR_SWIO: u32 = 1 << 1;
/// HCR: route FIQs to the hypervisor.
pub const HCR_FMO: u32 = 1 << 3;
/// HCR: route IRQs to the hypervisor.
pub const HCR_IMO: u32 = 1 << 4;
/// HCR: route asynchronous aborts to the hypervisor.
pub const HCR_AMO: u32 = 1 << 5;
/// HCR: virtual FIQ pending.
pub const HCR_VF: u32 = 1 << 6;
/// HCR: virtual IRQ pending.
pub const HCR_VI: u32 = 1 << 7;
/// HCR: virtual abort pending.
pub const HCR_VA: u32 = 1 << 8;
/// HCR: trap WFI.
pub const HCR_TWI: u32 = 1 << 13;
/// HCR: trap SMC.
pub const HCR_TSC: u32 = 1 << 19;
/// HCR: trap implementation-defined cp15 registers.
pub const HCR_TIDCP: u32 = 1 << 20;
/// HCR: trap ACTLR accesses.
pub const HCR_TAC: u32 = 1 << 21;

/// Reset image of the HCR shadow.
pub const HCR_RESET: u32 =
    HCR_TAC | HCR_TIDCP | HCR_TSC | HCR_TWI | HCR_AMO | HCR_IMO | HCR_FMO | HCR_SWIO | HCR_VM;

/// The virtual exception bits cleared on vcpu re-reset.
pub const HCR_VIRT_EXC_MASK: u32 = HCR_VA | HCR_VI | HCR_VF;

/// HCPTR: trap cp0-cp13 accesses.
pub const HCPTR_TCP_MASK: u32 = 0x3fff;
/// HCPTR: trap Advanced SIMD.
pub const HCPTR_TASE: u32 = 1 << 15;
/// HCPTR: trap trace registers.
pub const HCPTR_TTA: u32 = 1 << 20;
/// HCPTR: trap CPACR accesses.
pub const HCPTR_TCPAC: u32 = 1 << 31;

/// Reset image of the HCPTR shadow.
pub const HCPTR_RESET: u32 = HCPTR_TCPAC | HCPTR_TTA | HCPTR_TASE | HCPTR_TCP_MASK;

/// HSTR: trap cp15 CRn 9 accesses.
pub const HSTR_T9: u32 = 1 << 9;
/// HSTR: trap ThumbEE registers.
pub const HSTR_TTEE: u32 = 1 << 16;
/// HSTR: trap Jazelle registers.
pub const HSTR_TJDBX: u32 = 1 << 17;

/// Reset image of the HSTR shadow.
pub const HSTR_RESET: u32 = HSTR_TJDBX | HSTR_TTEE | HSTR_T9;

bitfield! {
    /// The hypervisor syndrome register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Syndrome(u32);
    impl Debug;
    /// Instruction-specific syndrome.
    pub iss, _: 24, 0;
    /// Instruction length: set for 32-bit instructions.
    pub il, _: 25;
    /// Exception class.
    pub ec, _: 31, 26;
}

bitfield! {
    /// ISS layout of MCR/MRC traps.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct McrMrcIss(u32);
    impl Debug;
    /// Set for reads (MRC).
    pub is_read, _: 0;
    /// Coprocessor register CRm.
    pub crm, _: 4, 1;
    /// Source/target core register.
    pub rt, _: 9, 5;
    /// Coprocessor register CRn.
    pub crn, _: 13, 10;
    /// Opcode 1.
    pub opc1, _: 16, 14;
    /// Opcode 2.
    pub opc2, _: 19, 17;
}

bitfield! {
    /// ISS layout of data aborts taken to the hypervisor.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DataAbortIss(u32);
    impl Debug;
    /// Fault status code.
    pub dfsc, _: 5, 0;
    /// Write-not-read.
    pub wnr, _: 6;
    /// Fault happened during a stage-1 walk.
    pub s1ptw, _: 7;
    /// Source/target core register, valid with `isv`.
    pub srt, _: 19, 16;
    /// Sign-extend loaded value, valid with `isv`.
    pub sse, _: 21;
    /// Access size log2, valid with `isv`.
    pub sas, _: 23, 22;
    /// Instruction syndrome valid.
    pub isv, _: 24;
}

/// Exception classes the dispatcher recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    /// WFI or WFE trapped.
    WfiWfe,
    /// MCR/MRC access to cp15.
    McrMrcCp15,
    /// MCRR/MRRC access to cp15.
    McrrMrrcCp15,
    /// MCR/MRC access to cp14.
    McrMrcCp14,
    /// LDC/STC access to cp14.
    LdcStcCp14,
    /// Access to cp0-cp13 trapped by HCPTR.
    Cp0ToCp13,
    /// VMRS access trapped.
    Vmrs,
    /// Jazelle enable trapped.
    Jazelle,
    /// BXJ trapped.
    Bxj,
    /// MRRC access to cp14.
    MrrcCp14,
    /// Supervisor call.
    Svc,
    /// Hypervisor call.
    Hvc,
    /// Secure monitor call.
    Smc,
    /// Instruction abort from a stage-2 translation.
    Stage2InstAbort,
    /// Instruction abort from the guest's stage-1 translation.
    Stage1InstAbort,
    /// Data abort from a stage-2 translation.
    Stage2DataAbort,
    /// Data abort from the guest's stage-1 translation.
    Stage1DataAbort,
}

impl TryFrom<u32> for ExceptionClass {
    type Error = Error;

    fn try_from(ec: u32) -> Result<Self> {
        match ec {
            0x01 => Ok(ExceptionClass::WfiWfe),
            0x03 => Ok(ExceptionClass::McrMrcCp15),
            0x04 => Ok(ExceptionClass::McrrMrrcCp15),
            0x05 => Ok(ExceptionClass::McrMrcCp14),
            0x06 => Ok(ExceptionClass::LdcStcCp14),
            0x07 => Ok(ExceptionClass::Cp0ToCp13),
            0x08 => Ok(ExceptionClass::Vmrs),
            0x09 => Ok(ExceptionClass::Jazelle),
            0x0a => Ok(ExceptionClass::Bxj),
            0x0c => Ok(ExceptionClass::MrrcCp14),
            0x11 => Ok(ExceptionClass::Svc),
            0x12 => Ok(ExceptionClass::Hvc),
            0x13 => Ok(ExceptionClass::Smc),
            0x20 => Ok(ExceptionClass::Stage2InstAbort),
            0x21 => Ok(ExceptionClass::Stage1InstAbort),
            0x24 => Ok(ExceptionClass::Stage2DataAbort),
            0x25 => Ok(ExceptionClass::Stage1DataAbort),
            _ => Err(Error::Invalid),
        }
    }
}

/// Advances the guest PC over the trapped instruction.
fn advance_pc(regs: &mut UserRegs, il: bool) {
    regs.pc = regs.pc.wrapping_add(if il { 4 } else { 2 });
}

/// Maps a short-descriptor fault status code to the internal fault
/// taxonomy plus its granularity.
fn decode_fsc(fsc: u32) -> Option<(FaultKind, bool)> {
    match fsc {
        0x5 => Some((FaultKind::Translation, false)),
        0x7 => Some((FaultKind::Translation, true)),
        0x3 => Some((FaultKind::Access, false)),
        0x6 => Some((FaultKind::Access, true)),
        0x9 => Some((FaultKind::Domain, false)),
        0xb => Some((FaultKind::Domain, true)),
        0xd => Some((FaultKind::Permission, false)),
        0xf => Some((FaultKind::Permission, true)),
        _ => None,
    }
}

/// Handles one guest trap. `far` is the faulting virtual address for
/// stage-1 aborts and the intermediate-physical address for stage-2
/// aborts. Unknown exception classes halt the vcpu.
pub fn handle_trap(
    vcpu: &mut Vcpu,
    regs: &mut UserRegs,
    hsr: u32,
    far: u32,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let syndrome = Syndrome(hsr);
    let class = match ExceptionClass::try_from(syndrome.ec()) {
        Ok(class) => class,
        Err(e) => {
            warn!("vcpu {}: unknown exception class in {hsr:#x}", vcpu.id);
            vcpu.halt(regs, platform.sched);
            return Err(e);
        }
    };

    match class {
        ExceptionClass::WfiWfe => {
            platform.sched.irq_wait(vcpu.id);
            advance_pc(regs, syndrome.il());
            Ok(())
        }
        ExceptionClass::McrMrcCp15 => {
            let iss = McrMrcIss(syndrome.iss());
            let recognized = if iss.is_read() {
                match cp15::read(vcpu, iss.opc1(), iss.opc2(), iss.crn(), iss.crm()) {
                    Some(val) => {
                        vcpu.reg_write(regs, iss.rt(), val);
                        true
                    }
                    None => false,
                }
            } else {
                let val = vcpu.reg_read(regs, iss.rt());
                cp15::write(vcpu, iss.opc1(), iss.opc2(), iss.crn(), iss.crm(), val)
            };
            if recognized {
                advance_pc(regs, syndrome.il());
            } else {
                // A bad register encoding surfaces to the guest as an
                // undefined instruction, never as an error code.
                platform
                    .irq
                    .assert(vcpu.id, GuestIrq::UndefinedInstruction, 0);
            }
            Ok(())
        }
        ExceptionClass::McrrMrrcCp15
        | ExceptionClass::McrMrcCp14
        | ExceptionClass::LdcStcCp14
        | ExceptionClass::Cp0ToCp13
        | ExceptionClass::Vmrs
        | ExceptionClass::Jazelle
        | ExceptionClass::Bxj
        | ExceptionClass::MrrcCp14
        | ExceptionClass::Smc => {
            platform
                .irq
                .assert(vcpu.id, GuestIrq::UndefinedInstruction, 0);
            Ok(())
        }
        ExceptionClass::Svc => {
            platform.irq.assert(vcpu.id, GuestIrq::SoftIrq, 0);
            Ok(())
        }
        ExceptionClass::Hvc => {
            // No hypercall interface is exposed to guests.
            platform
                .irq
                .assert(vcpu.id, GuestIrq::UndefinedInstruction, 0);
            Ok(())
        }
        ExceptionClass::Stage1DataAbort => {
            handle_stage1_abort(vcpu, regs, syndrome, far, FaultAccess::Data, mmu, platform)
        }
        ExceptionClass::Stage1InstAbort => handle_stage1_abort(
            vcpu,
            regs,
            syndrome,
            far,
            FaultAccess::Instruction,
            mmu,
            platform,
        ),
        ExceptionClass::Stage2DataAbort => {
            let iss = DataAbortIss(syndrome.iss());
            emulate_mmio(vcpu, regs, far, iss, syndrome.il(), platform)
        }
        ExceptionClass::Stage2InstAbort => {
            warn!("vcpu {}: instruction fetch from emulated region", vcpu.id);
            vcpu.halt(regs, platform.sched);
            Err(Error::Fail)
        }
    }
}

/// Routes a stage-1 abort to the matching cp15 fault handler; a
/// permission fault on a virtual region continues as an emulated
/// load/store.
fn handle_stage1_abort(
    vcpu: &mut Vcpu,
    regs: &mut UserRegs,
    syndrome: Syndrome,
    far: u32,
    access: FaultAccess,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let iss = DataAbortIss(syndrome.iss());
    let Some((kind, page)) = decode_fsc(iss.dfsc()) else {
        warn!("vcpu {}: unrecognized fault status {:#x}", vcpu.id, iss.dfsc());
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    };
    let wnr = iss.wnr();
    let resolution = match kind {
        FaultKind::Translation => {
            faults::trans_fault(vcpu, regs, far, wnr, page, access, mmu, platform)?
        }
        FaultKind::Access => faults::access_fault(vcpu, regs, far, wnr, page, access, platform)?,
        FaultKind::Domain => {
            faults::domain_fault(vcpu, regs, far, wnr, page, access, mmu, platform)?
        }
        FaultKind::Permission => {
            faults::perm_fault(vcpu, regs, far, wnr, page, access, mmu, platform)?
        }
    };
    match resolution {
        FaultResolution::Handled => Ok(()),
        FaultResolution::EmulateAccess => {
            let l1 = vcpu.private()?.cp15.l1.ok_or(Error::Fail)?;
            let pg = mmu.get_page(l1, far)?;
            let gpa = (far - pg.va) + pg.pa;
            emulate_mmio(vcpu, regs, gpa, iss, syndrome.il(), platform)
        }
    }
}

/// Emulates a single trapped load/store against the device bus, using
/// the decoded instruction syndrome. Aborts without a valid syndrome
/// halt the vcpu; full instruction decoding lives outside the core.
fn emulate_mmio(
    vcpu: &mut Vcpu,
    regs: &mut UserRegs,
    gpa: u32,
    iss: DataAbortIss,
    il: bool,
    platform: &Platform<'_>,
) -> Result<()> {
    if !iss.isv() {
        warn!("vcpu {}: data abort without instruction syndrome", vcpu.id);
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    }
    let size = 1usize << iss.sas();
    if size > 4 {
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    }
    let srt = iss.srt();
    if iss.wnr() {
        let bytes = vcpu.reg_read(regs, srt).to_le_bytes();
        platform.bus.emulate_write(vcpu.guest, gpa, &bytes[..size])?;
    } else {
        let mut bytes = [0u8; 4];
        platform.bus.emulate_read(vcpu.guest, gpa, &mut bytes[..size])?;
        let mut val = u32::from_le_bytes(bytes);
        if iss.sse() && size < 4 {
            let shift = 32 - 8 * size as u32;
            val = ((val << shift) as i32 >> shift) as u32;
        }
        vcpu.reg_write(regs, srt, val);
    }
    advance_pc(regs, il);
    Ok(())
}

/// Switches the live register frame from `outgoing` (if any) to
/// `incoming`: user frame, banked file, vGIC, generic timer
/// (feature-gated) and the hypervisor control shadow, in that order on
/// the way out and reversed on the way in. Finishes by clearing the
/// exclusive monitor.
pub fn switch_vcpu(
    outgoing: Option<&mut Vcpu>,
    incoming: &mut Vcpu,
    regs: &mut UserRegs,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    if let Some(tvcpu) = outgoing {
        tvcpu.regs = *regs;
        if tvcpu.is_normal {
            platform.vgic.save(tvcpu.id);
            if tvcpu.has_feature(Feature::GenTimer) {
                let mut ctx = tvcpu.private()?.gentimer;
                platform.timer.context_save(&mut ctx);
                tvcpu.private_mut()?.gentimer = ctx;
            }
            let mode = tvcpu.mode()?;
            let p = tvcpu.private_mut()?;
            #[cfg(target_arch = "arm")]
            reg_bank::hw::save(&mut p.bank);
            #[cfg(not(target_arch = "arm"))]
            reg_bank::banked_save(&mut p.bank, mode, regs);
            #[cfg(target_arch = "arm")]
            let _ = mode;
        }
    }

    if incoming.is_normal {
        cp15::switch_context(None, incoming, mmu)?;
    }

    *regs = incoming.regs;
    if incoming.is_normal {
        let p = incoming.private()?;
        mmu.hw().write_hcr(p.hcr);
        mmu.hw().write_hcptr(p.hcptr);
        mmu.hw().write_hstr(p.hstr);
        let mode = incoming.mode()?;
        let p = incoming.private()?;
        #[cfg(target_arch = "arm")]
        reg_bank::hw::restore(&p.bank);
        #[cfg(not(target_arch = "arm"))]
        reg_bank::banked_restore(&p.bank, mode, regs);
        #[cfg(target_arch = "arm")]
        let _ = mode;
        if incoming.has_feature(Feature::GenTimer) {
            platform.timer.context_restore(&incoming.private()?.gentimer);
        }
        platform.vgic.restore(incoming.id);
    }

    mmu.hw().clear_exclusive_monitor();
    Ok(())
}

//! The module containing the guest fault taxonomy, the FSR image
//! builder, and the virtual-TLB refill path.

use super::SCTLR_M;
use crate::error::{Error, Result};
use crate::mmu::descriptor::{
    PageRecord, AP_SRW_U_NONE, AP_SRW_U_RW, DOM_VCPU_NOMMU, DOM_VCPU_SUPER, LARGE_PAGE_SIZE,
    SECTION_PAGE_SIZE, SMALL_PAGE_SIZE,
};
use crate::mmu::Mmu;
use crate::platform::{GuestIrq, Platform};
use crate::psr::Mode;
use crate::vcpu::{UserRegs, Vcpu};
use bitfield::bitfield;
use log::warn;

/// The four fault kinds the emulator distinguishes before encoding an
/// architectural FSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid descriptor at the walked depth.
    Translation,
    /// Descriptor present but the access flag is clear.
    Access,
    /// The domain's DACR field denies the access.
    Domain,
    /// The AP bits forbid the access for this mode/direction.
    Permission,
}

/// Whether the faulting access was a data access or an instruction
/// fetch; selects DFSR/DFAR vs IFSR/IFAR and the injected vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    /// Instruction fetch.
    Instruction,
    /// Data access.
    Data,
}

/// What the dispatcher must do after a fault handler returns
/// successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was repaired or injected; retry or continue the guest.
    Handled,
    /// The access targets a virtual region; the faulting load/store must
    /// be emulated through the device bus.
    EmulateAccess,
}

bitfield! {
    /// A v7 short-descriptor fault status register image.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultStatus(u32);
    impl Debug;
    /// Fault status bits 3:0.
    pub fs_low, set_fs_low: 3, 0;
    /// Faulting domain.
    pub domain, set_domain: 7, 4;
    /// Fault status bit 4.
    pub fs_high, set_fs_high: 10, 10;
    /// Write-not-read.
    pub wnr, set_wnr: 11, 11;
}

/// The architectural `fs` encoding for a fault kind at section or page
/// granularity. Identical for DFSR and IFSR.
fn fault_status(kind: FaultKind, page: bool) -> u32 {
    match (kind, page) {
        (FaultKind::Translation, false) => 0x5,
        (FaultKind::Translation, true) => 0x7,
        (FaultKind::Access, false) => 0x3,
        (FaultKind::Access, true) => 0x6,
        (FaultKind::Domain, false) => 0x9,
        (FaultKind::Domain, true) => 0xb,
        (FaultKind::Permission, false) => 0xd,
        (FaultKind::Permission, true) => 0xf,
    }
}

/// Builds the FSR image and injects the abort into the guest through the
/// host IRQ path. Fails (and halts the vcpu) when the guest's MMU is off,
/// since such a guest cannot be delivered an abort it expects.
pub fn assert_fault(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    kind: FaultKind,
    far: u32,
    wnr: bool,
    page: bool,
    access: FaultAccess,
    platform: &Platform<'_>,
) -> Result<()> {
    if vcpu.private()?.cp15.c1_sctlr & SCTLR_M == 0 {
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    }
    let fs = fault_status(kind, page);
    let mut fsr = FaultStatus::default();
    fsr.set_fs_high(fs >> 4);
    fsr.set_fs_low(fs & 0xf);
    match access {
        FaultAccess::Data => {
            fsr.set_wnr(u32::from(wnr));
            let c = &mut vcpu.private_mut()?.cp15;
            c.c5_dfsr = fsr.0;
            c.c6_dfar = far;
            platform.irq.assert(vcpu.id, GuestIrq::DataAbort, 0);
        }
        FaultAccess::Instruction => {
            let c = &mut vcpu.private_mut()?.cp15;
            c.c5_ifsr = fsr.0;
            c.c6_ifar = far;
            platform.irq.assert(vcpu.id, GuestIrq::PrefetchAbort, 0);
        }
    }
    Ok(())
}

/// Repairs a translation fault for a guest running with its MMU
/// disabled: looks the faulting address up in the guest's physical
/// address space, picks the largest page size that fits the region,
/// evicts the round-robin victim and installs the new mapping.
pub fn trans_fault(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    far: u32,
    _wnr: bool,
    _page: bool,
    _access: FaultAccess,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<FaultResolution> {
    if vcpu.private()?.cp15.c1_sctlr & SCTLR_M != 0 {
        // Shadow walking of guest-built tables is not implemented.
        warn!("vcpu {}: translation fault with guest MMU enabled", vcpu.id);
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    }

    let Some(region) = platform.aspace.get_region(vcpu.guest, far) else {
        vcpu.halt(regs, platform.sched);
        return Err(Error::Fail);
    };

    let avail = region.size - (far - region.gphys);
    let sz = if avail >= SECTION_PAGE_SIZE {
        SECTION_PAGE_SIZE
    } else if avail >= LARGE_PAGE_SIZE {
        LARGE_PAGE_SIZE
    } else {
        SMALL_PAGE_SIZE
    };
    let page = PageRecord {
        pa: (region.hphys + (far - region.gphys)) & !(sz - 1),
        va: far & !(sz - 1),
        sz,
        imp: 0,
        dom: DOM_VCPU_NOMMU,
        ap: if region.is_virtual {
            AP_SRW_U_NONE
        } else {
            AP_SRW_U_RW
        },
        ..Default::default()
    };

    let p = vcpu.private_mut()?;
    let l1 = p.cp15.l1.ok_or(Error::Fail)?;
    p.cp15.vtlb.evict_victim(mmu, l1)?;
    p.cp15.vtlb.install(mmu, l1, &page, 0, 0)?;
    Ok(FaultResolution::Handled)
}

/// Handles an access-flag fault: nothing to repair, assert it to the
/// guest.
pub fn access_fault(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    far: u32,
    wnr: bool,
    page: bool,
    access: FaultAccess,
    platform: &Platform<'_>,
) -> Result<FaultResolution> {
    assert_fault(vcpu, regs, FaultKind::Access, far, wnr, page, access, platform)?;
    Ok(FaultResolution::Handled)
}

/// Handles a domain fault. A User-mode touch of the supervisor domain
/// becomes a permission fault in the guest; anything else is emulator
/// inconsistency and halts the vcpu.
pub fn domain_fault(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    far: u32,
    wnr: bool,
    page: bool,
    access: FaultAccess,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<FaultResolution> {
    let l1 = vcpu.private()?.cp15.l1.ok_or(Error::Fail)?;
    let pg = match mmu.get_page(l1, far) {
        Ok(pg) => pg,
        Err(e) => {
            vcpu.halt(regs, platform.sched);
            return Err(e);
        }
    };
    if vcpu.mode()? == Mode::User && pg.dom == DOM_VCPU_SUPER {
        assert_fault(
            vcpu,
            regs,
            FaultKind::Permission,
            far,
            wnr,
            page,
            access,
            platform,
        )?;
        Ok(FaultResolution::Handled)
    } else {
        vcpu.halt(regs, platform.sched);
        Err(Error::Fail)
    }
}

/// Handles a permission fault. A data access to a supervisor-only
/// mapping is how virtual-region loads/stores surface; those go back to
/// the dispatcher for emulation. Everything else is asserted to the
/// guest.
pub fn perm_fault(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    far: u32,
    wnr: bool,
    page: bool,
    access: FaultAccess,
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<FaultResolution> {
    let l1 = vcpu.private()?.cp15.l1.ok_or(Error::Fail)?;
    let pg = match mmu.get_page(l1, far) {
        Ok(pg) => pg,
        Err(e) => {
            vcpu.halt(regs, platform.sched);
            return Err(e);
        }
    };
    if access == FaultAccess::Data && pg.ap == AP_SRW_U_NONE {
        return Ok(FaultResolution::EmulateAccess);
    }
    assert_fault(
        vcpu,
        regs,
        FaultKind::Permission,
        far,
        wnr,
        page,
        access,
        platform,
    )?;
    Ok(FaultResolution::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_status_encodings() {
        assert_eq!(fault_status(FaultKind::Translation, false), 0x5);
        assert_eq!(fault_status(FaultKind::Translation, true), 0x7);
        assert_eq!(fault_status(FaultKind::Access, false), 0x3);
        assert_eq!(fault_status(FaultKind::Access, true), 0x6);
        assert_eq!(fault_status(FaultKind::Domain, false), 0x9);
        assert_eq!(fault_status(FaultKind::Domain, true), 0xb);
        assert_eq!(fault_status(FaultKind::Permission, false), 0xd);
        assert_eq!(fault_status(FaultKind::Permission, true), 0xf);
    }

    #[test]
    fn test_fsr_image_layout() {
        let mut fsr = FaultStatus::default();
        fsr.set_fs_high(0x13 >> 4);
        fsr.set_fs_low(0x13 & 0xf);
        fsr.set_wnr(1);
        assert_eq!(fsr.0, (1 << 10) | 0x3 | (1 << 11));
    }
}

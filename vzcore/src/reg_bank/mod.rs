//! The module containing the banked-register file and the save/restore
//! policy across privilege modes.
//!
//! Registers 0-7 and the pc are never banked. sp and lr are banked per
//! mode. Registers 8-12 exist in exactly two copies: one shared by every
//! non-FIQ mode and a dedicated FIQ copy. An SPSR exists in every
//! privileged mode except System; User has none.
//!
//! The memory-backed file below is the portable variant. Hosts whose
//! virtualization extension keeps guest banked registers in hardware
//! system registers use [`hw`] instead at context-switch time; both
//! present identical external behavior.

#[cfg(target_arch = "arm")]
pub mod hw;

use crate::psr::Mode;
use crate::vcpu::UserRegs;

/// Number of banked general-purpose registers (r8-r12).
pub const FIQ_GPR_COUNT: usize = 5;

/// The memory-backed banked register file of one vcpu. `#[repr(C)]` with
/// a frozen field order: the low-level trap trampoline addresses these
/// fields by the offsets exported from [`crate::vcpu::layout`].
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BankedRegs {
    /// r8-r12 of every non-FIQ mode.
    pub gpr_usr: [u32; FIQ_GPR_COUNT],
    /// r8-r12 of FIQ mode.
    pub gpr_fiq: [u32; FIQ_GPR_COUNT],
    /// User/System sp.
    pub sp_usr: u32,
    /// User/System lr.
    pub lr_usr: u32,
    /// Supervisor sp.
    pub sp_svc: u32,
    /// Supervisor lr.
    pub lr_svc: u32,
    /// Supervisor spsr.
    pub spsr_svc: u32,
    /// Monitor sp.
    pub sp_mon: u32,
    /// Monitor lr.
    pub lr_mon: u32,
    /// Monitor spsr.
    pub spsr_mon: u32,
    /// Abort sp.
    pub sp_abt: u32,
    /// Abort lr.
    pub lr_abt: u32,
    /// Abort spsr.
    pub spsr_abt: u32,
    /// Undefined sp.
    pub sp_und: u32,
    /// Undefined lr.
    pub lr_und: u32,
    /// Undefined spsr.
    pub spsr_und: u32,
    /// IRQ sp.
    pub sp_irq: u32,
    /// IRQ lr.
    pub lr_irq: u32,
    /// IRQ spsr.
    pub spsr_irq: u32,
    /// FIQ sp.
    pub sp_fiq: u32,
    /// FIQ lr.
    pub lr_fiq: u32,
    /// FIQ spsr.
    pub spsr_fiq: u32,
}
const _: () = assert!(core::mem::size_of::<BankedRegs>() == (10 + 20) * 4);

impl BankedRegs {
    /// The sp/lr pair of `mode`, or `None` for Hypervisor mode which has
    /// no banked copy here.
    fn sp_lr_mut(&mut self, mode: Mode) -> Option<(&mut u32, &mut u32)> {
        match mode {
            Mode::User | Mode::System => Some((&mut self.sp_usr, &mut self.lr_usr)),
            Mode::Fiq => Some((&mut self.sp_fiq, &mut self.lr_fiq)),
            Mode::Irq => Some((&mut self.sp_irq, &mut self.lr_irq)),
            Mode::Supervisor => Some((&mut self.sp_svc, &mut self.lr_svc)),
            Mode::Abort => Some((&mut self.sp_abt, &mut self.lr_abt)),
            Mode::Undefined => Some((&mut self.sp_und, &mut self.lr_und)),
            Mode::Monitor => Some((&mut self.sp_mon, &mut self.lr_mon)),
            Mode::Hypervisor => None,
        }
    }

    /// The sp/lr pair of `mode` by value.
    pub fn sp_lr(&self, mode: Mode) -> Option<(u32, u32)> {
        match mode {
            Mode::User | Mode::System => Some((self.sp_usr, self.lr_usr)),
            Mode::Fiq => Some((self.sp_fiq, self.lr_fiq)),
            Mode::Irq => Some((self.sp_irq, self.lr_irq)),
            Mode::Supervisor => Some((self.sp_svc, self.lr_svc)),
            Mode::Abort => Some((self.sp_abt, self.lr_abt)),
            Mode::Undefined => Some((self.sp_und, self.lr_und)),
            Mode::Monitor => Some((self.sp_mon, self.lr_mon)),
            Mode::Hypervisor => None,
        }
    }

    /// Writes the banked sp of `mode`.
    pub fn set_sp(&mut self, mode: Mode, val: u32) {
        if let Some((sp, _)) = self.sp_lr_mut(mode) {
            *sp = val;
        }
    }

    /// Writes the banked lr of `mode`.
    pub fn set_lr(&mut self, mode: Mode, val: u32) {
        if let Some((_, lr)) = self.sp_lr_mut(mode) {
            *lr = val;
        }
    }

    /// The SPSR of `mode`; 0 where the mode has none.
    pub fn spsr(&self, mode: Mode) -> u32 {
        match mode {
            Mode::Supervisor => self.spsr_svc,
            Mode::Monitor => self.spsr_mon,
            Mode::Abort => self.spsr_abt,
            Mode::Undefined => self.spsr_und,
            Mode::Irq => self.spsr_irq,
            Mode::Fiq => self.spsr_fiq,
            Mode::User | Mode::System | Mode::Hypervisor => 0,
        }
    }

    /// Mutable SPSR slot of `mode`, if the mode has one.
    pub fn spsr_mut(&mut self, mode: Mode) -> Option<&mut u32> {
        match mode {
            Mode::Supervisor => Some(&mut self.spsr_svc),
            Mode::Monitor => Some(&mut self.spsr_mon),
            Mode::Abort => Some(&mut self.spsr_abt),
            Mode::Undefined => Some(&mut self.spsr_und),
            Mode::Irq => Some(&mut self.spsr_irq),
            Mode::Fiq => Some(&mut self.spsr_fiq),
            Mode::User | Mode::System | Mode::Hypervisor => None,
        }
    }

    /// The r8-r12 copy live in `mode`.
    pub fn gpr_bank(&self, mode: Mode) -> &[u32; FIQ_GPR_COUNT] {
        if mode == Mode::Fiq {
            &self.gpr_fiq
        } else {
            &self.gpr_usr
        }
    }

    /// Mutable r8-r12 copy live in `mode`.
    pub fn gpr_bank_mut(&mut self, mode: Mode) -> &mut [u32; FIQ_GPR_COUNT] {
        if mode == Mode::Fiq {
            &mut self.gpr_fiq
        } else {
            &mut self.gpr_usr
        }
    }
}

/// Copies the live r8-r12, sp and lr into the banked slots of `mode`.
/// Called with the mode that is being left, before its PSR changes.
pub fn banked_save(bank: &mut BankedRegs, mode: Mode, src: &UserRegs) {
    let gprs = bank.gpr_bank_mut(mode);
    for (i, slot) in gprs.iter_mut().enumerate() {
        *slot = src.gpr[8 + i];
    }
    if let Some((sp, lr)) = bank.sp_lr_mut(mode) {
        *sp = src.sp;
        *lr = src.lr;
    }
}

/// Loads the banked slots of `mode` into the live r8-r12, sp and lr.
/// Called with the mode being entered, after its PSR is installed.
pub fn banked_restore(bank: &BankedRegs, mode: Mode, dst: &mut UserRegs) {
    let gprs = bank.gpr_bank(mode);
    for (i, slot) in gprs.iter().enumerate() {
        dst.gpr[8 + i] = *slot;
    }
    if let Some((sp, lr)) = bank.sp_lr(mode) {
        dst.sp = sp;
        dst.lr = lr;
    }
}

//! The module containing the program status register representation and
//! the privilege [`Mode`] encodings of the emulated processor.

use bitfield::bitfield;

/// The eight guest-visible privilege modes plus the hypervisor mode of the
/// host, identified by the low five PSR bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Mode {
    /// Unprivileged mode.
    User = 0x10,
    /// Fast interrupt mode, with its own r8-r12 bank.
    Fiq = 0x11,
    /// Interrupt mode.
    Irq = 0x12,
    /// Supervisor mode, the reset mode of the emulated processor.
    Supervisor = 0x13,
    /// Secure monitor mode.
    Monitor = 0x16,
    /// Abort mode.
    Abort = 0x17,
    /// Hypervisor mode. Guests never run in it; it shows up only in host
    /// side frames.
    Hypervisor = 0x1a,
    /// Undefined-instruction mode.
    Undefined = 0x1b,
    /// System mode: privileged, but shares the User register bank.
    System = 0x1f,
}

impl Mode {
    /// Whether an SPSR exists in this mode. User and System share the
    /// User bank and have none.
    pub fn has_spsr(self) -> bool {
        !matches!(self, Mode::User | Mode::System)
    }
}

impl TryFrom<u32> for Mode {
    type Error = crate::error::Error;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits & PSR_MODE_MASK {
            0x10 => Ok(Mode::User),
            0x11 => Ok(Mode::Fiq),
            0x12 => Ok(Mode::Irq),
            0x13 => Ok(Mode::Supervisor),
            0x16 => Ok(Mode::Monitor),
            0x17 => Ok(Mode::Abort),
            0x1a => Ok(Mode::Hypervisor),
            0x1b => Ok(Mode::Undefined),
            0x1f => Ok(Mode::System),
            _ => Err(crate::error::Error::Invalid),
        }
    }
}

/// Mask of the PSR mode field.
pub const PSR_MODE_MASK: u32 = 0x0000_001f;

/// Thumb execution state.
pub const PSR_THUMB: u32 = 1 << 5;
/// FIQ exceptions masked.
pub const PSR_FIQ_MASKED: u32 = 1 << 6;
/// IRQ exceptions masked.
pub const PSR_IRQ_MASKED: u32 = 1 << 7;
/// Asynchronous aborts masked.
pub const PSR_ASYNC_ABORT_MASKED: u32 = 1 << 8;

/// If-then state, upper block.
pub const PSR_IT2_MASK: u32 = 0x0000_fc00;
/// Greater-than-or-equal SIMD flags.
pub const PSR_GE_MASK: u32 = 0x000f_0000;
/// If-then state, lower block.
pub const PSR_IT1_MASK: u32 = 0x0600_0000;
/// Cumulative saturation flag.
pub const PSR_Q: u32 = 1 << 27;
/// Overflow condition flag.
pub const PSR_V: u32 = 1 << 28;
/// Carry condition flag.
pub const PSR_C: u32 = 1 << 29;
/// Zero condition flag.
pub const PSR_Z: u32 = 1 << 30;
/// Negative condition flag.
pub const PSR_N: u32 = 1 << 31;

/// The four arithmetic condition flags.
pub const PSR_NZCV_MASK: u32 = PSR_N | PSR_Z | PSR_C | PSR_V;
/// Both if-then blocks.
pub const PSR_IT_MASK: u32 = PSR_IT1_MASK | PSR_IT2_MASK;

/// Bits a guest may change from any mode: condition flags, saturation,
/// GE flags, if-then state and the Thumb bit. These live in the live
/// hardware frame while the guest runs.
pub const PSR_USER_BITS: u32 = PSR_NZCV_MASK | PSR_Q | PSR_GE_MASK | PSR_IT_MASK | PSR_THUMB;

/// Bits only privileged modes may change; kept in the shadow PSR.
pub const PSR_PRIV_BITS: u32 = !PSR_USER_BITS;

/// Mask selecting every PSR bit.
pub const PSR_ALL_BITS: u32 = 0xffff_ffff;

bitfield! {
    /// A program status register value. Field positions follow the
    /// architectural CPSR/SPSR layout; the wrapper exists so reserved
    /// bits cannot be clobbered through named accessors.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Psr(u32);
    impl Debug;
    /// Privilege mode field.
    pub mode_bits, set_mode_bits: 4, 0;
    /// Thumb execution state.
    pub thumb, set_thumb: 5;
    /// FIQ mask.
    pub fiq_masked, set_fiq_masked: 6;
    /// IRQ mask.
    pub irq_masked, set_irq_masked: 7;
    /// Asynchronous abort mask.
    pub async_abort_masked, set_async_abort_masked: 8;
    /// Big-endian load/store state.
    pub big_endian, set_big_endian: 9;
    /// If-then state bits 7:2.
    pub it2, set_it2: 15, 10;
    /// SIMD greater-than-or-equal flags.
    pub ge, set_ge: 19, 16;
    /// Jazelle execution state.
    pub jazelle, set_jazelle: 24;
    /// If-then state bits 1:0.
    pub it1, set_it1: 26, 25;
    /// Cumulative saturation flag.
    pub q, set_q: 27;
    /// Overflow flag.
    pub v, set_v: 28;
    /// Carry flag.
    pub c, set_c: 29;
    /// Zero flag.
    pub z, set_z: 30;
    /// Negative flag.
    pub n, set_n: 31;
}

impl Psr {
    /// Returns the decoded privilege mode, or an error if the mode field
    /// holds an encoding the architecture does not define. An undefined
    /// mode in a live frame is a programming error in the emulator, never
    /// a guest-observable condition.
    pub fn mode(self) -> crate::error::Result<Mode> {
        Mode::try_from(self.0)
    }

    /// Replaces the mode field.
    pub fn set_mode(&mut self, mode: Mode) {
        self.set_mode_bits(mode as u32);
    }

    /// Returns the raw 32-bit value.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl From<u32> for Psr {
    fn from(bits: u32) -> Self {
        Psr(bits)
    }
}

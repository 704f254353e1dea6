//! The module containing the cp15 (system control coprocessor) trap
//! emulator: the shadow register file, the read/write decoder, fault
//! assertion, vector-page virtualization, and the per-vcpu virtual TLB.

pub mod faults;
pub mod models;
pub mod vtlb;

use crate::config::{VcpuConfig, IRQ_HIGHVEC_BASE, IRQ_LOWVEC_BASE, VECTOR_PAGE_WORDS};
use crate::error::{Error, Result};
use crate::features::{CpuModel, Feature};
use crate::mmu::descriptor::{
    AP_SREAD_U_NONE, AP_SRW_U_NONE, AP_SRW_U_READ, AP_SRW_U_RW, DACR_CLIENT, DACR_NO_ACCESS,
    DOM_VCPU_NOMMU, DOM_VCPU_SUPER, DOM_VCPU_USER,
};
use crate::mmu::{L1Handle, Mmu};
use crate::platform::{Platform, Scheduler, IRQ_COUNT};
use crate::psr::Mode;
use crate::vcpu::{UserRegs, Vcpu};
use faults::{trans_fault, FaultAccess};
use models::model_regs;
use vtlb::VirtTlb;

pub use crate::mmu::{SCTLR_C, SCTLR_I, SCTLR_M, SCTLR_V};

/// Size of the virtualized vector page in bytes.
const VECTOR_PAGE_BYTES: u32 = (VECTOR_PAGE_WORDS * 4) as u32;

/// The shadow cp15 state of one vcpu.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub struct Cp15 {
    /// Stage-1 table of this vcpu, cloned from the default L1.
    pub l1: Option<L1Handle>,
    /// Hypervisor-side DACR image applied while this vcpu runs.
    pub dacr: u32,
    /// Virtual TLB backing the refill path.
    #[derivative(Default(value = "VirtTlb::new(1)"))]
    pub vtlb: VirtTlb,
    /// Local copy of the guest's vector page.
    pub ovect: [u32; VECTOR_PAGE_WORDS],
    /// Base address the vector copy shadows; the host's high or low
    /// vector base, chosen at init.
    pub ovect_base: u32,
    /// Emulated model, driving reset templates.
    pub model: Option<CpuModel>,

    /// Main ID register.
    pub c0_cpuid: u32,
    /// Cache type register.
    pub c0_cachetype: u32,
    /// Cache size ID registers.
    pub c0_ccsid: [u32; 8],
    /// Cache level ID register.
    pub c0_clid: u32,
    /// Cache size selection register.
    pub c0_cssel: u32,
    /// Processor feature registers.
    pub c0_c1: [u32; 8],
    /// Instruction set attribute registers.
    pub c0_c2: [u32; 8],
    /// System control register.
    pub c1_sctlr: u32,
    /// Auxiliary control register.
    pub c1_actlr: u32,
    /// Coprocessor access control register.
    pub c1_coproc: u32,
    /// Translation table base 0.
    pub c2_base0: u32,
    /// Translation table base 1.
    pub c2_base1: u32,
    /// Translation table base control.
    pub c2_control: u32,
    /// Mask of the VA bits steered to TTBR1.
    pub c2_mask: u32,
    /// Mask of the TTBR0 base bits.
    pub c2_base_mask: u32,
    /// Domain access control as the guest sees it.
    pub c3: u32,
    /// Data fault status register.
    pub c5_dfsr: u32,
    /// Instruction fault status register.
    pub c5_ifsr: u32,
    /// Data fault address register.
    pub c6_dfar: u32,
    /// Instruction fault address register.
    pub c6_ifar: u32,
    /// Physical address register (VA to PA operations).
    pub c7_par: u32,
    /// L1 data cache lockdown.
    pub c9_data: u32,
    /// L1 instruction cache lockdown.
    pub c9_insn: u32,
    /// FCSE process ID.
    pub c13_fcse: u32,
    /// Context ID (ASID).
    pub c13_context: u32,
}

/// First-time cp15 initialization: allocates the vcpu's L1, sizes the
/// virtual TLB, picks the shadowed vector base from the host's SCTLR.V
/// and loads the model's reset template.
pub fn init(vcpu: &mut Vcpu, model: CpuModel, cfg: &VcpuConfig, mmu: &Mmu) -> Result<()> {
    let l1 = mmu.l1tbl_alloc()?;
    let host_high_vectors = mmu.hw().read_sctlr() & SCTLR_V != 0;

    let p = vcpu.private_mut()?;
    p.cp15 = Cp15::default();
    p.cp15.l1 = Some(l1);
    p.cp15.dacr = (DACR_CLIENT << (2 * DOM_VCPU_NOMMU))
        | (DACR_CLIENT << (2 * DOM_VCPU_SUPER))
        | (DACR_CLIENT << (2 * DOM_VCPU_USER));
    p.cp15.vtlb = VirtTlb::new(cfg.vtlb_count);
    p.cp15.ovect_base = if host_high_vectors {
        IRQ_HIGHVEC_BASE
    } else {
        IRQ_LOWVEC_BASE
    };
    p.cp15.model = Some(model);
    p.cp15.c0_cpuid = model.cpuid();
    reset(vcpu, mmu)
}

/// Resets the shadow state: flushes the virtual TLB mappings out of the
/// vcpu's L1 and reloads the model identification template.
pub fn reset(vcpu: &mut Vcpu, mmu: &Mmu) -> Result<()> {
    let p = vcpu.private_mut()?;
    let l1 = p.cp15.l1.ok_or(Error::Fail)?;
    p.cp15.vtlb.flush(mmu, l1)?;

    let model = p.cp15.model.ok_or(Error::Fail)?;
    let regs = model_regs(model);
    p.cp15.c0_c1 = regs.c0_c1;
    p.cp15.c0_c2 = regs.c0_c2;
    p.cp15.c0_cachetype = regs.cachetype;
    p.cp15.c0_clid = regs.clid;
    p.cp15.c0_ccsid = regs.ccsid;
    p.cp15.c1_sctlr = regs.sctlr;
    p.cp15.c1_actlr = regs.actlr;
    Ok(())
}

/// Tears cp15 state down, returning the vcpu's L1 (and everything the
/// virtual TLB installed into it) to the pool.
pub fn deinit(vcpu: &mut Vcpu, mmu: &Mmu) -> Result<()> {
    let p = vcpu.private_mut()?;
    if let Some(l1) = p.cp15.l1.take() {
        p.cp15.vtlb.flush(mmu, l1)?;
        mmu.l1tbl_free(l1)?;
    }
    Ok(())
}

/// Recomputes the DACR field of the supervisor domain after a mode
/// change: privileged modes are clients, User gets no access. The
/// hardware DACR is touched only when `vcpu` is the one currently
/// running.
pub fn sync_cpsr(vcpu: &mut Vcpu, mmu: &Mmu, sched: &dyn Scheduler) -> Result<()> {
    let is_user = vcpu.mode()? == Mode::User;
    let p = vcpu.private_mut()?;
    p.cp15.dacr &= !(0x3 << (2 * DOM_VCPU_SUPER));
    p.cp15.dacr |= if is_user {
        DACR_NO_ACCESS << (2 * DOM_VCPU_SUPER)
    } else {
        DACR_CLIENT << (2 * DOM_VCPU_SUPER)
    };
    let dacr = p.cp15.dacr;
    if sched.current_vcpu() == Some(vcpu.id) {
        mmu.chdacr(dacr);
    }
    Ok(())
}

/// Switches the hardware cp15 context to the incoming vcpu: its DACR and
/// its stage-1 table.
pub fn switch_context(_outgoing: Option<&Vcpu>, incoming: &Vcpu, mmu: &Mmu) -> Result<()> {
    let p = incoming.private()?;
    mmu.chdacr(p.cp15.dacr);
    mmu.chttbr(p.cp15.l1.ok_or(Error::Fail)?)
}

/// Computes the address guest execution continues at for exception
/// `irq_no`, honoring the guest's SCTLR.V vector-base selection.
///
/// When the vector page is the shadowed one, the handler address is read
/// back as `ovect[irq + 8]`, assuming the guest uses `LDR PC, [PC, #xx]`
/// as the first instruction of each handler (the Linux convention).
/// Guests deviating from this take the raw vector offset instead of the
/// intended handler.
pub fn vector_addr(vcpu: &Vcpu, irq_no: u32) -> Result<u32> {
    let irq_no = irq_no % IRQ_COUNT;
    let p = vcpu.private()?;
    let vaddr = if p.cp15.c1_sctlr & SCTLR_V != 0 {
        IRQ_HIGHVEC_BASE
    } else {
        IRQ_LOWVEC_BASE
    };
    if p.cp15.ovect_base == vaddr {
        Ok(p.cp15.ovect[(irq_no + 8) as usize])
    } else {
        Ok(vaddr + 4 * irq_no)
    }
}

/// Decodes a guest cp15 register read. Returns `None` for encodings the
/// emulator does not recognize; the dispatcher turns that into an
/// Undefined Instruction exception in the guest, never an error code.
pub fn read(vcpu: &Vcpu, opc1: u32, opc2: u32, crn: u32, crm: u32) -> Option<u32> {
    let Ok(p) = vcpu.private() else {
        return None;
    };
    let c = &p.cp15;
    let f = p.features;
    match crn {
        // ID codes.
        0 => match opc1 {
            0 => match crm {
                0 => match opc2 {
                    0 => Some(c.c0_cpuid),
                    1 => Some(c.c0_cachetype),
                    // TCM status: none.
                    2 => Some(0),
                    // TLB type: no lockable entries.
                    3 => Some(0),
                    5 => {
                        // MPIDR exists from v7 on; synthesized from the
                        // vcpu's index within its guest.
                        if f.has(Feature::V7) {
                            let mut mpidr = vcpu.guest_index;
                            if f.has(Feature::V7mp) {
                                mpidr |= 1 << 31;
                            }
                            Some(mpidr)
                        } else {
                            None
                        }
                    }
                    _ => None,
                },
                1 => f.has(Feature::V6).then(|| c.c0_c1[(opc2 & 7) as usize]),
                2 => f.has(Feature::V6).then(|| c.c0_c2[(opc2 & 7) as usize]),
                3..=7 => Some(0),
                _ => None,
            },
            1 => {
                if !f.has(Feature::V6) || crm != 0 {
                    return None;
                }
                if !f.has(Feature::V7) {
                    return Some(0);
                }
                match opc2 {
                    0 => Some(c.c0_ccsid[(c.c0_cssel & 7) as usize]),
                    1 => Some(c.c0_clid),
                    7 => Some(0),
                    _ => None,
                }
            }
            2 => (opc2 == 0 && crm == 0).then_some(c.c0_cssel),
            _ => None,
        },
        // System configuration.
        1 => match opc2 {
            0 => Some(c.c1_sctlr),
            1 => f.has(Feature::AuxCr).then_some(c.c1_actlr),
            2 => Some(c.c1_coproc),
            _ => None,
        },
        // Translation table control.
        2 => match opc2 {
            0 => Some(c.c2_base0),
            1 => Some(c.c2_base1),
            2 => Some(c.c2_control),
            _ => None,
        },
        // Domain access control.
        3 => Some(c.c3),
        4 => None,
        // Fault status.
        5 => match opc2 {
            0 => Some(c.c5_dfsr),
            1 => Some(c.c5_ifsr),
            _ => None,
        },
        // Fault address.
        6 => match opc2 {
            0 => Some(c.c6_dfar),
            // WFAR on v6 and later; not implemented.
            1 => {
                if f.has(Feature::V6) {
                    Some(0)
                } else {
                    Some(c.c6_ifar)
                }
            }
            2 => f.has(Feature::V6).then_some(c.c6_ifar),
            _ => None,
        },
        // Cache operations; only the VA-to-PA result register reads back.
        7 => {
            if crm == 4 && opc1 == 0 && opc2 == 0 {
                Some(c.c7_par)
            } else {
                Some(0)
            }
        }
        8 => None,
        // Cache lockdown.
        9 => match opc1 {
            0 => match opc2 {
                0 => Some(c.c9_data),
                1 => Some(c.c9_insn),
                _ => None,
            },
            // L2 lockdown and auxiliary control read as zero.
            1 => (crm == 0).then_some(0),
            _ => None,
        },
        // TLB lockdown: not implemented.
        10 => Some(0),
        11 | 12 => None,
        // Process ID.
        13 => match opc2 {
            0 => Some(c.c13_fcse),
            1 => Some(c.c13_context),
            _ => None,
        },
        14 => None,
        // Implementation specific: RAZ.
        15 => Some(0),
        _ => None,
    }
}

/// Decodes a guest cp15 register write. Returns false for encodings the
/// emulator does not recognize.
pub fn write(vcpu: &mut Vcpu, opc1: u32, opc2: u32, crn: u32, crm: u32, data: u32) -> bool {
    let Ok(p) = vcpu.private_mut() else {
        return false;
    };
    let f = p.features;
    let c = &mut p.cp15;
    match crn {
        0 => {
            // Only the cache size selection register is writable.
            if f.has(Feature::V7) && opc1 == 2 && crm == 0 && opc2 == 0 {
                c.c0_cssel = data & 0xf;
                true
            } else {
                false
            }
        }
        1 => match opc2 {
            0 => {
                // May enable/disable the guest MMU; a TLB flush would go
                // here once shadow walking exists.
                c.c1_sctlr = data;
                true
            }
            // Auxiliary control: ignored.
            1 => true,
            2 => {
                c.c1_coproc = data;
                true
            }
            _ => false,
        },
        2 => match opc2 {
            0 => {
                c.c2_base0 = data;
                true
            }
            1 => {
                c.c2_base1 = data;
                true
            }
            2 => {
                let data = data & 7;
                c.c2_control = data;
                c.c2_mask = !(u32::MAX >> data);
                c.c2_base_mask = !(0x3fffu32 >> data);
                true
            }
            _ => false,
        },
        3 => {
            // Domains are not tracked in the TLB; flush implied.
            c.c3 = data;
            true
        }
        4 => false,
        5 => match opc2 {
            0 => {
                c.c5_dfsr = data;
                true
            }
            1 => {
                c.c5_ifsr = data;
                true
            }
            _ => false,
        },
        6 => match opc2 {
            0 => {
                c.c6_dfar = data;
                true
            }
            1 | 2 => {
                c.c6_ifar = data;
                true
            }
            _ => false,
        },
        7 => {
            if opc1 != 0 {
                return false;
            }
            // No cache to maintain; only the VA-to-PA machinery keeps
            // state.
            if f.has(Feature::V6k) && crm == 4 {
                c.c7_par = if f.has(Feature::V7) {
                    data & 0xffff_f6ff
                } else {
                    data & 0xffff_f1ff
                };
            }
            true
        }
        8 => match opc2 {
            // TLB maintenance: the shadow tables are maintained through
            // the virtual TLB, nothing to do here.
            0..=3 => true,
            _ => false,
        },
        9 => match crm {
            0 => match opc1 {
                0 => match opc2 {
                    0 => {
                        c.c9_data = data;
                        true
                    }
                    1 => {
                        c.c9_insn = data;
                        true
                    }
                    _ => false,
                },
                // L2 lockdown/auxiliary writes ignored.
                1 => true,
                _ => false,
            },
            _ => false,
        },
        // TLB lockdown: ignored.
        10 => true,
        11 | 12 => false,
        13 => match opc2 {
            0 => {
                // FCSE changes remap virtual addresses; flush implied.
                c.c13_fcse = data;
                true
            }
            1 => {
                // ASID change; flush implied.
                c.c13_context = data;
                true
            }
            _ => false,
        },
        14 => false,
        // Implementation specific: WI.
        15 => true,
        _ => false,
    }
}

/// Reads guest memory at virtual `addr` on behalf of instruction
/// emulation. Accesses covering the shadowed vector page come from the
/// local copy; everything else walks the vcpu's stage-1 table, refilling
/// through the translation-fault path, and routes to real memory or the
/// device bus according to the mapping's permissions.
pub fn mem_read(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    addr: u32,
    buf: &mut [u8],
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let rc = mem_read_inner(vcpu, regs, addr, buf, mmu, platform);
    if rc.is_err() {
        vcpu.halt(regs, platform.sched);
    }
    rc
}

fn mem_read_inner(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    addr: u32,
    buf: &mut [u8],
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let p = vcpu.private()?;
    if addr & !(VECTOR_PAGE_BYTES - 1) == p.cp15.ovect_base {
        let vind = (addr & (VECTOR_PAGE_BYTES - 1)) as usize;
        return vector_copy_read(&p.cp15.ovect, vind, buf);
    }

    let l1 = p.cp15.l1.ok_or(Error::Fail)?;
    let pg = match mmu.get_page(l1, addr) {
        Err(Error::NotAvail) => {
            let _ = trans_fault(
                vcpu,
                regs,
                addr,
                false,
                false,
                FaultAccess::Data,
                mmu,
                platform,
            )?;
            mmu.get_page(l1, addr)?
        }
        other => other?,
    };

    match pg.ap {
        AP_SREAD_U_NONE | AP_SRW_U_NONE => {
            platform
                .bus
                .emulate_read(vcpu.guest, (addr - pg.va) + pg.pa, buf)
        }
        AP_SRW_U_READ | AP_SRW_U_RW => platform.aspace.read((addr - pg.va) + pg.pa, buf),
        _ => Err(Error::Fail),
    }
}

/// Writes guest memory at virtual `addr` on behalf of instruction
/// emulation; the mirror image of [`mem_read`].
pub fn mem_write(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    addr: u32,
    buf: &[u8],
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let rc = mem_write_inner(vcpu, regs, addr, buf, mmu, platform);
    if rc.is_err() {
        vcpu.halt(regs, platform.sched);
    }
    rc
}

fn mem_write_inner(
    vcpu: &mut Vcpu,
    regs: &UserRegs,
    addr: u32,
    buf: &[u8],
    mmu: &Mmu,
    platform: &Platform<'_>,
) -> Result<()> {
    let p = vcpu.private_mut()?;
    if addr & !(VECTOR_PAGE_BYTES - 1) == p.cp15.ovect_base {
        let vind = (addr & (VECTOR_PAGE_BYTES - 1)) as usize;
        return vector_copy_write(&mut p.cp15.ovect, vind, buf);
    }

    let l1 = p.cp15.l1.ok_or(Error::Fail)?;
    let pg = match mmu.get_page(l1, addr) {
        Err(Error::NotAvail) => {
            let _ = trans_fault(
                vcpu,
                regs,
                addr,
                true,
                false,
                FaultAccess::Data,
                mmu,
                platform,
            )?;
            mmu.get_page(l1, addr)?
        }
        other => other?,
    };

    match pg.ap {
        AP_SRW_U_NONE => platform
            .bus
            .emulate_write(vcpu.guest, (addr - pg.va) + pg.pa, buf),
        AP_SRW_U_RW => platform.aspace.write((addr - pg.va) + pg.pa, buf),
        _ => Err(Error::Fail),
    }
}

fn vector_copy_read(ovect: &[u32; VECTOR_PAGE_WORDS], vind: usize, buf: &mut [u8]) -> Result<()> {
    match buf.len() {
        4 => {
            let word = ovect[(vind & !3) / 4];
            buf.copy_from_slice(&word.to_le_bytes());
            Ok(())
        }
        2 => {
            let word = ovect[(vind & !3) / 4];
            let half = if vind & 2 == 0 {
                word as u16
            } else {
                (word >> 16) as u16
            };
            buf.copy_from_slice(&half.to_le_bytes());
            Ok(())
        }
        1 => {
            let word = ovect[(vind & !3) / 4];
            buf[0] = word.to_le_bytes()[vind & 3];
            Ok(())
        }
        _ => Err(Error::Fail),
    }
}

fn vector_copy_write(
    ovect: &mut [u32; VECTOR_PAGE_WORDS],
    vind: usize,
    buf: &[u8],
) -> Result<()> {
    let slot = &mut ovect[(vind & !3) / 4];
    let mut bytes = slot.to_le_bytes();
    match buf.len() {
        4 => bytes.copy_from_slice(buf),
        2 => {
            let off = vind & 2;
            bytes[off..off + 2].copy_from_slice(buf);
        }
        1 => bytes[vind & 3] = buf[0],
        _ => return Err(Error::Fail),
    }
    *slot = u32::from_le_bytes(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::GuestRegion;
    use crate::testutil::TestEnv;
    use alloc::vec;

    #[test]
    fn test_mpidr_synthesized_from_guest_index() {
        let env = TestEnv::new();
        // V7MP parts set the MP bit on top of the vcpu index.
        let a9 = env.vcpu(1, 2, "arm,cortex-a9");
        assert_eq!(read(&a9, 0, 5, 0, 0), Some(0x8000_0002));

        // A V7 part without the MP extensions reads back only the index.
        let a8 = env.vcpu(2, 0, "arm,cortex-a8");
        assert_eq!(read(&a8, 0, 5, 0, 0), Some(0));
    }

    #[test]
    fn test_id_registers_read_from_template() {
        let env = TestEnv::new();
        let vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert_eq!(read(&vcpu, 0, 0, 0, 0), Some(0x410f_c080));
        assert_eq!(read(&vcpu, 0, 1, 0, 0), Some(0x8204_8004));
        assert_eq!(read(&vcpu, 0, 0, 1, 1), Some(0x00c5_0078));
        // Feature registers come from the per-model table.
        assert_eq!(read(&vcpu, 0, 4, 0, 1), Some(0x3110_0003));
    }

    #[test]
    fn test_cache_size_selection() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a9");
        // Select the icache, read CCSIDR through the selection.
        assert!(write(&mut vcpu, 2, 0, 0, 0, 1));
        assert_eq!(read(&vcpu, 2, 0, 0, 0), Some(1));
        assert_eq!(read(&vcpu, 1, 0, 0, 0), Some(0x200f_e015));
        assert_eq!(read(&vcpu, 1, 1, 0, 0), Some((1 << 27) | (1 << 24) | 3));
    }

    #[test]
    fn test_sctlr_write_read_roundtrip() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert!(write(&mut vcpu, 0, 0, 1, 0, 0x00c5_187d));
        assert_eq!(read(&vcpu, 0, 0, 1, 0), Some(0x00c5_187d));
    }

    #[test]
    fn test_ttbcr_write_recomputes_masks() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert!(write(&mut vcpu, 0, 2, 2, 0, 2));
        let c = &vcpu.private().unwrap().cp15;
        assert_eq!(c.c2_control, 2);
        assert_eq!(c.c2_mask, 0xc000_0000);
        assert_eq!(c.c2_base_mask, !(0x3fffu32 >> 2));
    }

    #[test]
    fn test_bad_registers_are_signalled() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        // Reserved CRn values.
        assert_eq!(read(&vcpu, 0, 0, 4, 0), None);
        assert_eq!(read(&vcpu, 0, 0, 12, 0), None);
        assert!(!write(&mut vcpu, 0, 0, 4, 0, 0));
        assert!(!write(&mut vcpu, 0, 0, 14, 0, 0));
        // Unrecognized opc2 under a known CRn.
        assert_eq!(read(&vcpu, 0, 5, 5, 0), None);
    }

    #[test]
    fn test_raz_wi_registers() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        // Implementation-specific space reads as zero, ignores writes.
        assert_eq!(read(&vcpu, 0, 0, 15, 0), Some(0));
        assert!(write(&mut vcpu, 0, 0, 15, 0, 0xdead));
        // TLB lockdown.
        assert_eq!(read(&vcpu, 0, 0, 10, 0), Some(0));
        assert!(write(&mut vcpu, 0, 0, 10, 0, 1));
        // TLB maintenance ops are accepted and discarded.
        assert!(write(&mut vcpu, 0, 0, 8, 7, 0));
    }

    #[test]
    fn test_fault_registers_roundtrip() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert!(write(&mut vcpu, 0, 0, 5, 0, 0x8));
        assert!(write(&mut vcpu, 0, 1, 5, 0, 0x5));
        assert!(write(&mut vcpu, 0, 0, 6, 0, 0x1234));
        assert!(write(&mut vcpu, 0, 2, 6, 0, 0x5678));
        assert_eq!(read(&vcpu, 0, 0, 5, 0), Some(0x8));
        assert_eq!(read(&vcpu, 0, 1, 5, 0), Some(0x5));
        assert_eq!(read(&vcpu, 0, 0, 6, 0), Some(0x1234));
        assert_eq!(read(&vcpu, 0, 2, 6, 0), Some(0x5678));
    }

    #[test]
    fn test_par_write_masks_reserved_bits() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a9");
        assert!(write(&mut vcpu, 0, 0, 7, 4, 0xffff_ffff));
        assert_eq!(read(&vcpu, 0, 0, 7, 4), Some(0xffff_f6ff));
    }

    #[test]
    fn test_context_id_and_fcse() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        assert!(write(&mut vcpu, 0, 1, 13, 0, 0x42));
        assert!(write(&mut vcpu, 0, 0, 13, 0, 0x0200_0000));
        assert_eq!(read(&vcpu, 0, 1, 13, 0), Some(0x42));
        assert_eq!(read(&vcpu, 0, 0, 13, 0), Some(0x0200_0000));
    }

    #[test]
    fn test_vector_addr_low_vectors_via_copy() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        // Host runs low vectors in the test double, so the copy shadows
        // base 0. Plant a handler address in the literal pool.
        vcpu.private_mut().unwrap().cp15.ovect[3 + 8] = 0xc000_1234;
        // Reset SCTLR has V clear: guest uses low vectors too, which is
        // exactly the shadowed page.
        assert_eq!(vector_addr(&vcpu, 3).unwrap(), 0xc000_1234);
    }

    #[test]
    fn test_vector_addr_high_vectors_raw() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let sctlr = vcpu.private().unwrap().cp15.c1_sctlr;
        assert!(write(&mut vcpu, 0, 0, 1, 0, sctlr | SCTLR_V));
        // The guest's high base is not the shadowed one; the raw vector
        // offset comes back.
        assert_eq!(vector_addr(&vcpu, 4).unwrap(), IRQ_HIGHVEC_BASE + 16);
    }

    #[test]
    fn test_vector_page_read_write_through_copy() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        let platform = env.platform();

        mem_write(&mut vcpu, &regs, 0x20, &0xe59f_f018u32.to_le_bytes(), &env.mmu, &platform)
            .unwrap();
        let mut buf = [0u8; 4];
        mem_read(&mut vcpu, &regs, 0x20, &mut buf, &env.mmu, &platform).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xe59f_f018);
        assert_eq!(vcpu.private().unwrap().cp15.ovect[8], 0xe59f_f018);

        // Halfword and byte windows into the same word.
        let mut half = [0u8; 2];
        mem_read(&mut vcpu, &regs, 0x22, &mut half, &env.mmu, &platform).unwrap();
        assert_eq!(u16::from_le_bytes(half), 0xe59f);
        mem_write(&mut vcpu, &regs, 0x23, &[0xaa], &env.mmu, &platform).unwrap();
        assert_eq!(vcpu.private().unwrap().cp15.ovect[8], 0xaa9f_f018);
    }

    #[test]
    fn test_mem_read_refills_and_reads_real_memory() {
        let env = TestEnv::with_regions(vec![GuestRegion {
            gphys: 0x0001_0000,
            hphys: 0x1000_0000,
            size: 0x1000,
            is_virtual: false,
        }]);
        {
            let mut mem = env.aspace.mem.lock().unwrap();
            for (i, b) in 0x55aa_1234u32.to_le_bytes().iter().enumerate() {
                let _ = mem.insert(0x1000_0004 + i as u32, *b);
            }
        }
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        let platform = env.platform();

        let mut buf = [0u8; 4];
        mem_read(&mut vcpu, &regs, 0x0001_0004, &mut buf, &env.mmu, &platform).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x55aa_1234);

        // The refill installed a mapping in the vcpu's L1.
        let l1 = vcpu.private().unwrap().cp15.l1.unwrap();
        let pg = env.mmu.get_page(l1, 0x0001_0004).unwrap();
        assert_eq!(pg.pa, 0x1000_0000);
    }

    #[test]
    fn test_mem_write_routes_virtual_region_to_bus() {
        let env = TestEnv::with_regions(vec![GuestRegion {
            gphys: 0x0900_0000,
            hphys: 0x0900_0000,
            size: 0x1000,
            is_virtual: true,
        }]);
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        let platform = env.platform();

        mem_write(&mut vcpu, &regs, 0x0900_0010, &[0x77], &env.mmu, &platform).unwrap();
        assert_eq!(
            env.bus.writes.load(core::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(
            env.bus.mem.lock().unwrap().get(&0x0900_0010).copied(),
            Some(0x77)
        );
    }

    #[test]
    fn test_mem_read_without_region_halts() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        let platform = env.platform();
        let mut buf = [0u8; 4];
        assert!(mem_read(&mut vcpu, &regs, 0x7000_0000, &mut buf, &env.mmu, &platform).is_err());
        assert_eq!(env.sched.halted.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_reset_flushes_virtual_tlb() {
        let env = TestEnv::with_regions(vec![GuestRegion {
            gphys: 0x0001_0000,
            hphys: 0x1000_0000,
            size: 0x1000,
            is_virtual: false,
        }]);
        let mut vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        let regs = vcpu.regs;
        let platform = env.platform();
        let mut buf = [0u8; 4];
        mem_read(&mut vcpu, &regs, 0x0001_0000, &mut buf, &env.mmu, &platform).unwrap();

        let l1 = vcpu.private().unwrap().cp15.l1.unwrap();
        assert!(env.mmu.get_page(l1, 0x0001_0000).is_ok());
        reset(&mut vcpu, &env.mmu).unwrap();
        assert!(env.mmu.get_page(l1, 0x0001_0000).is_err());
    }

    #[test]
    fn test_sync_cpsr_tracks_user_transitions() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(7, 0, "arm,cortex-a8");
        let mut regs = vcpu.regs;
        *env.sched.current.lock().unwrap() = Some(7);

        vcpu.cpsr_update(
            &mut regs,
            Mode::User as u32,
            crate::psr::PSR_MODE_MASK,
            &env.mmu,
            &env.sched,
        )
        .unwrap();
        let dacr = vcpu.private().unwrap().cp15.dacr;
        assert_eq!(
            (dacr >> (2 * DOM_VCPU_SUPER)) & 0x3,
            DACR_NO_ACCESS
        );
        // The running vcpu's change reached the hardware.
        use core::sync::atomic::Ordering;
        assert_eq!(env.hw.0.dacr.load(Ordering::Relaxed) & !0x3, dacr & !0x3);

        vcpu.cpsr_update(
            &mut regs,
            Mode::Supervisor as u32,
            crate::psr::PSR_MODE_MASK,
            &env.mmu,
            &env.sched,
        )
        .unwrap();
        let dacr = vcpu.private().unwrap().cp15.dacr;
        assert_eq!((dacr >> (2 * DOM_VCPU_SUPER)) & 0x3, DACR_CLIENT);
    }

    #[test]
    fn test_switch_context_points_hardware_at_vcpu_l1() {
        let env = TestEnv::new();
        let vcpu = env.vcpu(1, 0, "arm,cortex-a8");
        switch_context(None, &vcpu, &env.mmu).unwrap();
        let l1 = vcpu.private().unwrap().cp15.l1.unwrap();
        use core::sync::atomic::Ordering;
        assert_eq!(
            env.hw.0.ttbr0.load(Ordering::Relaxed),
            env.mmu.l1_pa(l1).unwrap()
        );
    }
}

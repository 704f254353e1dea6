//! The module containing the emulated CPU models and their feature
//! bitmaps.

/// Capabilities of an emulated processor. Each variant is a bit position
/// in [`Features`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Feature {
    /// ARMv4 with Thumb.
    V4t = 0,
    /// ARMv5.
    V5 = 1,
    /// ARMv6.
    V6 = 2,
    /// ARMv6K.
    V6k = 3,
    /// ARMv7.
    V7 = 4,
    /// ARMv7 multiprocessing extensions.
    V7mp = 5,
    /// Auxiliary control register present.
    AuxCr = 6,
    /// Thumb-2.
    Thumb2 = 7,
    /// ThumbEE.
    Thumb2ee = 8,
    /// VFP.
    Vfp = 9,
    /// VFPv3.
    Vfp3 = 10,
    /// VFPv4.
    Vfp4 = 11,
    /// Half-precision VFP.
    VfpFp16 = 12,
    /// Advanced SIMD.
    Neon = 13,
    /// Integer divide instructions.
    Div = 14,
    /// Large physical address extension.
    Lpae = 15,
    /// Architected generic timer.
    GenTimer = 16,
    /// Security extensions.
    TrustZone = 17,
    /// Memory protection unit instead of an MMU.
    Mpu = 18,
}

/// A feature bitmap identifying what the emulated CPU model can do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features(u32);

impl Features {
    /// An empty feature set.
    pub const fn none() -> Self {
        Features(0)
    }

    /// Sets `feature`.
    pub fn set(&mut self, feature: Feature) {
        self.0 |= 1 << (feature as u32);
    }

    /// Whether `feature` is present.
    pub fn has(self, feature: Feature) -> bool {
        self.0 & (1 << (feature as u32)) != 0
    }
}

/// Main ID register value of the Cortex-A8.
pub const CPUID_CORTEX_A8: u32 = 0x410f_c080;
/// Main ID register value of the Cortex-A9.
pub const CPUID_CORTEX_A9: u32 = 0x410f_c090;
/// Main ID register value of the Cortex-A15.
pub const CPUID_CORTEX_A15: u32 = 0x412f_c0f1;

/// The CPU models the cp15 emulator can present to a guest. Selected at
/// vcpu initialization from the guest configuration's compatible string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuModel {
    /// Cortex-A8: uniprocessor ARMv7-A with VFPv3 and NEON.
    CortexA8,
    /// Cortex-A9: ARMv7-A with the multiprocessing extensions.
    CortexA9,
    /// Cortex-A15: ARMv7-A with LPAE, virtualization and a generic timer.
    CortexA15,
}

impl CpuModel {
    /// Looks a model up by its device-tree style compatible string.
    pub fn from_compatible(compat: &str) -> Option<Self> {
        match compat {
            "arm,cortex-a8" => Some(CpuModel::CortexA8),
            "arm,cortex-a9" => Some(CpuModel::CortexA9),
            "arm,cortex-a15" => Some(CpuModel::CortexA15),
            _ => None,
        }
    }

    /// The main ID register value of the model.
    pub fn cpuid(self) -> u32 {
        match self {
            CpuModel::CortexA8 => CPUID_CORTEX_A8,
            CpuModel::CortexA9 => CPUID_CORTEX_A9,
            CpuModel::CortexA15 => CPUID_CORTEX_A15,
        }
    }

    /// The feature bitmap of the model.
    pub fn features(self) -> Features {
        let mut f = Features::none();
        // Common ARMv7-A baseline.
        for feature in [
            Feature::V4t,
            Feature::V5,
            Feature::V6,
            Feature::V6k,
            Feature::V7,
            Feature::AuxCr,
            Feature::Thumb2,
            Feature::Thumb2ee,
            Feature::Vfp,
        ] {
            f.set(feature);
        }
        match self {
            CpuModel::CortexA8 => {
                f.set(Feature::Vfp3);
                f.set(Feature::Neon);
                f.set(Feature::TrustZone);
            }
            CpuModel::CortexA9 => {
                f.set(Feature::Vfp3);
                f.set(Feature::VfpFp16);
                f.set(Feature::Neon);
                f.set(Feature::V7mp);
                f.set(Feature::TrustZone);
            }
            CpuModel::CortexA15 => {
                f.set(Feature::V7mp);
                f.set(Feature::Div);
                f.set(Feature::Vfp4);
                f.set(Feature::VfpFp16);
                f.set(Feature::Neon);
                f.set(Feature::Lpae);
                f.set(Feature::GenTimer);
                f.set(Feature::TrustZone);
            }
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup() {
        assert_eq!(
            CpuModel::from_compatible("arm,cortex-a9"),
            Some(CpuModel::CortexA9)
        );
        assert_eq!(CpuModel::from_compatible("arm,arm926"), None);
    }

    #[test]
    fn test_feature_sets() {
        let a8 = CpuModel::CortexA8.features();
        assert!(a8.has(Feature::V7));
        assert!(a8.has(Feature::Neon));
        assert!(!a8.has(Feature::V7mp));
        assert!(!a8.has(Feature::GenTimer));

        let a9 = CpuModel::CortexA9.features();
        assert!(a9.has(Feature::V7mp));
        assert!(a9.has(Feature::VfpFp16));
        assert!(!a9.has(Feature::Lpae));

        let a15 = CpuModel::CortexA15.features();
        assert!(a15.has(Feature::GenTimer));
        assert!(a15.has(Feature::Lpae));
        assert!(a15.has(Feature::Div));
    }
}

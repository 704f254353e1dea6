//! The module containing tunable constants and the externally supplied
//! guest/vcpu configuration records.

use alloc::string::String;
use serde::Deserialize;

/// How many virtual TLB entries a vcpu gets when its configuration does
/// not say otherwise.
pub const DEFAULT_VTLB_COUNT: usize = 8;

/// Default size of the translation table pool, in bytes. Enough for the
/// default L1, a handful of per-guest L1 copies and their L2 tables.
pub const DEFAULT_TTBL_POOL_SIZE: usize = 0x0010_0000;

/// Number of words in the virtualized exception vector page: eight vector
/// slots followed by eight literal-pool words.
pub const VECTOR_PAGE_WORDS: usize = 16;

/// Base of the exception vectors when the host runs with high vectors.
pub const IRQ_HIGHVEC_BASE: u32 = 0xffff_0000;

/// Base of the exception vectors when the host runs with low vectors.
pub const IRQ_LOWVEC_BASE: u32 = 0x0000_0000;

/// Per-vcpu configuration. The embedding hypervisor reads this out of the
/// guest device tree (or any other store) and hands it to the core; the
/// serde derive lets embedders that carry configuration as JSON
/// deserialize it directly.
#[derive(Clone, Debug, Deserialize)]
pub struct VcpuConfig {
    /// Compatible string naming the emulated CPU model,
    /// e.g. `arm,cortex-a15`.
    pub compatible: String,

    /// Number of virtual TLB entries.
    #[serde(default = "default_vtlb_count")]
    pub vtlb_count: usize,

    /// Physical timer interrupt of the generic timer, when the model has
    /// one.
    #[serde(default)]
    pub gentimer_phys_irq: u32,

    /// Virtual timer interrupt of the generic timer, when the model has
    /// one.
    #[serde(default)]
    pub gentimer_virt_irq: u32,
}

fn default_vtlb_count() -> usize {
    DEFAULT_VTLB_COUNT
}

impl VcpuConfig {
    /// Builds a configuration for `compatible` with every other knob at
    /// its default.
    pub fn new(compatible: &str) -> Self {
        Self {
            compatible: String::from(compatible),
            vtlb_count: DEFAULT_VTLB_COUNT,
            gentimer_phys_irq: 0,
            gentimer_virt_irq: 0,
        }
    }

    /// Deserializes a configuration from a JSON document.
    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        serde_json::from_str(raw).map_err(|_| crate::error::Error::Invalid)
    }
}

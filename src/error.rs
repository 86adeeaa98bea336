//! Fatal setup conditions.
//!
//! The engine is a single batch job whose output depends on a correct
//! parallel layout, so every inconsistency detected during setup is fatal:
//! no retries, no partial success. Conditions that arise mid-join (skew
//! plan rewrites) are normal control flow, not errors.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot seat {requested} threads: this machine supports at most {max} ({num_llcs} LLCs x {cores_per_llc} cores x {cpus_per_core} hw-threads)")]
    TooManyThreads {
        requested: usize,
        max: usize,
        num_llcs: usize,
        cores_per_llc: usize,
        cpus_per_core: usize,
    },

    #[error("at least one worker thread is required")]
    NoThreads,

    #[error("radix plan violates divisibility: fanout {fanout} of relation {rel} is not a multiple of {num_groups} LLC groups")]
    PlanIndivisible {
        rel: char,
        fanout: u32,
        num_groups: usize,
    },

    #[error("asymmetric radix plan (R bits {r_bits}, S bits {s_bits}) is not supported; use equal bits, or a positive R radix with S radix 0")]
    AsymmetricPlan { r_bits: u32, s_bits: u32 },

    #[error("relation {rel} has {size} tuples, exceeding the 32-bit key space")]
    RelationTooLarge { rel: char, size: usize },

    #[error("invalid skew exponent {value}: {reason}")]
    InvalidSkew { value: f64, reason: String },

    #[error("topology discovery failed: {0}")]
    Discovery(String),

    #[error("topology discovery failed: {0}")]
    DiscoveryIo(#[from] std::io::Error),
}

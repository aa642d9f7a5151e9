//! Limits enforced by the supervisor (as opposed to kernel rlimits).

use std::time::Duration;

use crate::size::Size;

/// Ceilings the supervisor checks against rusage on every wait wake-up.
#[derive(Debug, Clone, Copy)]
pub struct Limit {
    /// User CPU time ceiling.
    pub time: Duration,
    /// Max resident set ceiling.
    pub memory: Size,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            time: Duration::MAX,
            memory: Size(u64::MAX),
        }
    }
}

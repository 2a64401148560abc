//! Resource samples for a supervised pid. These feed status output only and
//! never influence supervision decisions.

use serde::{Deserialize, Serialize};

use crate::errors::WardenError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

impl MetricsSample {
    pub fn zero() -> Self {
        Self::default()
    }
}

pub trait MetricsSource: Send + Sync {
    fn sample(&self, pid: i32) -> Result<MetricsSample, WardenError>;
}

/// What a slot reports for metrics this tick: a sample, an explicit zero row
/// (history mode keeps time series dense), or nothing.
pub fn idle_metrics(history: bool) -> Option<MetricsSample> {
    history.then(MetricsSample::zero)
}

//! Upstream data sources.

use crate::types::staking::Reward;

pub mod rewards;
pub mod subgraph;
pub mod testing;

/// A batch of records fetched from one upstream source.
///
/// `fallback` marks batches synthesized locally after a transport failure, so
/// degraded-mode data stays distinguishable from live upstream data in cycle
/// summaries, health reports and metrics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceBatch<T> {
    pub records: Vec<T>,
    pub fallback: bool,
}

impl<T> SourceBatch<T> {
    /// A batch of live upstream data.
    pub fn live(records: Vec<T>) -> Self {
        Self {
            records,
            fallback: false,
        }
    }

    /// A locally-synthesized batch served because the upstream call failed.
    pub fn fallback(records: Vec<T>) -> Self {
        Self {
            records,
            fallback: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A single value fetched from one upstream source.
///
/// Scalar counterpart of [`SourceBatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceValue<T> {
    pub value: T,
    pub fallback: bool,
}

impl<T> SourceValue<T> {
    pub fn live(value: T) -> Self {
        Self {
            value,
            fallback: false,
        }
    }

    pub fn fallback(value: T) -> Self {
        Self {
            value,
            fallback: true,
        }
    }
}

/// A source of reward records for the persistence pipeline.
///
/// Implemented by the reward simulator today. A live rewards feed replaces the
/// implementation without touching the orchestrator.
pub trait RewardSource: Send + Sync {
    fn fetch_rewards(&self) -> impl Send + Future<Output = SourceBatch<Reward>>;
}

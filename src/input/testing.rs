#![cfg(any(test, feature = "testing"))]

//! Mock upstream clients for tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    Error, Result,
    error::ensure,
    input::{
        rewards::{MetricsResponse, RewardStatEntry, StatsClient},
        subgraph::{DepositEntry, OperatorEntry, SubgraphClient},
    },
};

/// A subgraph client serving canned entries, with failure injection.
#[derive(Clone, Debug, Default)]
pub struct MockSubgraphClient {
    deposits: Vec<DepositEntry>,
    operators: Vec<OperatorEntry>,
    failing: Arc<AtomicBool>,
}

impl MockSubgraphClient {
    pub fn new(deposits: Vec<DepositEntry>, operators: Vec<OperatorEntry>) -> Self {
        Self {
            deposits,
            operators,
            failing: Default::default(),
        }
    }

    /// All subsequent requests fail as if the endpoint were unreachable.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

impl SubgraphClient for MockSubgraphClient {
    async fn deposits(&self) -> Result<Vec<DepositEntry>> {
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            Error::transport("mock subgraph unreachable")
        );
        Ok(self.deposits.clone())
    }

    async fn operators(&self) -> Result<Vec<OperatorEntry>> {
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            Error::transport("mock subgraph unreachable")
        );
        Ok(self.operators.clone())
    }
}

/// A rewards API client serving canned responses, with failure injection.
#[derive(Clone, Debug)]
pub struct MockStatsClient {
    metrics: MetricsResponse,
    rewards: Vec<RewardStatEntry>,
    failing: Arc<AtomicBool>,
}

impl MockStatsClient {
    pub fn new(metrics: MetricsResponse, rewards: Vec<RewardStatEntry>) -> Self {
        Self {
            metrics,
            rewards,
            failing: Default::default(),
        }
    }

    /// A client pre-loaded with a plausible metrics object and a two-entry
    /// rewards series.
    pub fn with_defaults() -> Self {
        Self::new(
            MetricsResponse {
                total_pooled: "9000000000000000000000000".to_string(),
                total_shares: "8500000000000000000000000".to_string(),
                buffer: "12000000000000000000".to_string(),
                apr: 3.4,
            },
            vec![
                RewardStatEntry {
                    amount: "250000000000000000".to_string(),
                    apr: 3.4,
                    timestamp: 1_754_000_000,
                },
                RewardStatEntry {
                    amount: "240000000000000000".to_string(),
                    apr: 3.3,
                    timestamp: 1_753_913_600,
                },
            ],
        )
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

impl StatsClient for MockStatsClient {
    async fn metrics(&self) -> Result<MetricsResponse> {
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            Error::transport("mock rewards API unreachable")
        );
        Ok(self.metrics.clone())
    }

    async fn recent_rewards(&self, limit: usize) -> Result<Vec<RewardStatEntry>> {
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            Error::transport("mock rewards API unreachable")
        );
        Ok(self.rewards.iter().take(limit).cloned().collect())
    }
}

/// A deterministic deposit entry derived from a small seed.
pub fn deposit_entry(seed: u8) -> DepositEntry {
    DepositEntry {
        depositor: format!("0x{:040x}", u128::from(seed)),
        shares: format!("{}", u128::from(seed) * 32_000_000_000_000_000_000),
        strategy: format!("0x{:040x}", 0xaa00 + u128::from(seed)),
        block_number: format!("{}", 19_000_000 + u64::from(seed)),
        block_timestamp: format!("{}", 1_700_000_000 + u64::from(seed) * 86_400),
        transaction_hash: format!("0x{:064x}", u128::from(seed)),
    }
}

/// A deterministic operator entry derived from a small seed.
pub fn operator_entry(seed: u8) -> OperatorEntry {
    OperatorEntry {
        id: format!("0x{:040x}", 0xbb00 + u128::from(seed)),
        total_shares: format!("{}", u128::from(seed) * 10_000_000_000_000_000_000),
        metadata_uri: Some(format!("https://operators.example/{seed}.json")),
    }
}

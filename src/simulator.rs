//! Deterministic reward derivation from stake snapshots.
//!
//! There is no live restaking-rewards feed yet, so rewards are derived from
//! the current stake snapshot: a fixed number of daily periods, each yielding
//! a fixed fraction of the staked amount. The derivation is a pure function of
//! its inputs and the provided clock; it never touches the store.

use alloy::primitives::keccak256;
use chrono::{DateTime, Duration, Utc};

use crate::{
    input::{RewardSource, SourceBatch},
    types::{
        common::{Address, RewardKind, TokenAmount, TxHash, U256},
        staking::{Restaker, Reward},
    },
};
use crate::input::subgraph::{SubgraphAdapter, SubgraphClient};

/// Number of daily periods derived per cycle.
pub const SIMULATION_PERIODS: u32 = 30;

/// Per-period reward rate, expressed as a divisor: each period yields
/// 1/10 000 (0.01%) of the staked amount.
pub const PERIOD_RATE_DIVISOR: u64 = 10_000;

/// Materiality threshold: derived rewards below 0.001 token (at 18 decimals)
/// are dropped.
pub const MIN_REWARD_WEI: u128 = 1_000_000_000_000_000;

/// Derive reward records for the given stake snapshot.
///
/// For each restaker, one reward per period over the lookback window, each
/// timestamped one period further in the past from `now` and carrying a
/// synthetic transaction hash. Output is byte-identical across invocations
/// with the same snapshot and clock.
pub fn simulate_rewards(restakers: &[Restaker], now: DateTime<Utc>) -> Vec<Reward> {
    let threshold = U256::from(MIN_REWARD_WEI);
    let divisor = U256::from(PERIOD_RATE_DIVISOR);

    let mut rewards = Vec::new();
    for restaker in restakers {
        let per_period: TokenAmount = restaker.amount_restaked / divisor;
        if per_period < threshold {
            tracing::debug!(
                user = %restaker.user_address,
                amount = %per_period,
                "derived reward below materiality threshold, skipping"
            );
            continue;
        }
        for period in 0..SIMULATION_PERIODS {
            let timestamp = now - Duration::days(i64::from(period));
            rewards.push(Reward {
                user_address: restaker.user_address,
                validator_address: restaker.validator_address,
                amount: per_period,
                kind: RewardKind::Restaking,
                block_number: restaker.block_number,
                tx_hash: synthetic_tx_hash(restaker.user_address, period, timestamp),
                timestamp,
            });
        }
    }
    rewards
}

/// Synthetic transaction identifier for a derived reward.
///
/// Derived rewards have no on-chain transaction; the hash only needs to be
/// stable for a given (user, period, clock) triple.
fn synthetic_tx_hash(user: Address, period: u32, timestamp: DateTime<Utc>) -> TxHash {
    let mut preimage = Vec::with_capacity(32);
    preimage.extend_from_slice(user.as_slice());
    preimage.extend_from_slice(&period.to_be_bytes());
    preimage.extend_from_slice(&timestamp.timestamp().to_be_bytes());
    keccak256(preimage)
}

/// Reward source backed by the simulator: pulls the current stake snapshot
/// from the subgraph and derives rewards from it.
///
/// The orchestrator only sees the [`RewardSource`] interface, so a live
/// rewards feed can replace this without orchestrator changes.
#[derive(Clone, Debug)]
pub struct SimulatedRewardSource<C> {
    subgraph: SubgraphAdapter<C>,
}

impl<C> SimulatedRewardSource<C> {
    pub fn new(subgraph: SubgraphAdapter<C>) -> Self {
        Self { subgraph }
    }
}

impl<C: SubgraphClient> RewardSource for SimulatedRewardSource<C> {
    async fn fetch_rewards(&self) -> SourceBatch<Reward> {
        let snapshot = self.subgraph.fetch_restakers().await;
        let rewards = simulate_rewards(&snapshot.records, Utc::now());
        SourceBatch {
            records: rewards,
            // Rewards derived from fallback stake data are themselves fallback.
            fallback: snapshot.fallback,
        }
    }
}

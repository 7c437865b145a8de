#![cfg(any(test, feature = "testing"))]

//! In-memory store for tests.

use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_lock::RwLock;

use crate::{
    Error, Result,
    error::ensure,
    persistence::StakingPersistence,
    types::{
        common::{Address, TokenAmount},
        staking::{
            Restaker, Reward, RewardsSummary, SlashEvent, Validator, ValidatorRecord,
            ValidatorRewardBreakdown,
        },
    },
};

use super::sql::RECENT_REWARDS_WINDOW;

/// An in-memory [`StakingPersistence`] with write accounting and error
/// injection, mirroring the semantics of the SQL store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    write_delay: Arc<RwLock<Option<Duration>>>,
}

#[derive(Debug, Default)]
struct Inner {
    restakers: BTreeMap<Address, Restaker>,
    validators: BTreeMap<Address, Validator>,
    slashes: Vec<SlashEvent>,
    rewards: Vec<Reward>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of write attempts, including failed and duplicate ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// While set, every write fails with an internal store error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stall every write by the given duration. Lets tests hold a refresh
    /// cycle in flight long enough to observe the admission gate.
    pub async fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.write().await = Some(delay);
    }

    pub async fn restaker_count(&self) -> usize {
        self.inner.read().await.restakers.len()
    }

    pub async fn validator_count(&self) -> usize {
        self.inner.read().await.validators.len()
    }

    pub async fn reward_count(&self) -> usize {
        self.inner.read().await.rewards.len()
    }

    pub async fn slash_count(&self) -> usize {
        self.inner.read().await.slashes.len()
    }

    async fn begin_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.write_delay.read().await {
            tokio::time::sleep(delay).await;
        }
        ensure!(
            !self.fail_writes.load(Ordering::SeqCst),
            Error::internal("injected store failure")
        );
        Ok(())
    }
}

impl StakingPersistence for MemoryStore {
    async fn upsert_restaker(&self, restaker: &Restaker) -> Result<()> {
        self.begin_write().await?;
        let replaced = self
            .inner
            .write()
            .await
            .restakers
            .insert(restaker.user_address, *restaker);
        ensure!(
            replaced.is_none(),
            Error::duplicate_key(format!("restaker {}", restaker.user_address))
        );
        Ok(())
    }

    async fn upsert_validator(&self, validator: &Validator) -> Result<()> {
        self.begin_write().await?;
        let replaced = self
            .inner
            .write()
            .await
            .validators
            .insert(validator.operator_address, validator.clone());
        ensure!(
            replaced.is_none(),
            Error::duplicate_key(format!("validator {}", validator.operator_address))
        );
        Ok(())
    }

    async fn append_slash_event(&self, event: &SlashEvent) -> Result<()> {
        self.begin_write().await?;
        self.inner.write().await.slashes.push(event.clone());
        Ok(())
    }

    async fn append_reward(&self, reward: &Reward) -> Result<()> {
        self.begin_write().await?;
        self.inner.write().await.rewards.push(*reward);
        Ok(())
    }

    async fn list_restakers(&self) -> Result<Vec<Restaker>> {
        let mut restakers: Vec<_> = self.inner.read().await.restakers.values().copied().collect();
        restakers.sort_by(|a, b| b.amount_restaked.cmp(&a.amount_restaked));
        Ok(restakers)
    }

    async fn list_validators(&self) -> Result<Vec<ValidatorRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .validators
            .values()
            .map(|validator| {
                let mut slashes: Vec<_> = inner
                    .slashes
                    .iter()
                    .filter(|event| event.operator_address == validator.operator_address)
                    .cloned()
                    .collect();
                slashes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                ValidatorRecord {
                    validator: validator.clone(),
                    slashes,
                }
            })
            .collect();
        records.sort_by(|a, b| {
            b.validator
                .total_delegated
                .cmp(&a.validator.total_delegated)
        });
        Ok(records)
    }

    async fn rewards_for_address(&self, address: Address) -> Result<RewardsSummary> {
        let inner = self.inner.read().await;
        let mut rewards: Vec<_> = inner
            .rewards
            .iter()
            .filter(|reward| reward.user_address == address)
            .copied()
            .collect();
        rewards.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut total = TokenAmount::ZERO;
        let mut breakdowns: BTreeMap<Address, ValidatorRewardBreakdown> = BTreeMap::new();
        for reward in &rewards {
            total += reward.amount;
            breakdowns
                .entry(reward.validator_address)
                .and_modify(|breakdown| {
                    breakdown.total += reward.amount;
                    breakdown.count += 1;
                    breakdown.earliest = breakdown.earliest.min(reward.timestamp);
                    breakdown.latest = breakdown.latest.max(reward.timestamp);
                })
                .or_insert(ValidatorRewardBreakdown {
                    validator_address: reward.validator_address,
                    total: reward.amount,
                    count: 1,
                    earliest: reward.timestamp,
                    latest: reward.timestamp,
                });
        }
        let mut validators: Vec<_> = breakdowns.into_values().collect();
        validators.sort_by(|a, b| b.total.cmp(&a.total));

        let recent = rewards.iter().take(RECENT_REWARDS_WINDOW).copied().collect();
        Ok(RewardsSummary {
            total,
            validators,
            recent,
        })
    }
}

//! Persistent storage for the restaking data set.

pub mod sql;
pub mod testing;

use crate::{
    Result,
    types::{
        common::Address,
        staking::{Restaker, Reward, RewardsSummary, SlashEvent, Validator, ValidatorRecord},
    },
};

/// Store contract for the four persisted collections.
///
/// Schema initialization is part of construction (see
/// [`sql::Persistence::new`]) and is idempotent, so every value of an
/// implementing type is ready for writes.
pub trait StakingPersistence: Clone + Send + Sync {
    /// Insert or replace a restaker keyed by user address.
    ///
    /// When the key already exists, the row is replaced (latest write wins,
    /// refreshing the last-modified timestamp) and the call reports
    /// [`DuplicateKey`](crate::Error::DuplicateKey), which callers re-fetching
    /// unchanged upstream state are expected to swallow.
    fn upsert_restaker(&self, restaker: &Restaker) -> impl Send + Future<Output = Result<()>>;

    /// Insert or replace a validator keyed by operator address. Same
    /// semantics as [`upsert_restaker`](Self::upsert_restaker).
    fn upsert_validator(&self, validator: &Validator) -> impl Send + Future<Output = Result<()>>;

    /// Append a slash event.
    ///
    /// Never fails for lack of a matching validator: slash history may arrive
    /// before the validator record it belongs to.
    fn append_slash_event(&self, event: &SlashEvent) -> impl Send + Future<Output = Result<()>>;

    /// Append a reward. No uniqueness constraint applies.
    fn append_reward(&self, reward: &Reward) -> impl Send + Future<Output = Result<()>>;

    /// All restakers, ordered by descending staked amount.
    fn list_restakers(&self) -> impl Send + Future<Output = Result<Vec<Restaker>>>;

    /// All validators ordered by descending delegated stake, each joined with
    /// its slash history (newest first).
    fn list_validators(&self) -> impl Send + Future<Output = Result<Vec<ValidatorRecord>>>;

    /// Reward totals, a per-validator breakdown, and the most recent 50
    /// reward rows for the given address.
    ///
    /// All sums are exact 256-bit integer arithmetic over the stored decimal
    /// strings; native floating point is never involved.
    fn rewards_for_address(
        &self,
        address: Address,
    ) -> impl Send + Future<Output = Result<RewardsSummary>>;
}

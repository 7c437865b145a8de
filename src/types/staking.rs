//! The restaking data set: persisted entities and read-side views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{Address, RewardKind, TokenAmount, TxHash, ValidatorStatus};

/// A user's last-known restaked position.
///
/// Keyed by user address. Each successful refresh cycle overwrites the
/// previous row for the same address: this is a projection of the latest
/// upstream snapshot, not an append log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Restaker {
    /// The depositing account.
    pub user_address: Address,

    /// Amount restaked, in WEI.
    pub amount_restaked: TokenAmount,

    /// The validator this stake counts toward.
    ///
    /// The strategy contract stands in as the validator reference; there is no
    /// separate validator assignment in the deposit event.
    pub validator_address: Address,

    /// The strategy the deposit was made into.
    pub strategy_address: Address,

    /// Block the deposit event originated in.
    pub block_number: u64,

    /// Transaction carrying the deposit event.
    pub tx_hash: TxHash,

    /// On-chain timestamp of the deposit event.
    pub timestamp: DateTime<Utc>,
}

/// An operator receiving delegated stake.
///
/// Keyed by operator address, with the same overwrite-by-key semantics as
/// [`Restaker`]. Owns zero or more [`SlashEvent`]s via the operator address.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Validator {
    /// The operator's account address.
    pub operator_address: Address,

    /// Opaque upstream identifier for the operator.
    pub operator_id: String,

    /// Total stake delegated to this operator, in WEI.
    pub total_delegated: TokenAmount,

    /// Operational status. Defaults to active; the upstream feed carries no
    /// status signal, so this only changes through a future slashing feed.
    pub status: ValidatorStatus,

    /// Optional metadata URI registered by the operator.
    pub metadata_uri: Option<String>,
}

/// A slashing of an operator. Append-only.
///
/// The operator address should reference a known [`Validator`], but the store
/// never enforces this: slash history may arrive before the validator record
/// it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlashEvent {
    pub operator_address: Address,

    /// Amount slashed, in WEI.
    pub amount: TokenAmount,

    /// Free-text reason reported by the feed.
    pub reason: String,

    pub block_number: u64,

    pub tx_hash: TxHash,

    pub timestamp: DateTime<Utc>,
}

/// A reward accrued by a user. Append-only.
///
/// There is no uniqueness constraint: the reward simulator is deterministic
/// only within a cycle, so logically-duplicate rewards across cycles are
/// tolerated by design.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reward {
    pub user_address: Address,

    pub validator_address: Address,

    /// Reward amount, in WEI.
    pub amount: TokenAmount,

    pub kind: RewardKind,

    pub block_number: u64,

    pub tx_hash: TxHash,

    pub timestamp: DateTime<Utc>,
}

/// A validator together with its slash history, as served by the read API.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ValidatorRecord {
    #[serde(flatten)]
    pub validator: Validator,

    /// Slash events recorded against this operator, newest first.
    pub slashes: Vec<SlashEvent>,
}

/// Aggregated rewards of one user against one validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ValidatorRewardBreakdown {
    pub validator_address: Address,

    /// Exact sum of all reward amounts, in WEI.
    pub total: TokenAmount,

    /// Number of reward rows.
    pub count: usize,

    pub earliest: DateTime<Utc>,

    pub latest: DateTime<Utc>,
}

/// Everything the read API serves about one user's rewards.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RewardsSummary {
    /// Exact sum of all reward amounts for the user, in WEI.
    pub total: TokenAmount,

    /// Per-validator breakdown.
    pub validators: Vec<ValidatorRewardBreakdown>,

    /// The most recent individual reward rows, newest first (at most 50).
    pub recent: Vec<Reward>,
}

/// Aggregate staking statistics from the rewards API.
///
/// Informational only; never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct StakingMetrics {
    /// Total pooled assets, in WEI.
    pub total_pooled: TokenAmount,

    /// Total shares outstanding.
    pub total_shares: TokenAmount,

    /// Unstaked buffer, in WEI.
    pub buffer: TokenAmount,

    /// Protocol-wide annual percentage rate. A statistic, not an amount.
    pub apr: f64,
}

/// One entry of the rewards API's recent-rewards series.
///
/// Informational only; never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct RewardStat {
    /// Reward amount for the period, in WEI.
    pub amount: TokenAmount,

    /// APR observed for the period.
    pub apr: f64,

    pub timestamp: DateTime<Utc>,
}

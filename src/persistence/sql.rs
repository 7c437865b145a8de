//! SQL-based persistent storage
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::{
    Error, Result,
    persistence::StakingPersistence,
    types::{
        common::{
            Address, TokenAmount, TxHash, ValidatorStatus, format_timestamp, parse_timestamp,
        },
        staking::{
            Restaker, Reward, RewardsSummary, SlashEvent, Validator, ValidatorRecord,
            ValidatorRewardBreakdown,
        },
    },
};

/// How many individual reward rows [`rewards_for_address`] returns.
///
/// [`rewards_for_address`]: StakingPersistence::rewards_for_address
pub const RECENT_REWARDS_WINDOW: usize = 50;

/// Options for persistence.
#[derive(Parser, Clone, Debug)]
pub struct PersistenceOptions {
    /// Path to the SQLite database file.
    ///
    /// If the file does not exist, it will be created.
    /// The parent directory must exist.
    #[clap(long = "db-path", env = "RESTAKING_SERVICE_DB_PATH")]
    pub path: PathBuf,

    /// Maximum number of connections in the connection pool.
    #[clap(
        long = "db-max-connections",
        env = "RESTAKING_SERVICE_DB_MAX_CONNECTIONS",
        default_value = "5"
    )]
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    /// Create a new SQLite database with the given options.
    ///
    /// Runs migrations, so the schema exists once this returns. Safe to call
    /// repeatedly, including concurrently: migrations take a database lock and
    /// already-applied migrations are skipped.
    pub async fn new(options: &PersistenceOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(
            options
                .path
                .to_str()
                .ok_or_else(|| Error::internal("invalid database path"))?,
        )?
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        tracing::info!("SQLite persistence initialized");
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations/sqlite")
            .run(pool)
            .await
            .map_err(|err| Error::internal(format!("failed to run migrations: {err}")))?;
        Ok(())
    }
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse()
        .map_err(|err| Error::internal(format!("malformed stored address {raw:?}: {err}")))
}

fn parse_amount(raw: &str) -> Result<TokenAmount> {
    raw.parse()
        .map_err(|err| Error::internal(format!("malformed stored amount {raw:?}: {err}")))
}

fn parse_hash(raw: &str) -> Result<TxHash> {
    raw.parse()
        .map_err(|err| Error::internal(format!("malformed stored tx hash {raw:?}: {err}")))
}

type RestakerRow = (String, String, String, String, i64, String, String);

fn restaker_from_row(row: RestakerRow) -> Result<Restaker> {
    let (user, amount, validator, strategy, block_number, tx_hash, timestamp) = row;
    Ok(Restaker {
        user_address: parse_address(&user)?,
        amount_restaked: parse_amount(&amount)?,
        validator_address: parse_address(&validator)?,
        strategy_address: parse_address(&strategy)?,
        block_number: block_number as u64,
        tx_hash: parse_hash(&tx_hash)?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

type ValidatorRow = (String, String, String, String, Option<String>);

fn validator_from_row(row: ValidatorRow) -> Result<Validator> {
    let (operator, operator_id, total_delegated, status, metadata_uri) = row;
    Ok(Validator {
        operator_address: parse_address(&operator)?,
        operator_id,
        total_delegated: parse_amount(&total_delegated)?,
        status: ValidatorStatus::from_str(&status)?,
        metadata_uri,
    })
}

type SlashRow = (String, String, String, i64, String, String);

fn slash_from_row(row: SlashRow) -> Result<SlashEvent> {
    let (operator, amount, reason, block_number, tx_hash, timestamp) = row;
    Ok(SlashEvent {
        operator_address: parse_address(&operator)?,
        amount: parse_amount(&amount)?,
        reason,
        block_number: block_number as u64,
        tx_hash: parse_hash(&tx_hash)?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

type RewardRow = (String, String, String, String, i64, String, String);

fn reward_from_row(row: RewardRow) -> Result<Reward> {
    let (user, validator, amount, kind, block_number, tx_hash, timestamp) = row;
    Ok(Reward {
        user_address: parse_address(&user)?,
        validator_address: parse_address(&validator)?,
        amount: parse_amount(&amount)?,
        kind: kind.parse()?,
        block_number: block_number as u64,
        tx_hash: parse_hash(&tx_hash)?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

impl StakingPersistence for Persistence {
    async fn upsert_restaker(&self, restaker: &Restaker) -> Result<()> {
        let updated_at = format_timestamp(Utc::now());
        let insert = sqlx::query(
            "INSERT INTO restakers
                (user_address, amount_restaked, validator_address, strategy_address,
                 block_number, tx_hash, event_timestamp, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(restaker.user_address.to_string())
        .bind(restaker.amount_restaked.to_string())
        .bind(restaker.validator_address.to_string())
        .bind(restaker.strategy_address.to_string())
        .bind(restaker.block_number as i64)
        .bind(restaker.tx_hash.to_string())
        .bind(format_timestamp(restaker.timestamp))
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::from);

        match insert {
            Ok(_) => Ok(()),
            Err(err) if err.is_duplicate_key() => {
                // Latest write wins: replace the row, then surface the
                // duplicate condition for the caller to swallow.
                sqlx::query(
                    "UPDATE restakers SET
                         amount_restaked = $1,
                         validator_address = $2,
                         strategy_address = $3,
                         block_number = $4,
                         tx_hash = $5,
                         event_timestamp = $6,
                         updated_at = $7
                     WHERE user_address = $8",
                )
                .bind(restaker.amount_restaked.to_string())
                .bind(restaker.validator_address.to_string())
                .bind(restaker.strategy_address.to_string())
                .bind(restaker.block_number as i64)
                .bind(restaker.tx_hash.to_string())
                .bind(format_timestamp(restaker.timestamp))
                .bind(&updated_at)
                .bind(restaker.user_address.to_string())
                .execute(&self.pool)
                .await?;
                Err(Error::duplicate_key(format!(
                    "restaker {} already existed, replaced with latest state",
                    restaker.user_address
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn upsert_validator(&self, validator: &Validator) -> Result<()> {
        let updated_at = format_timestamp(Utc::now());
        let insert = sqlx::query(
            "INSERT INTO validators
                (operator_address, operator_id, total_delegated, status, metadata_uri, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(validator.operator_address.to_string())
        .bind(&validator.operator_id)
        .bind(validator.total_delegated.to_string())
        .bind(validator.status.as_str())
        .bind(&validator.metadata_uri)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::from);

        match insert {
            Ok(_) => Ok(()),
            Err(err) if err.is_duplicate_key() => {
                sqlx::query(
                    "UPDATE validators SET
                         operator_id = $1,
                         total_delegated = $2,
                         status = $3,
                         metadata_uri = $4,
                         updated_at = $5
                     WHERE operator_address = $6",
                )
                .bind(&validator.operator_id)
                .bind(validator.total_delegated.to_string())
                .bind(validator.status.as_str())
                .bind(&validator.metadata_uri)
                .bind(&updated_at)
                .bind(validator.operator_address.to_string())
                .execute(&self.pool)
                .await?;
                Err(Error::duplicate_key(format!(
                    "validator {} already existed, replaced with latest state",
                    validator.operator_address
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn append_slash_event(&self, event: &SlashEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO slash_events
                (operator_address, amount, reason, block_number, tx_hash, event_timestamp)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.operator_address.to_string())
        .bind(event.amount.to_string())
        .bind(&event.reason)
        .bind(event.block_number as i64)
        .bind(event.tx_hash.to_string())
        .bind(format_timestamp(event.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_reward(&self, reward: &Reward) -> Result<()> {
        sqlx::query(
            "INSERT INTO rewards
                (user_address, validator_address, amount, reward_kind,
                 block_number, tx_hash, event_timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(reward.user_address.to_string())
        .bind(reward.validator_address.to_string())
        .bind(reward.amount.to_string())
        .bind(reward.kind.as_str())
        .bind(reward.block_number as i64)
        .bind(reward.tx_hash.to_string())
        .bind(format_timestamp(reward.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_restakers(&self) -> Result<Vec<Restaker>> {
        let rows = sqlx::query_as::<_, RestakerRow>(
            "SELECT user_address, amount_restaked, validator_address, strategy_address,
                    block_number, tx_hash, event_timestamp
             FROM restakers",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut restakers = rows
            .into_iter()
            .map(restaker_from_row)
            .collect::<Result<Vec<_>>>()?;
        // Amounts are stored as decimal strings of varying width, so ordering
        // happens here on the parsed integers, not in SQL.
        restakers.sort_by(|a, b| b.amount_restaked.cmp(&a.amount_restaked));
        Ok(restakers)
    }

    #[instrument(skip(self))]
    async fn list_validators(&self) -> Result<Vec<ValidatorRecord>> {
        let validator_rows = sqlx::query_as::<_, ValidatorRow>(
            "SELECT operator_address, operator_id, total_delegated, status, metadata_uri
             FROM validators",
        )
        .fetch_all(&self.pool)
        .await?;

        let slash_rows = sqlx::query_as::<_, SlashRow>(
            "SELECT operator_address, amount, reason, block_number, tx_hash, event_timestamp
             FROM slash_events
             ORDER BY event_timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut slashes_by_operator: HashMap<Address, Vec<SlashEvent>> = HashMap::new();
        for row in slash_rows {
            let event = slash_from_row(row)?;
            slashes_by_operator
                .entry(event.operator_address)
                .or_default()
                .push(event);
        }

        let mut records = validator_rows
            .into_iter()
            .map(|row| {
                let validator = validator_from_row(row)?;
                let slashes = slashes_by_operator
                    .remove(&validator.operator_address)
                    .unwrap_or_default();
                Ok(ValidatorRecord { validator, slashes })
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| {
            b.validator
                .total_delegated
                .cmp(&a.validator.total_delegated)
        });
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn rewards_for_address(&self, address: Address) -> Result<RewardsSummary> {
        let rows = sqlx::query_as::<_, RewardRow>(
            "SELECT user_address, validator_address, amount, reward_kind,
                    block_number, tx_hash, event_timestamp
             FROM rewards
             WHERE user_address = $1
             ORDER BY event_timestamp DESC, id DESC",
        )
        .bind(address.to_string())
        .fetch_all(&self.pool)
        .await?;

        let rewards = rows
            .into_iter()
            .map(reward_from_row)
            .collect::<Result<Vec<_>>>()?;

        let mut total = TokenAmount::ZERO;
        let mut breakdowns: HashMap<Address, ValidatorRewardBreakdown> = HashMap::new();
        for reward in &rewards {
            total = total
                .checked_add(reward.amount)
                .ok_or_else(|| Error::internal(format!("reward total overflow for {address}")))?;
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

        let recent = rewards
            .iter()
            .take(RECENT_REWARDS_WINDOW)
            .copied()
            .collect();

        Ok(RewardsSummary {
            total,
            validators,
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::common::{RewardKind, U256};
    use chrono::{DateTime, Duration};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn scratch_persistence(dir: &TempDir) -> Persistence {
        let options = PersistenceOptions {
            path: dir.path().join("test.db"),
            max_connections: 5,
        };
        Persistence::new(&options).await.unwrap()
    }

    fn restaker(seed: u8, amount_wei: u128) -> Restaker {
        Restaker {
            user_address: Address::with_last_byte(seed),
            amount_restaked: U256::from(amount_wei),
            validator_address: Address::with_last_byte(0xa0 + seed),
            strategy_address: Address::with_last_byte(0xa0 + seed),
            block_number: 19_000_000 + u64::from(seed),
            tx_hash: TxHash::with_last_byte(seed),
            timestamp: DateTime::from_timestamp(1_750_000_000 + i64::from(seed), 0).unwrap(),
        }
    }

    fn validator(seed: u8, delegated_wei: u128) -> Validator {
        Validator {
            operator_address: Address::with_last_byte(seed),
            operator_id: format!("0x{:040x}", u128::from(seed)),
            total_delegated: U256::from(delegated_wei),
            status: ValidatorStatus::Active,
            metadata_uri: None,
        }
    }

    fn slash(operator: Address, seconds: i64) -> SlashEvent {
        SlashEvent {
            operator_address: operator,
            amount: U256::from(1_000_000_000_000_000_000u128),
            reason: "double signing".to_string(),
            block_number: 19_100_000,
            tx_hash: TxHash::with_last_byte(0xee),
            timestamp: DateTime::from_timestamp(seconds, 0).unwrap(),
        }
    }

    fn reward(user: Address, validator: Address, amount: U256, seconds: i64) -> Reward {
        Reward {
            user_address: user,
            validator_address: validator,
            amount,
            kind: RewardKind::Restaking,
            block_number: 19_200_000,
            tx_hash: TxHash::with_last_byte(0xcc),
            timestamp: DateTime::from_timestamp(seconds, 0).unwrap(),
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let options = PersistenceOptions {
            path: dir.path().join("test.db"),
            max_connections: 5,
        };
        let first = Persistence::new(&options).await.unwrap();
        first.upsert_restaker(&restaker(1, 100)).await.unwrap();

        // Reopening the same file re-runs migrations without clobbering data.
        let second = Persistence::new(&options).await.unwrap();
        assert_eq!(second.list_restakers().await.unwrap().len(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_upsert_restaker_latest_wins() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        let original = restaker(1, 32_000_000_000_000_000_000);
        persistence.upsert_restaker(&original).await.unwrap();

        // Same key, new state: the write is reported as a duplicate but still
        // takes effect.
        let mut updated = original;
        updated.amount_restaked = U256::from(64_000_000_000_000_000_000u128);
        updated.block_number += 100;
        let err = persistence.upsert_restaker(&updated).await.unwrap_err();
        assert!(err.is_duplicate_key());

        let listed = persistence.list_restakers().await.unwrap();
        assert_eq!(listed, vec![updated]);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_upsert_validator_latest_wins() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        let original = validator(1, 1_000);
        persistence.upsert_validator(&original).await.unwrap();

        let mut updated = original.clone();
        updated.total_delegated = U256::from(2_000u64);
        updated.status = ValidatorStatus::Jailed;
        let err = persistence.upsert_validator(&updated).await.unwrap_err();
        assert!(err.is_duplicate_key());

        let listed = persistence.list_validators().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].validator, updated);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_list_restakers_descending_stake() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        // A nine-digit amount would sort before a short ten-digit amount in
        // string order; the listing must order numerically.
        persistence.upsert_restaker(&restaker(1, 999_999_999)).await.unwrap();
        persistence.upsert_restaker(&restaker(2, 1_000_000_000)).await.unwrap();
        persistence.upsert_restaker(&restaker(3, 5)).await.unwrap();

        let listed = persistence.list_restakers().await.unwrap();
        let amounts: Vec<_> = listed.iter().map(|r| r.amount_restaked).collect();
        assert_eq!(
            amounts,
            vec![
                U256::from(1_000_000_000u64),
                U256::from(999_999_999u64),
                U256::from(5u64)
            ]
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_slash_event_without_parent_validator() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;
        let operator = Address::with_last_byte(7);

        // Slash history may arrive before the validator it belongs to.
        persistence
            .append_slash_event(&slash(operator, 1_750_000_000))
            .await
            .unwrap();
        assert_eq!(persistence.list_validators().await.unwrap(), vec![]);

        // Once the validator shows up, its history is already attached.
        persistence.upsert_validator(&validator(7, 1_000)).await.unwrap();
        let listed = persistence.list_validators().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].slashes.len(), 1);
        assert_eq!(listed[0].slashes[0].operator_address, operator);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_list_validators_joins_slash_history() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        let big = validator(1, 2_000);
        let small = validator(2, 1_000);
        persistence.upsert_validator(&small).await.unwrap();
        persistence.upsert_validator(&big).await.unwrap();

        persistence
            .append_slash_event(&slash(big.operator_address, 1_750_000_000))
            .await
            .unwrap();
        persistence
            .append_slash_event(&slash(big.operator_address, 1_751_000_000))
            .await
            .unwrap();

        let listed = persistence.list_validators().await.unwrap();
        assert_eq!(listed.len(), 2);

        // Descending stake; slash history nested per operator, newest first.
        assert_eq!(listed[0].validator, big);
        assert_eq!(listed[1].validator, small);
        assert_eq!(listed[0].slashes.len(), 2);
        assert!(listed[0].slashes[0].timestamp > listed[0].slashes[1].timestamp);
        assert_eq!(listed[1].slashes, vec![]);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_rewards_aggregation_exact() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;
        let user = Address::with_last_byte(1);
        let validator_a = Address::with_last_byte(0xa1);
        let validator_b = Address::with_last_byte(0xa2);

        // Amounts chosen so that f64 arithmetic would round the +1 away.
        let big: U256 = "1000000000000000000000001".parse().unwrap();
        persistence
            .append_reward(&reward(user, validator_a, big, 1_750_000_000))
            .await
            .unwrap();
        persistence
            .append_reward(&reward(user, validator_a, big, 1_750_086_400))
            .await
            .unwrap();
        persistence
            .append_reward(&reward(user, validator_b, U256::from(3u64), 1_750_172_800))
            .await
            .unwrap();

        let summary = persistence.rewards_for_address(user).await.unwrap();
        assert_eq!(
            summary.total,
            "2000000000000000000000005".parse::<U256>().unwrap()
        );

        assert_eq!(summary.validators.len(), 2);
        assert_eq!(summary.validators[0].validator_address, validator_a);
        assert_eq!(
            summary.validators[0].total,
            "2000000000000000000000002".parse::<U256>().unwrap()
        );
        assert_eq!(summary.validators[0].count, 2);
        assert_eq!(summary.validators[0].earliest.timestamp(), 1_750_000_000);
        assert_eq!(summary.validators[0].latest.timestamp(), 1_750_086_400);
        assert_eq!(summary.validators[1].validator_address, validator_b);
        assert_eq!(summary.validators[1].count, 1);

        // Newest first.
        assert_eq!(summary.recent.len(), 3);
        assert_eq!(summary.recent[0].timestamp.timestamp(), 1_750_172_800);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_rewards_recent_window() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;
        let user = Address::with_last_byte(1);
        let validator_a = Address::with_last_byte(0xa1);

        let base = DateTime::from_timestamp(1_750_000_000, 0).unwrap();
        for i in 0..60i64 {
            let r = reward(
                user,
                validator_a,
                U256::from(1_000_000_000_000_000_000u128),
                (base + Duration::hours(i)).timestamp(),
            );
            persistence.append_reward(&r).await.unwrap();
        }

        let summary = persistence.rewards_for_address(user).await.unwrap();
        // The window caps the row list but not the aggregates.
        assert_eq!(summary.recent.len(), RECENT_REWARDS_WINDOW);
        assert_eq!(summary.validators[0].count, 60);
        assert_eq!(
            summary.total,
            U256::from(60u64) * U256::from(1_000_000_000_000_000_000u128)
        );
        assert_eq!(
            summary.recent[0].timestamp,
            base + Duration::hours(59)
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_rewards_for_unknown_address() {
        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        let summary = persistence
            .rewards_for_address(Address::with_last_byte(0x99))
            .await
            .unwrap();
        assert_eq!(summary.total, U256::ZERO);
        assert_eq!(summary.validators, vec![]);
        assert_eq!(summary.recent, vec![]);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_fallback_dataset_round_trip() {
        use crate::input::subgraph::{fallback_restakers, fallback_validators};

        let dir = TempDir::new().unwrap();
        let persistence = scratch_persistence(&dir).await;

        for r in fallback_restakers() {
            persistence.upsert_restaker(&r).await.unwrap();
        }
        for v in fallback_validators() {
            persistence.upsert_validator(&v).await.unwrap();
        }
        assert_eq!(persistence.list_restakers().await.unwrap().len(), 2);
        assert_eq!(persistence.list_validators().await.unwrap().len(), 2);
    }
}

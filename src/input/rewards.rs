//! Staking rewards and statistics API adapter.
//!
//! Fetches aggregate staking metrics and a recent-rewards series from a REST
//! endpoint. Results are informational: they feed logs, health reports and
//! metrics gauges, and are never persisted. Like the subgraph adapter, every
//! fetch fails soft, degrading to fixed synthetic data marked as fallback.

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use reqwest::Url;
use serde::Deserialize;
use tracing::instrument;

use crate::{
    Error, Result,
    error::ensure,
    input::{SourceBatch, SourceValue},
    types::{
        common::{TokenAmount, U256},
        staking::{RewardStat, StakingMetrics},
    },
};

/// Fixed timeout for rewards API requests. Deliberately short: this source is
/// informational and must not stall a refresh cycle.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How many recent reward events to request per cycle.
pub const RECENT_REWARDS_LIMIT: usize = 100;

/// Length of the synthetic reward series served when the API is unreachable.
pub const FALLBACK_SERIES_DAYS: u64 = 7;

/// Configuration for the staking rewards API client.
#[derive(Clone, Debug, Parser)]
pub struct RewardsApiOptions {
    /// Base URL of the staking statistics API.
    #[clap(
        long = "rewards-url",
        env = "RESTAKING_SERVICE_REWARDS_URL",
        default_value = "https://eth-api.lido.fi/v1"
    )]
    pub url: Url,
}

/// `GET /metrics` response. Amounts come over the wire as decimal strings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub total_pooled: String,
    pub total_shares: String,
    pub buffer: String,
    pub apr: f64,
}

/// One entry of the `GET /rewards` response.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardStatEntry {
    pub amount: String,
    pub apr: f64,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RewardsResponse {
    rewards: Vec<RewardStatEntry>,
}

/// Interface for querying the staking rewards API.
pub trait StatsClient: Clone + Send + Sync {
    fn metrics(&self) -> impl Send + Future<Output = Result<MetricsResponse>>;

    fn recent_rewards(
        &self,
        limit: usize,
    ) -> impl Send + Future<Output = Result<Vec<RewardStatEntry>>>;
}

/// Rewards API client over plain HTTP.
#[derive(Clone, Debug)]
pub struct HttpStatsClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpStatsClient {
    pub fn new(options: &RewardsApiOptions) -> Self {
        Self {
            client: reqwest::ClientBuilder::new()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap(),
            base: options.url.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base.as_str().trim_end_matches('/'))
    }
}

impl StatsClient for HttpStatsClient {
    async fn metrics(&self) -> Result<MetricsResponse> {
        let response = self.client.get(self.endpoint("metrics")).send().await?;
        ensure!(
            response.status().is_success(),
            Error::transport(format!("metrics endpoint returned {}", response.status()))
        );
        response
            .json()
            .await
            .map_err(|err| Error::transport(format!("malformed metrics response: {err}")))
    }

    async fn recent_rewards(&self, limit: usize) -> Result<Vec<RewardStatEntry>> {
        let url = format!("{}?limit={limit}", self.endpoint("rewards"));
        let response = self.client.get(url).send().await?;
        ensure!(
            response.status().is_success(),
            Error::transport(format!("rewards endpoint returned {}", response.status()))
        );
        let body: RewardsResponse = response
            .json()
            .await
            .map_err(|err| Error::transport(format!("malformed rewards response: {err}")))?;
        Ok(body.rewards)
    }
}

/// Fetch-and-normalize layer over a [`StatsClient`].
#[derive(Clone, Debug)]
pub struct StatsAdapter<C> {
    client: C,
}

impl<C: StatsClient> StatsAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Fetch aggregate staking metrics.
    #[instrument(skip(self))]
    pub async fn fetch_metrics(&self) -> SourceValue<StakingMetrics> {
        match self.try_fetch_metrics().await {
            Ok(metrics) => SourceValue::live(metrics),
            Err(err) => {
                tracing::warn!("rewards API metrics fetch failed, serving fallback: {err}");
                SourceValue::fallback(fallback_metrics())
            }
        }
    }

    /// Fetch the recent-rewards series.
    #[instrument(skip(self))]
    pub async fn fetch_recent_rewards(&self, limit: usize) -> SourceBatch<RewardStat> {
        match self.try_fetch_recent_rewards(limit).await {
            Ok(series) => SourceBatch::live(series),
            Err(err) => {
                tracing::warn!("rewards API series fetch failed, serving synthetic series: {err}");
                SourceBatch::fallback(synthetic_reward_series(Utc::now()))
            }
        }
    }

    async fn try_fetch_metrics(&self) -> Result<StakingMetrics> {
        let raw = self.client.metrics().await?;
        metrics_from_response(&raw)
    }

    async fn try_fetch_recent_rewards(&self, limit: usize) -> Result<Vec<RewardStat>> {
        let raw = self.client.recent_rewards(limit).await?;
        raw.iter().map(reward_stat_from_entry).collect()
    }
}

pub fn metrics_from_response(raw: &MetricsResponse) -> Result<StakingMetrics> {
    Ok(StakingMetrics {
        total_pooled: parse_amount("totalPooled", &raw.total_pooled)?,
        total_shares: parse_amount("totalShares", &raw.total_shares)?,
        buffer: parse_amount("buffer", &raw.buffer)?,
        apr: raw.apr,
    })
}

pub fn reward_stat_from_entry(entry: &RewardStatEntry) -> Result<RewardStat> {
    let timestamp = DateTime::from_timestamp(entry.timestamp, 0)
        .ok_or_else(|| Error::transport(format!("timestamp {} out of range", entry.timestamp)))?;
    Ok(RewardStat {
        amount: parse_amount("amount", &entry.amount)?,
        apr: entry.apr,
        timestamp,
    })
}

fn parse_amount(field: &str, raw: &str) -> Result<TokenAmount> {
    raw.parse()
        .map_err(|err| Error::transport(format!("malformed {field} amount {raw:?}: {err}")))
}

/// The fixed metrics object served when the rewards API is unreachable.
pub fn fallback_metrics() -> StakingMetrics {
    StakingMetrics {
        total_pooled: U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(18u64)),
        total_shares: U256::from(950_000u64) * U256::from(10u64).pow(U256::from(18u64)),
        buffer: U256::from(5_000u64) * U256::from(10u64).pow(U256::from(18u64)),
        apr: 3.9,
    }
}

/// Deterministic synthetic reward series: one entry per day over the last
/// [`FALLBACK_SERIES_DAYS`] days, newest first, with pseudo-random amount and
/// APR derived from the day index alone.
///
/// For demo and observability purposes only; callers always receive it marked
/// as fallback.
pub fn synthetic_reward_series(now: DateTime<Utc>) -> Vec<RewardStat> {
    (0..FALLBACK_SERIES_DAYS)
        .map(|day| {
            let noise = scramble(day + 1);
            // Between 0.1 and 1.1 tokens.
            let amount = U256::from(100_000_000_000_000_000u128)
                + U256::from(noise % 1_000_000_000_000_000_000u64);
            // Between 3.0% and 5.0%.
            let apr = 3.0 + (scramble(noise) % 2_000) as f64 / 1_000.0;
            RewardStat {
                amount,
                apr,
                timestamp: now - chrono::Duration::days(day as i64),
            }
        })
        .collect()
}

/// xorshift64 scramble; enough mixing for demo data.
fn scramble(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::input::testing::MockStatsClient;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metrics_normalization() {
        let raw = MetricsResponse {
            total_pooled: "9000000000000000000000000".into(),
            total_shares: "8500000000000000000000000".into(),
            buffer: "12000000000000000000".into(),
            apr: 3.2,
        };
        let metrics = metrics_from_response(&raw).unwrap();
        assert_eq!(
            metrics.total_pooled,
            "9000000000000000000000000".parse::<U256>().unwrap()
        );
        assert_eq!(metrics.apr, 3.2);
    }

    #[test]
    fn test_metrics_normalization_malformed() {
        let raw = MetricsResponse {
            total_pooled: "12.5".into(),
            total_shares: "0".into(),
            buffer: "0".into(),
            apr: 0.0,
        };
        let err = metrics_from_response(&raw).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn test_synthetic_series_is_deterministic() {
        let now = DateTime::from_timestamp(1_754_000_000, 0).unwrap();
        let first = synthetic_reward_series(now);
        let second = synthetic_reward_series(now);
        assert_eq!(first, second);
        assert_eq!(first.len(), FALLBACK_SERIES_DAYS as usize);

        // Newest first, one entry per day.
        assert_eq!(first[0].timestamp, now);
        assert_eq!(first[6].timestamp, now - chrono::Duration::days(6));
        for stat in &first {
            assert!(stat.amount >= U256::from(100_000_000_000_000_000u128));
            assert!((3.0..5.0).contains(&stat.apr));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_live() {
        let client = MockStatsClient::with_defaults();
        let adapter = StatsAdapter::new(client);

        let metrics = adapter.fetch_metrics().await;
        assert!(!metrics.fallback);

        let series = adapter.fetch_recent_rewards(RECENT_REWARDS_LIMIT).await;
        assert!(!series.fallback);
        assert_eq!(series.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_fallback_on_transport_failure() {
        let client = MockStatsClient::with_defaults();
        client.fail();
        let adapter = StatsAdapter::new(client);

        let metrics = adapter.fetch_metrics().await;
        assert!(metrics.fallback);
        assert_eq!(metrics.value, fallback_metrics());

        let series = adapter.fetch_recent_rewards(RECENT_REWARDS_LIMIT).await;
        assert!(series.fallback);
        assert_eq!(series.len(), FALLBACK_SERIES_DAYS as usize);
    }
}

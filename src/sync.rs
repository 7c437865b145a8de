//! Fetch orchestration: one refresh cycle across all upstream sources.
//!
//! A cycle launches one fetch-and-persist task per source jointly and lets
//! every task settle regardless of the others' outcomes. Adapter failures
//! never reach this layer (the adapters degrade to fallback data); the only
//! failures visible here are store write failures, which are counted per
//! batch and never abort a cycle.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use futures::join;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    input::{
        RewardSource, SourceBatch, SourceValue,
        rewards::{RECENT_REWARDS_LIMIT, StatsAdapter, StatsClient},
        subgraph::{SubgraphAdapter, SubgraphClient},
    },
    metrics::PrometheusMetrics,
    persistence::StakingPersistence,
    simulator::SimulatedRewardSource,
    types::staking::StakingMetrics,
};

/// Outcome of one source within a refresh cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceReport {
    /// Whether the source delivered live data and every write landed.
    pub success: bool,
    /// Whether the batch came from the source's fallback dataset.
    pub fallback: bool,
    /// Rows newly inserted into the store.
    pub inserted: usize,
    /// Store write failures. Swallowed duplicates count as neither an insert
    /// nor an error.
    pub errors: usize,
}

/// Structured result of one refresh cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CycleSummary {
    pub restakers: SourceReport,
    pub validators: SourceReport,
    pub rewards: SourceReport,
    pub slashes: SourceReport,

    /// Wall-clock duration of the whole cycle.
    pub duration: Duration,
}

/// Per-source health probe results.
///
/// A source is healthy only if its primary fetch succeeded without falling
/// back to synthetic data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthReport {
    pub subgraph: bool,
    pub rewards_api: bool,
}

/// The interface the scheduler (and read surface) drives.
pub trait CycleRunner: Send + Sync + 'static {
    /// Run one refresh cycle, or return [`None`] immediately if a cycle is
    /// already in flight. The skip is silent by design: triggers are dropped,
    /// never queued.
    fn run_cycle(&self) -> impl Send + Future<Output = Option<CycleSummary>>;

    /// Probe each upstream source once, without persisting anything.
    fn health_check(&self) -> impl Send + Future<Output = HealthReport>;
}

/// Coordinates fetching from all upstream sources and writing through to the
/// store.
///
/// Owns no data across cycles; the in-flight flag is the only state, and it is
/// the mutual-exclusion gate between the scheduler's timers, the deferred
/// initial refresh and manual triggers.
#[derive(Debug)]
pub struct Orchestrator<S, G, R, W> {
    store: S,
    subgraph: SubgraphAdapter<G>,
    stats: StatsAdapter<R>,
    reward_source: W,
    metrics: Arc<PrometheusMetrics>,
    in_flight: AtomicBool,
}

impl<S, G, R> Orchestrator<S, G, R, SimulatedRewardSource<G>>
where
    S: StakingPersistence,
    G: SubgraphClient,
    R: StatsClient,
{
    /// An orchestrator whose rewards are derived by the simulator, the
    /// default until a live rewards feed exists.
    pub fn new(
        store: S,
        subgraph: SubgraphAdapter<G>,
        stats: StatsAdapter<R>,
        metrics: Arc<PrometheusMetrics>,
    ) -> Self {
        let reward_source = SimulatedRewardSource::new(subgraph.clone());
        Self::with_reward_source(store, subgraph, stats, reward_source, metrics)
    }
}

impl<S, G, R, W> Orchestrator<S, G, R, W>
where
    S: StakingPersistence,
    G: SubgraphClient,
    R: StatsClient,
    W: RewardSource,
{
    pub fn with_reward_source(
        store: S,
        subgraph: SubgraphAdapter<G>,
        stats: StatsAdapter<R>,
        reward_source: W,
        metrics: Arc<PrometheusMetrics>,
    ) -> Self {
        Self {
            store,
            subgraph,
            stats,
            reward_source,
            metrics,
            in_flight: AtomicBool::new(false),
        }
    }

    async fn sync_restakers(&self) -> SourceReport {
        let batch = self.subgraph.fetch_restakers().await;
        let mut report = report_for(&batch);
        for restaker in &batch.records {
            match self.store.upsert_restaker(restaker).await {
                Ok(()) => report.inserted += 1,
                Err(err) if err.is_duplicate_key() => {
                    tracing::debug!(user = %restaker.user_address, "restaker refreshed: {err}");
                }
                Err(err) => {
                    tracing::warn!(user = %restaker.user_address, "failed to persist restaker: {err}");
                    report.errors += 1;
                }
            }
        }
        finalize(report)
    }

    async fn sync_validators(&self) -> SourceReport {
        let batch = self.subgraph.fetch_validators().await;
        let mut report = report_for(&batch);
        for validator in &batch.records {
            match self.store.upsert_validator(validator).await {
                Ok(()) => report.inserted += 1,
                Err(err) if err.is_duplicate_key() => {
                    tracing::debug!(operator = %validator.operator_address, "validator refreshed: {err}");
                }
                Err(err) => {
                    tracing::warn!(operator = %validator.operator_address, "failed to persist validator: {err}");
                    report.errors += 1;
                }
            }
        }
        finalize(report)
    }

    async fn sync_rewards(&self) -> SourceReport {
        let batch = self.reward_source.fetch_rewards().await;
        let mut report = report_for(&batch);
        for reward in &batch.records {
            match self.store.append_reward(reward).await {
                Ok(()) => report.inserted += 1,
                Err(err) => {
                    tracing::warn!(user = %reward.user_address, "failed to persist reward: {err}");
                    report.errors += 1;
                }
            }
        }
        finalize(report)
    }

    async fn sync_slashes(&self) -> SourceReport {
        let batch = self.subgraph.fetch_slash_events().await;
        let mut report = report_for(&batch);
        for event in &batch.records {
            match self.store.append_slash_event(event).await {
                Ok(()) => report.inserted += 1,
                Err(err) => {
                    tracing::warn!(operator = %event.operator_address, "failed to persist slash event: {err}");
                    report.errors += 1;
                }
            }
        }
        finalize(report)
    }

    /// Informational staking statistics. Fetched alongside the persisted
    /// sources for observability; never written to the store.
    async fn fetch_stats(&self) -> SourceValue<StakingMetrics> {
        let (metrics, series) = join!(
            self.stats.fetch_metrics(),
            self.stats.fetch_recent_rewards(RECENT_REWARDS_LIMIT),
        );
        tracing::info!(
            fallback = metrics.fallback,
            apr = metrics.value.apr,
            recent_rewards = series.len(),
            "staking statistics"
        );
        metrics
    }
}

fn report_for<T>(batch: &SourceBatch<T>) -> SourceReport {
    SourceReport {
        fallback: batch.fallback,
        ..Default::default()
    }
}

fn finalize(mut report: SourceReport) -> SourceReport {
    report.success = !report.fallback && report.errors == 0;
    report
}

/// Clears the in-flight flag when the cycle ends, even if a task panics.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S, G, R, W> CycleRunner for Orchestrator<S, G, R, W>
where
    S: StakingPersistence + 'static,
    G: SubgraphClient + 'static,
    R: StatsClient + 'static,
    W: RewardSource + 'static,
{
    #[instrument(skip(self))]
    async fn run_cycle(&self) -> Option<CycleSummary> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("refresh cycle already in flight, skipping");
            return None;
        }
        let _guard = InFlightGuard(&self.in_flight);

        tracing::info!("starting refresh cycle");
        let start = Instant::now();
        let (restakers, validators, rewards, slashes, _stats) = join!(
            self.sync_restakers(),
            self.sync_validators(),
            self.sync_rewards(),
            self.sync_slashes(),
            self.fetch_stats(),
        );
        let summary = CycleSummary {
            restakers,
            validators,
            rewards,
            slashes,
            duration: start.elapsed(),
        };
        self.metrics.record_cycle(&summary);
        tracing::info!(?summary, "refresh cycle complete");
        Some(summary)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> HealthReport {
        let (restakers, metrics) = join!(
            self.subgraph.fetch_restakers(),
            self.stats.fetch_metrics(),
        );
        HealthReport {
            subgraph: !restakers.fallback,
            rewards_api: !metrics.fallback,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use crate::{
        input::testing::{MockStatsClient, MockSubgraphClient, deposit_entry, operator_entry},
        persistence::testing::MemoryStore,
        simulator::SIMULATION_PERIODS,
    };
    use pretty_assertions::assert_eq;

    type TestOrchestrator = Orchestrator<
        MemoryStore,
        MockSubgraphClient,
        MockStatsClient,
        SimulatedRewardSource<MockSubgraphClient>,
    >;

    fn orchestrator(
        store: MemoryStore,
        subgraph: MockSubgraphClient,
        stats: MockStatsClient,
    ) -> TestOrchestrator {
        Orchestrator::new(
            store,
            SubgraphAdapter::new(subgraph),
            StatsAdapter::new(stats),
            Arc::new(PrometheusMetrics::new()),
        )
    }

    fn live_subgraph() -> MockSubgraphClient {
        MockSubgraphClient::new(
            vec![deposit_entry(1), deposit_entry(2)],
            vec![operator_entry(1), operator_entry(2)],
        )
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_cycle_persists_all_sources() {
        let store = MemoryStore::new();
        let orchestrator = orchestrator(store.clone(), live_subgraph(), MockStatsClient::with_defaults());

        let summary = orchestrator.run_cycle().await.unwrap();

        assert_eq!(summary.restakers.inserted, 2);
        assert!(summary.restakers.success);
        assert!(!summary.restakers.fallback);
        assert_eq!(summary.validators.inserted, 2);
        // One simulated reward batch per restaker.
        assert_eq!(
            summary.rewards.inserted,
            2 * SIMULATION_PERIODS as usize
        );
        assert_eq!(summary.slashes.inserted, 0);
        assert!(summary.slashes.success);

        assert_eq!(store.restaker_count().await, 2);
        assert_eq!(store.validator_count().await, 2);
        assert_eq!(store.reward_count().await, 2 * SIMULATION_PERIODS as usize);
        assert_eq!(store.slash_count().await, 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_second_cycle_is_idempotent_for_keyed_rows() {
        let store = MemoryStore::new();
        let orchestrator = orchestrator(store.clone(), live_subgraph(), MockStatsClient::with_defaults());

        orchestrator.run_cycle().await.unwrap();
        let second = orchestrator.run_cycle().await.unwrap();

        // Unchanged upstream data: every keyed write is a swallowed duplicate,
        // zero errors, zero net new rows.
        assert_eq!(second.restakers.inserted, 0);
        assert_eq!(second.restakers.errors, 0);
        assert!(second.restakers.success);
        assert_eq!(second.validators.inserted, 0);
        assert_eq!(second.validators.errors, 0);
        assert_eq!(store.restaker_count().await, 2);
        assert_eq!(store.validator_count().await, 2);

        // Rewards are append-only and re-derived each cycle.
        assert_eq!(store.reward_count().await, 4 * SIMULATION_PERIODS as usize);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_concurrent_cycles_one_runs() {
        let store = MemoryStore::new();
        store.set_write_delay(Duration::from_millis(10)).await;
        let orchestrator =
            orchestrator(store.clone(), live_subgraph(), MockStatsClient::with_defaults());

        let (first, second) = join!(orchestrator.run_cycle(), async {
            // Give the first cycle a head start so it owns the gate.
            tokio::time::sleep(Duration::from_millis(10)).await;
            orchestrator.run_cycle().await
        });

        // Exactly one cycle ran; the other was dropped without touching the
        // store.
        assert_eq!(first.is_some() as usize + second.is_some() as usize, 1);
        let singles = 2 + 2 + 2 * SIMULATION_PERIODS as usize;
        assert_eq!(store.write_count(), singles);

        // The gate is released afterwards.
        assert!(orchestrator.run_cycle().await.is_some());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_store_failures_counted_not_fatal() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let orchestrator = orchestrator(store.clone(), live_subgraph(), MockStatsClient::with_defaults());

        let summary = orchestrator.run_cycle().await.unwrap();

        assert_eq!(summary.restakers.errors, 2);
        assert_eq!(summary.restakers.inserted, 0);
        assert!(!summary.restakers.success);
        assert_eq!(summary.validators.errors, 2);
        assert_eq!(summary.rewards.errors, 2 * SIMULATION_PERIODS as usize);
        assert_eq!(store.restaker_count().await, 0);

        // The cycle completed and the gate is free again.
        store.fail_writes(false);
        let summary = orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.restakers.inserted, 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_fallback_batches_are_marked_and_persisted() {
        let store = MemoryStore::new();
        let subgraph = MockSubgraphClient::default();
        subgraph.fail();
        let orchestrator = orchestrator(store.clone(), subgraph, MockStatsClient::with_defaults());

        let summary = orchestrator.run_cycle().await.unwrap();

        // The fixed fallback dataset is persisted, but the condition is
        // visible in the report.
        assert!(summary.restakers.fallback);
        assert!(!summary.restakers.success);
        assert_eq!(summary.restakers.inserted, 2);
        assert_eq!(summary.restakers.errors, 0);
        assert!(summary.rewards.fallback);
        assert_eq!(store.restaker_count().await, 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_source_isolation() {
        let store = MemoryStore::new();
        let subgraph = live_subgraph();
        let stats = MockStatsClient::with_defaults();
        stats.fail();
        let orchestrator = orchestrator(store.clone(), subgraph, stats);

        // A failing stats source has no effect on the persisted sources.
        let summary = orchestrator.run_cycle().await.unwrap();
        assert!(summary.restakers.success);
        assert!(summary.validators.success);
        assert_eq!(store.restaker_count().await, 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_health_check() {
        let subgraph = live_subgraph();
        let stats = MockStatsClient::with_defaults();
        let orchestrator = orchestrator(MemoryStore::new(), subgraph.clone(), stats.clone());

        assert_eq!(
            orchestrator.health_check().await,
            HealthReport {
                subgraph: true,
                rewards_api: true
            }
        );

        subgraph.fail();
        assert_eq!(
            orchestrator.health_check().await,
            HealthReport {
                subgraph: false,
                rewards_api: true
            }
        );

        stats.fail();
        subgraph.restore();
        assert_eq!(
            orchestrator.health_check().await,
            HealthReport {
                subgraph: true,
                rewards_api: false
            }
        );

        // Probing writes nothing.
        assert_eq!(orchestrator.store.restaker_count().await, 0);
    }
}

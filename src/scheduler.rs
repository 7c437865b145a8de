//! Refresh scheduling and service lifecycle.
//!
//! One scheduler instance owns all of its timer state explicitly, so multiple
//! independent instances can coexist (and be tested) in one process. Two
//! timers run while the scheduler is up: the configurable main refresh timer
//! and a fixed-cadence health probe. Both evaluate their cron schedules in
//! UTC, so schedule semantics do not depend on the host locale.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use clap::Parser;
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    Error, Result,
    error::ensure,
    sync::{CycleRunner, CycleSummary},
};

/// Cadence of the health probe timer: every 5 minutes.
///
/// Fixed by design, not configurable: health probes are cheap, and a constant
/// cadence keeps the signal comparable across deployments.
pub const HEALTH_CADENCE: &str = "0 */5 * * * *";

/// Default cadence of the main refresh timer: every 30 minutes.
pub const DEFAULT_REFRESH_CADENCE: &str = "0 */30 * * * *";

/// Delay before the one-shot initial refresh fired right after start, so the
/// store is populated without waiting for the first interval to elapse.
pub const INITIAL_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the scheduler.
#[derive(Clone, Debug, Parser)]
pub struct SchedulerOptions {
    /// Cron expression (seconds field first) for the main refresh timer,
    /// evaluated in UTC.
    #[clap(
        long,
        env = "RESTAKING_SERVICE_REFRESH_CADENCE",
        default_value = DEFAULT_REFRESH_CADENCE
    )]
    pub refresh_cadence: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            refresh_cadence: DEFAULT_REFRESH_CADENCE.to_string(),
        }
    }
}

/// Snapshot of the scheduler's lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_timers: Vec<String>,
    pub cadence: String,
}

/// Drives the orchestrator on a timer.
#[derive(Debug)]
pub struct Scheduler<R: CycleRunner> {
    orchestrator: Arc<R>,
    health_schedule: Schedule,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    running: bool,
    cadence: String,
    schedule: Schedule,
    refresh_timer: Option<JoinHandle<()>>,
    health_timer: Option<JoinHandle<()>>,
    initial_refresh: Option<JoinHandle<()>>,
}

impl<R: CycleRunner> Scheduler<R> {
    /// A stopped scheduler with the given refresh cadence.
    ///
    /// Fails with [`InvalidArgument`](Error::InvalidArgument) if the cadence
    /// expression does not parse.
    pub fn new(orchestrator: Arc<R>, options: &SchedulerOptions) -> Result<Self> {
        let schedule = parse_cadence(&options.refresh_cadence)?;
        let health_schedule = parse_cadence(HEALTH_CADENCE)?;
        Ok(Self {
            orchestrator,
            health_schedule,
            state: Mutex::new(State {
                running: false,
                cadence: options.refresh_cadence.clone(),
                schedule,
                refresh_timer: None,
                health_timer: None,
                initial_refresh: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start both timers and schedule the deferred initial refresh.
    ///
    /// A no-op (with a warning) when already running; double starts never
    /// duplicate timers.
    pub fn start(&self) {
        let mut state = self.state();
        if state.running {
            tracing::warn!("scheduler already running");
            return;
        }
        state.refresh_timer = Some(self.spawn_refresh_timer(state.schedule.clone()));
        state.health_timer = Some(self.spawn_health_timer());
        state.initial_refresh = Some(self.spawn_initial_refresh());
        state.running = true;
        tracing::info!(cadence = %state.cadence, "scheduler started");
    }

    /// Cancel all timers.
    ///
    /// A no-op (with a warning) when not running. Never blocks, so it is safe
    /// to call from a termination signal path.
    pub fn stop(&self) {
        let mut state = self.state();
        if !state.running {
            tracing::warn!("scheduler is not running");
            return;
        }
        for timer in [
            state.refresh_timer.take(),
            state.health_timer.take(),
            state.initial_refresh.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        state.running = false;
        tracing::info!("scheduler stopped");
    }

    /// Run a refresh cycle on demand.
    ///
    /// Fails with [`InvalidState`](Error::InvalidState) when the scheduler is
    /// stopped. Returns [`None`] if a cycle was already in flight (the trigger
    /// is dropped, matching the timer behavior).
    pub async fn trigger_refresh(&self) -> Result<Option<CycleSummary>> {
        ensure!(
            self.state().running,
            Error::invalid_state("scheduler is not running")
        );
        Ok(self.orchestrator.run_cycle().await)
    }

    /// Replace the main refresh cadence.
    ///
    /// Fails with [`InvalidArgument`](Error::InvalidArgument) if the
    /// expression does not parse. When running, the replacement timer is
    /// spawned before the old one is aborted, so there is never a window with
    /// zero active refresh timers; an overlapping tick in that window is
    /// absorbed by the orchestrator's admission gate.
    pub fn update_interval(&self, cadence: &str) -> Result<()> {
        let schedule = parse_cadence(cadence)?;
        let mut state = self.state();
        if state.running {
            let replacement = self.spawn_refresh_timer(schedule.clone());
            if let Some(old) = state.refresh_timer.replace(replacement) {
                old.abort();
            }
        }
        state.schedule = schedule;
        state.cadence = cadence.to_string();
        tracing::info!(%cadence, "refresh cadence updated");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state();
        let mut active_timers = Vec::new();
        if state.refresh_timer.is_some() {
            active_timers.push("refresh".to_string());
        }
        if state.health_timer.is_some() {
            active_timers.push("health".to_string());
        }
        SchedulerStatus {
            running: state.running,
            active_timers,
            cadence: state.cadence.clone(),
        }
    }

    fn spawn_refresh_timer(&self, schedule: Schedule) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            loop {
                let Some(wait) = time_until_next(&schedule) else {
                    tracing::warn!("refresh schedule has no future fire times, timer exiting");
                    break;
                };
                sleep(wait).await;
                if orchestrator.run_cycle().await.is_none() {
                    tracing::info!("scheduled refresh skipped, cycle already in flight");
                }
            }
        })
    }

    fn spawn_health_timer(&self) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let schedule = self.health_schedule.clone();
        tokio::spawn(async move {
            loop {
                let Some(wait) = time_until_next(&schedule) else {
                    tracing::warn!("health schedule has no future fire times, timer exiting");
                    break;
                };
                sleep(wait).await;
                let report = orchestrator.health_check().await;
                if report.subgraph && report.rewards_api {
                    tracing::debug!(?report, "health check passed");
                } else {
                    tracing::warn!(?report, "upstream source unhealthy");
                }
            }
        })
    }

    fn spawn_initial_refresh(&self) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            sleep(INITIAL_REFRESH_DELAY).await;
            tracing::info!("running initial refresh");
            orchestrator.run_cycle().await;
        })
    }
}

impl<R: CycleRunner> Drop for Scheduler<R> {
    fn drop(&mut self) {
        let mut state = self.state();
        for timer in [
            state.refresh_timer.take(),
            state.health_timer.take(),
            state.initial_refresh.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

fn parse_cadence(cadence: &str) -> Result<Schedule> {
    Schedule::from_str(cadence).map_err(|err| {
        Error::invalid_argument(format!("invalid cadence expression {cadence:?}: {err}"))
    })
}

/// Time from now until the schedule's next fire, in UTC.
fn time_until_next(schedule: &Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::sync::HealthReport;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    /// A cycle runner that only counts invocations.
    #[derive(Debug, Default)]
    struct MockRunner {
        cycles: AtomicUsize,
        probes: AtomicUsize,
    }

    impl MockRunner {
        fn cycles(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
        }
    }

    impl CycleRunner for MockRunner {
        async fn run_cycle(&self) -> Option<CycleSummary> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Some(CycleSummary::default())
        }

        async fn health_check(&self) -> HealthReport {
            self.probes.fetch_add(1, Ordering::SeqCst);
            HealthReport {
                subgraph: true,
                rewards_api: true,
            }
        }
    }

    fn scheduler(options: &SchedulerOptions) -> (Arc<MockRunner>, Scheduler<MockRunner>) {
        let runner = Arc::new(MockRunner::default());
        let scheduler = Scheduler::new(runner.clone(), options).unwrap();
        (runner, scheduler)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_lifecycle() {
        let (_, scheduler) = scheduler(&SchedulerOptions::default());

        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.active_timers, Vec::<String>::new());
        assert_eq!(status.cadence, DEFAULT_REFRESH_CADENCE);

        scheduler.start();
        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.active_timers, vec!["refresh", "health"]);

        // Double start does not duplicate timers.
        scheduler.start();
        assert_eq!(scheduler.status().active_timers, vec!["refresh", "health"]);

        scheduler.stop();
        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.active_timers, Vec::<String>::new());

        // Double stop is a warning, not an error.
        scheduler.stop();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_trigger_requires_running() {
        let (runner, scheduler) = scheduler(&SchedulerOptions::default());

        let err = scheduler.trigger_refresh().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(runner.cycles(), 0);

        scheduler.start();
        assert!(scheduler.trigger_refresh().await.unwrap().is_some());
        assert_eq!(runner.cycles(), 1);

        scheduler.stop();
        scheduler.trigger_refresh().await.unwrap_err();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_update_interval_validates() {
        let (_, scheduler) = scheduler(&SchedulerOptions::default());

        let err = scheduler.update_interval("every thirty minutes").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(scheduler.status().cadence, DEFAULT_REFRESH_CADENCE);

        scheduler.update_interval("0 */10 * * * *").unwrap();
        assert_eq!(scheduler.status().cadence, "0 */10 * * * *");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_update_interval_while_running_swaps_timer() {
        let (_, scheduler) = scheduler(&SchedulerOptions::default());
        scheduler.start();

        scheduler.update_interval("0 */10 * * * *").unwrap();
        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.active_timers, vec!["refresh", "health"]);
        assert_eq!(status.cadence, "0 */10 * * * *");

        scheduler.stop();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_invalid_cadence_at_construction() {
        let runner = Arc::new(MockRunner::default());
        let err = Scheduler::new(
            runner,
            &SchedulerOptions {
                refresh_cadence: "not a cron line".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_refresh_timer_fires() {
        // An every-second cadence; a few seconds of waiting must produce at
        // least one scheduled cycle.
        let (runner, scheduler) = scheduler(&SchedulerOptions {
            refresh_cadence: "* * * * * *".to_string(),
        });
        scheduler.start();

        sleep(Duration::from_millis(2500)).await;
        assert!(runner.cycles() >= 1, "no scheduled cycle fired");

        scheduler.stop();
        let after_stop = runner.cycles();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(runner.cycles(), after_stop, "timer kept firing after stop");
    }
}

use std::{process::exit, sync::Arc};

use clap::Parser;
use restaking_data_service::{
    Result, app,
    input::{
        rewards::{HttpStatsClient, RewardsApiOptions, StatsAdapter},
        subgraph::{HttpSubgraphClient, SubgraphAdapter, SubgraphOptions},
    },
    metrics::PrometheusMetrics,
    persistence::sql,
    scheduler::{Scheduler, SchedulerOptions},
    sync::Orchestrator,
};
use tracing_subscriber::EnvFilter;

/// The backend data service for the restaking dashboard.
#[derive(Debug, Parser)]
struct Options {
    /// Restaking subgraph options.
    #[clap(flatten)]
    subgraph: SubgraphOptions,

    /// Staking rewards API options.
    #[clap(flatten)]
    rewards: RewardsApiOptions,

    /// Persistent storage options.
    #[clap(flatten)]
    persistence: sql::PersistenceOptions,

    /// Refresh scheduling options.
    #[clap(flatten)]
    scheduler: SchedulerOptions,

    /// Port for the HTTP read API.
    #[clap(long, env = "RESTAKING_SERVICE_PORT", default_value = "8080")]
    port: u16,
}

impl Options {
    async fn run(self) -> Result<()> {
        let storage = sql::Persistence::new(&self.persistence).await?;
        let subgraph = SubgraphAdapter::new(HttpSubgraphClient::new(&self.subgraph));
        let stats = StatsAdapter::new(HttpStatsClient::new(&self.rewards));
        let metrics = Arc::new(PrometheusMetrics::new());

        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            subgraph,
            stats,
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(orchestrator.clone(), &self.scheduler)?);
        scheduler.start();

        let state = app::State::new(storage, orchestrator, scheduler.clone(), metrics);
        let server = tokio::spawn(state.serve(self.port));

        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {err}");
        }
        tracing::info!("shutting down");
        scheduler.stop();
        server.abort();
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Options::parse();
    if let Err(err) = opt.run().await {
        eprintln!("service failed: {err:#}");
        exit(1);
    }
}

//! HTTP server application for the restaking data service.
//!
//! A thin read surface over the store and scheduler: rows are served as
//! stored, and fetch failures never affect reads beyond staleness.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tide_disco::method::ReadState;
use tide_disco::{Api, App, api::ApiError};
use vbs::version::{StaticVersion, StaticVersionType};

use crate::{
    error::{Error, Result},
    metrics::PrometheusMetrics,
    persistence::StakingPersistence,
    scheduler::Scheduler,
    sync::CycleRunner,
};

type Version = StaticVersion<0, 1>;

/// HTTP server state.
#[derive(Debug)]
pub struct State<S, R: CycleRunner> {
    store: S,
    runner: Arc<R>,
    scheduler: Arc<Scheduler<R>>,
    metrics: Arc<PrometheusMetrics>,
}

impl<S: Clone, R: CycleRunner> Clone for State<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            runner: self.runner.clone(),
            scheduler: self.scheduler.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S, R: CycleRunner> State<S, R> {
    /// Set up an app with the given state.
    pub fn new(
        store: S,
        runner: Arc<R>,
        scheduler: Arc<Scheduler<R>>,
        metrics: Arc<PrometheusMetrics>,
    ) -> Self {
        Self {
            store,
            runner,
            scheduler,
            metrics,
        }
    }
}

#[async_trait]
impl<S, R> ReadState for State<S, R>
where
    S: Send + Sync + 'static,
    R: CycleRunner,
{
    type State = Self;

    async fn read<T>(
        &self,
        op: impl Send + for<'a> FnOnce(&'a Self::State) -> BoxFuture<'a, T> + 'async_trait,
    ) -> T {
        op(self).await
    }
}

impl<S, R> State<S, R>
where
    S: StakingPersistence + 'static,
    R: CycleRunner,
{
    /// Run the app.
    ///
    /// Unless there is some catastrophic error, this future will never
    /// resolve. It is best spawned as a background task, or awaited as the
    /// main task of the process.
    pub async fn serve(self, port: u16) -> Result<()> {
        let mut app = App::<_, Error>::with_state(self);

        {
            let mut api = app
                .module::<Error, Version>(
                    "",
                    toml::from_str::<toml::Value>(include_str!("../api/api.toml"))
                        .map_err(|err| Error::internal(format!("malformed api.toml: {err}")))?,
                )
                .map_err(|err| Error::internal(format!("initializing api module: {err}")))?;
            bind_handlers(&mut api)
                .map_err(|err| Error::internal(format!("binding handlers: {err}")))?;
        }

        app.serve(format!("0.0.0.0:{port}"), Version::instance())
            .await
            .map_err(|err| Error::internal(format!("server exited: {err}")))
    }
}

fn bind_handlers<S, R>(api: &mut Api<State<S, R>, Error, Version>) -> Result<(), ApiError>
where
    S: StakingPersistence + 'static,
    R: CycleRunner,
{
    api.at("restakers", |_, state| {
        async move { state.store.list_restakers().await }.boxed()
    })?
    .at("validators", |_, state| {
        async move { state.store.list_validators().await }.boxed()
    })?
    .at("rewards", |req, state| {
        async move {
            let address = req
                .string_param("address")?
                .parse()
                .map_err(|err| Error::invalid_argument(format!("malformed address: {err}")))?;
            state.store.rewards_for_address(address).await
        }
        .boxed()
    })?
    .at("status", |_, state| {
        async move { Ok(state.scheduler.status()) }.boxed()
    })?
    .at("health", |_, state| {
        async move { Ok(state.runner.health_check().await) }.boxed()
    })?
    .at("refresh", |_, state| {
        async move { state.scheduler.trigger_refresh().await }.boxed()
    })?
    .metrics("metrics", |_, state| {
        async move { Ok(Cow::Borrowed(state.metrics.as_ref())) }.boxed()
    })?;

    Ok(())
}

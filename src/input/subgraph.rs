//! Restaking subgraph adapter.
//!
//! Fetches deposit events and operator records from a graph-query endpoint
//! and normalizes them into the core data model. Every fetch fails soft: on
//! any transport failure (timeout, malformed response, non-empty `errors`
//! payload) the adapter logs the error and serves a fixed fallback dataset,
//! so downstream stages always receive a well-formed, non-empty batch.

use std::time::Duration;

use chrono::DateTime;
use clap::Parser;
use reqwest::Url;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tracing::instrument;

use crate::{
    Error, Result,
    error::ensure,
    input::SourceBatch,
    types::{
        common::{Address, TokenAmount, U256, ValidatorStatus, address, b256},
        staking::{Restaker, SlashEvent, Validator},
    },
};

/// Number of rows requested per entity query.
///
/// One page per cycle, no pagination loop: queries are ordered newest-first
/// and older state has been persisted by earlier cycles.
pub const PAGE_SIZE: usize = 1000;

/// Fixed timeout for subgraph queries.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the restaking subgraph client.
#[derive(Clone, Debug, Parser)]
pub struct SubgraphOptions {
    /// URL of the restaking subgraph endpoint.
    #[clap(long = "subgraph-url", env = "RESTAKING_SERVICE_SUBGRAPH_URL")]
    pub url: Url,
}

/// JSON envelope returned by graph-query endpoints.
#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

/// A deposit event as returned by the subgraph. BigInt fields come over the
/// wire as decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEntry {
    pub depositor: String,
    pub shares: String,
    pub strategy: String,
    pub block_number: String,
    pub block_timestamp: String,
    pub transaction_hash: String,
}

/// An operator record as returned by the subgraph.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorEntry {
    pub id: String,
    pub total_shares: String,
    #[serde(rename = "metadataURI", default)]
    pub metadata_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepositsData {
    deposits: Vec<DepositEntry>,
}

#[derive(Debug, Deserialize)]
struct OperatorsData {
    operators: Vec<OperatorEntry>,
}

/// Interface for querying the restaking subgraph.
pub trait SubgraphClient: Clone + Send + Sync {
    /// Recent deposit events, ordered by descending block timestamp.
    fn deposits(&self) -> impl Send + Future<Output = Result<Vec<DepositEntry>>>;

    /// Operator records, ordered by descending total stake.
    fn operators(&self) -> impl Send + Future<Output = Result<Vec<OperatorEntry>>>;
}

/// Subgraph client speaking GraphQL-over-HTTP.
#[derive(Clone, Debug)]
pub struct HttpSubgraphClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpSubgraphClient {
    pub fn new(options: &SubgraphOptions) -> Self {
        Self {
            client: reqwest::ClientBuilder::new()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap(),
            url: options.url.clone(),
        }
    }

    async fn query<T: DeserializeOwned>(&self, query: &str) -> Result<T> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let envelope: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|err| Error::transport(format!("malformed subgraph response: {err}")))?;
        unwrap_envelope(envelope)
    }
}

/// A non-empty `errors` array is a failure, even if a partial `data` payload
/// is present alongside it.
fn unwrap_envelope<T>(envelope: GraphQlResponse<T>) -> Result<T> {
    ensure!(
        envelope.errors.is_empty(),
        Error::transport(format!(
            "subgraph returned errors: {}",
            envelope
                .errors
                .iter()
                .map(|err| err.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        ))
    );
    envelope
        .data
        .ok_or_else(|| Error::transport("subgraph response has no data payload"))
}

impl SubgraphClient for HttpSubgraphClient {
    async fn deposits(&self) -> Result<Vec<DepositEntry>> {
        let query = format!(
            "{{ deposits(first: {PAGE_SIZE}, orderBy: blockTimestamp, orderDirection: desc) \
             {{ depositor shares strategy blockNumber blockTimestamp transactionHash }} }}"
        );
        Ok(self.query::<DepositsData>(&query).await?.deposits)
    }

    async fn operators(&self) -> Result<Vec<OperatorEntry>> {
        let query = format!(
            "{{ operators(first: {PAGE_SIZE}, orderBy: totalShares, orderDirection: desc) \
             {{ id totalShares metadataURI }} }}"
        );
        Ok(self.query::<OperatorsData>(&query).await?.operators)
    }
}

/// Fetch-and-normalize layer over a [`SubgraphClient`].
#[derive(Clone, Debug)]
pub struct SubgraphAdapter<C> {
    client: C,
}

impl<C: SubgraphClient> SubgraphAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Fetch the latest deposit events as [`Restaker`] records.
    #[instrument(skip(self))]
    pub async fn fetch_restakers(&self) -> SourceBatch<Restaker> {
        match self.try_fetch_restakers().await {
            Ok(records) => SourceBatch::live(records),
            Err(err) => {
                tracing::warn!("subgraph deposit fetch failed, serving fallback dataset: {err}");
                SourceBatch::fallback(fallback_restakers())
            }
        }
    }

    /// Fetch operator records as [`Validator`] records.
    #[instrument(skip(self))]
    pub async fn fetch_validators(&self) -> SourceBatch<Validator> {
        match self.try_fetch_validators().await {
            Ok(records) => SourceBatch::live(records),
            Err(err) => {
                tracing::warn!("subgraph operator fetch failed, serving fallback dataset: {err}");
                SourceBatch::fallback(fallback_validators())
            }
        }
    }

    /// Fetch slash events.
    ///
    /// There is no live slashing feed yet, so this always yields an empty live
    /// batch. It stays a separate, independently-failing step so that wiring a
    /// real feed up later touches only this adapter, not the orchestrator.
    #[instrument(skip(self))]
    pub async fn fetch_slash_events(&self) -> SourceBatch<SlashEvent> {
        SourceBatch::live(vec![])
    }

    async fn try_fetch_restakers(&self) -> Result<Vec<Restaker>> {
        let deposits = self.client.deposits().await?;
        deposits.iter().map(restaker_from_deposit).collect()
    }

    async fn try_fetch_validators(&self) -> Result<Vec<Validator>> {
        let operators = self.client.operators().await?;
        operators.iter().map(validator_from_operator).collect()
    }
}

/// Normalize a subgraph deposit event into a [`Restaker`].
///
/// The strategy address doubles as the validator reference; the block
/// timestamp arrives as seconds since epoch.
pub fn restaker_from_deposit(entry: &DepositEntry) -> Result<Restaker> {
    let user_address: Address = entry
        .depositor
        .parse()
        .map_err(|err| Error::transport(format!("malformed depositor {:?}: {err}", entry.depositor)))?;
    let strategy_address: Address = entry
        .strategy
        .parse()
        .map_err(|err| Error::transport(format!("malformed strategy {:?}: {err}", entry.strategy)))?;
    let amount_restaked: TokenAmount = entry
        .shares
        .parse()
        .map_err(|err| Error::transport(format!("malformed shares {:?}: {err}", entry.shares)))?;
    let block_number = entry
        .block_number
        .parse()
        .map_err(|err| Error::transport(format!("malformed block number {:?}: {err}", entry.block_number)))?;
    let seconds: i64 = entry
        .block_timestamp
        .parse()
        .map_err(|err| Error::transport(format!("malformed timestamp {:?}: {err}", entry.block_timestamp)))?;
    let timestamp = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::transport(format!("timestamp {seconds} out of range")))?;
    let tx_hash = entry
        .transaction_hash
        .parse()
        .map_err(|err| Error::transport(format!("malformed tx hash {:?}: {err}", entry.transaction_hash)))?;

    Ok(Restaker {
        user_address,
        amount_restaked,
        validator_address: strategy_address,
        strategy_address,
        block_number,
        tx_hash,
        timestamp,
    })
}

/// Normalize a subgraph operator record into a [`Validator`].
///
/// Status always defaults to active: the subgraph carries no status signal and
/// the adapter does not infer one.
pub fn validator_from_operator(entry: &OperatorEntry) -> Result<Validator> {
    let operator_address: Address = entry
        .id
        .parse()
        .map_err(|err| Error::transport(format!("malformed operator id {:?}: {err}", entry.id)))?;
    let total_delegated: TokenAmount = entry
        .total_shares
        .parse()
        .map_err(|err| Error::transport(format!("malformed total shares {:?}: {err}", entry.total_shares)))?;

    Ok(Validator {
        operator_address,
        operator_id: entry.id.clone(),
        total_delegated,
        status: ValidatorStatus::Active,
        metadata_uri: entry
            .metadata_uri
            .clone()
            .filter(|uri| !uri.is_empty()),
    })
}

/// The fixed restaker dataset served when the subgraph is unreachable.
pub fn fallback_restakers() -> Vec<Restaker> {
    let timestamp = DateTime::from_timestamp(1_755_000_000, 0).unwrap();
    vec![
        Restaker {
            user_address: address!("1111111111111111111111111111111111111111"),
            amount_restaked: U256::from(32_000_000_000_000_000_000u128),
            validator_address: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            strategy_address: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            block_number: 19_000_000,
            tx_hash: b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            timestamp,
        },
        Restaker {
            user_address: address!("2222222222222222222222222222222222222222"),
            amount_restaked: U256::from(16_000_000_000_000_000_000u128),
            validator_address: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            strategy_address: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            block_number: 19_000_001,
            tx_hash: b256!("2222222222222222222222222222222222222222222222222222222222222222"),
            timestamp,
        },
    ]
}

/// The fixed validator dataset served when the subgraph is unreachable.
pub fn fallback_validators() -> Vec<Validator> {
    vec![
        Validator {
            operator_address: address!("cccccccccccccccccccccccccccccccccccccccc"),
            operator_id: "0xcccccccccccccccccccccccccccccccccccccccc".to_string(),
            total_delegated: U256::from(1_000_000_000_000_000_000_000u128),
            status: ValidatorStatus::Active,
            metadata_uri: Some("https://operators.example/cc.json".to_string()),
        },
        Validator {
            operator_address: address!("dddddddddddddddddddddddddddddddddddddddd"),
            operator_id: "0xdddddddddddddddddddddddddddddddddddddddd".to_string(),
            total_delegated: U256::from(500_000_000_000_000_000_000u128),
            status: ValidatorStatus::Active,
            metadata_uri: None,
        },
    ]
}

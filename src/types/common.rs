//! Primitive types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use alloy::primitives::{Address, B256, U256, address, b256};

/// An amount of tokens in WEI (18 decimals).
///
/// Amounts are stored and transmitted as decimal strings and aggregated with
/// 256-bit integer arithmetic; they must never pass through a floating point
/// type.
pub type TokenAmount = U256;

/// A transaction hash.
pub type TxHash = B256;

/// Render a timestamp in the fixed format used throughout the service:
/// RFC 3339, UTC, second precision, `Z` suffix.
///
/// The format is uniform-width, so lexicographic order of rendered timestamps
/// is chronological order. The store relies on this.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a timestamp rendered by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|err| Error::internal(format!("malformed stored timestamp {raw:?}: {err}")))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Operational status of a validator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    #[default]
    Active,
    Jailed,
    Slashed,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Jailed => "jailed",
            Self::Slashed => "slashed",
        }
    }
}

impl Display for ValidatorStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidatorStatus {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "active" => Ok(Self::Active),
            "jailed" => Ok(Self::Jailed),
            "slashed" => Ok(Self::Slashed),
            _ => Err(Error::internal(format!("unknown validator status {raw:?}"))),
        }
    }
}

/// Classification of a reward record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    #[default]
    Restaking,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restaking => "restaking",
        }
    }
}

impl Display for RewardKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardKind {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "restaking" => Ok(Self::Restaking),
            _ => Err(Error::internal(format!("unknown reward kind {raw:?}"))),
        }
    }
}

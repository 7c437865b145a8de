//! Data types for the restaking data set.

pub mod common;
pub mod staking;

use thiserror::Error;

/// Wire payload could not be turned into a typed snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("unknown session regime: {0}")]
    UnknownRegime(String),

    #[error("invalid json in {field}: {reason}")]
    InvalidJson { field: &'static str, reason: String },
}

/// Failures surfaced by a single evaluation cycle.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("malformed event: {0}")]
    Decode(#[from] DecodeError),

    #[error("policy table failed: {0}")]
    Policy(#[source] anyhow::Error),

    #[error("state store write failed for key {key}: {source}")]
    Store {
        key: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Hard exit engine could not produce a plan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExitPlanError {
    #[error("invalid reduction notional: {0}")]
    InvalidReduction(f64),

    #[error("no market data for any candidate position")]
    NoMarketData,

    #[error("exit planner unavailable: {0}")]
    Unavailable(String),
}

use std::time::Duration;
use thiserror::Error;

/// Inbound payload could not be turned into a `Reading`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed sensor payload: {0}")]
    Json(#[from] simd_json::Error),
    #[error("sensor payload has no node id")]
    MissingNodeId,
    #[error("sensor payload has no timestamp")]
    MissingTimestamp,
    #[error("invalid epoch timestamp {0}")]
    InvalidTimestamp(f64),
}

/// Storage was unavailable or rejected a write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// No probability could be produced for a reading.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("estimator produced non-finite probability {0}")]
    NonFinite(f64),
    #[error("scorer could not score reading")]
    Unscored,
    #[error("scorer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("scorer returned status {0}")]
    Status(u16),
}

/// Alert state committed but the status message was not delivered.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode alert message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish not accepted within {0:?}")]
    Timeout(Duration),
}

/// Broker connection could not be established or was lost.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("mqtt connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("mqtt subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
    #[error("broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),
    #[error("broker rejected subscription to {0}")]
    SubscriptionRejected(String),
    #[error("broker closed the connection")]
    ClosedByBroker,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be a finite value within [0, 1], got {1}")]
    OutOfRange(&'static str, f64),
    #[error("{0} must be between 1 and {1} seconds, got {2}")]
    DurationOutOfRange(&'static str, u64, u64),
    #[error("unknown estimator {0:?}; expected \"threshold\" or \"weighted\"")]
    UnknownEstimator(String),
}

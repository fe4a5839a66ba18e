use crate::alert::AlertStatus;
use crate::error::{PersistenceError, PublishError};
use crate::reading::Reading;
use crate::scoring::Estimate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable storage for readings and per-node alert status.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Appends a reading and returns its row id.
    async fn insert_reading(&self, reading: &Reading) -> Result<i64, PersistenceError>;

    /// Annotates a stored reading with its score.
    async fn record_estimate(&self, row_id: i64, estimate: &Estimate)
        -> Result<(), PersistenceError>;

    /// Upserts the alert status row of one node.
    async fn update_alert_status(
        &self,
        node_id: &str,
        has_fire: bool,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;
}

/// Outbound side of the broker connection.
#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish_status(&self, node_id: &str, status: AlertStatus) -> Result<(), PublishError>;
}

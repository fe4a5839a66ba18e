use super::ports::{AlertPublisher, ReadingStore};
use crate::alert::{AlertStateMachine, Transition};
use crate::error::ScoringError;
use crate::reading::Reading;
use crate::scoring::{Estimate, FireProbability, ProbabilityEstimator, ReadingWindow, Scorer};
use crate::stats::IngestStats;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropStage {
    Persist,
    Score,
}

/// What happened to one reading. Per-message failures end here and are
/// never raised to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageOutcome {
    Dropped(DropStage),
    Applied {
        row_id: i64,
        probability: FireProbability,
        transition: Transition,
        published: bool,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub max_age: Duration,
    pub max_samples: usize,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn ReadingStore>,
    publisher: Arc<dyn AlertPublisher>,
    scorer: Scorer,
    alerts: Arc<AlertStateMachine>,
    history: Arc<Mutex<HashMap<String, ReadingWindow>>>,
    history_limits: HistoryLimits,
    stats: Arc<IngestStats>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        publisher: Arc<dyn AlertPublisher>,
        scorer: Scorer,
        alerts: Arc<AlertStateMachine>,
        history_limits: HistoryLimits,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            store,
            publisher,
            scorer,
            alerts,
            history: Arc::new(Mutex::new(HashMap::new())),
            history_limits,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Records, scores and applies one reading. Callers must not run two of
    /// these concurrently for the same node.
    pub async fn process_reading(&self, reading: Reading, now: Instant) -> MessageOutcome {
        let row_id = match self.store.insert_reading(&reading).await {
            Ok(row_id) => {
                IngestStats::bump(&self.stats.persisted);
                row_id
            }
            Err(err) => {
                IngestStats::bump(&self.stats.persist_failures);
                self.stats.record_error(err.to_string());
                tracing::warn!(error=%err, node=%reading.node_id, "failed to persist reading; dropping");
                return MessageOutcome::Dropped(DropStage::Persist);
            }
        };

        let estimate = match self.score(row_id, &reading).await {
            Ok(estimate) => estimate,
            Err(err) => {
                IngestStats::bump(&self.stats.scoring_failures);
                self.stats.record_error(err.to_string());
                tracing::warn!(error=%err, node=%reading.node_id, row_id, "failed to score reading; dropping");
                return MessageOutcome::Dropped(DropStage::Score);
            }
        };

        if let Err(err) = self.store.record_estimate(row_id, &estimate).await {
            IngestStats::bump(&self.stats.persist_failures);
            self.stats.record_error(err.to_string());
            tracing::warn!(error=%err, node=%reading.node_id, row_id, "failed to store fire probability");
        }

        let transition = self
            .alerts
            .transition(&reading.node_id, estimate.probability, now);
        tracing::debug!(
            node=%reading.node_id,
            row_id,
            probability = estimate.probability.value(),
            status = ?transition.status,
            changed = transition.changed,
            "applied reading"
        );

        let mut published = false;
        if transition.changed {
            IngestStats::bump(&self.stats.transitions);
            tracing::info!(
                node=%reading.node_id,
                status = ?transition.status,
                probability = estimate.probability.value(),
                "fire alert status changed"
            );
            published = self.commit_transition(&reading.node_id, transition).await;
        }

        MessageOutcome::Applied {
            row_id,
            probability: estimate.probability,
            transition,
            published,
        }
    }

    async fn score(&self, row_id: i64, reading: &Reading) -> Result<Estimate, ScoringError> {
        match &self.scorer {
            Scorer::Local(estimator) => self.score_locally(estimator.as_ref(), reading),
            Scorer::Remote(remote) => remote.invoke(row_id, reading).await,
        }
    }

    fn score_locally(
        &self,
        estimator: &dyn ProbabilityEstimator,
        reading: &Reading,
    ) -> Result<Estimate, ScoringError> {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = history.entry(reading.node_id.clone()).or_insert_with(|| {
            ReadingWindow::new(self.history_limits.max_age, self.history_limits.max_samples)
        });
        if !window.push(reading) {
            tracing::trace!(node=%reading.node_id, samples = window.len(), "reading already in history");
        }
        estimator.estimate(reading, window)
    }

    /// The in-memory transition is already committed; storage and publish
    /// are best-effort from here.
    async fn commit_transition(&self, node_id: &str, transition: Transition) -> bool {
        let has_fire = transition.status.is_fire();
        if let Err(err) = self
            .store
            .update_alert_status(node_id, has_fire, Utc::now())
            .await
        {
            IngestStats::bump(&self.stats.persist_failures);
            self.stats.record_error(err.to_string());
            tracing::warn!(error=%err, node=%node_id, has_fire, "failed to persist alert status");
        }

        match self.publisher.publish_status(node_id, transition.status).await {
            Ok(()) => true,
            Err(err) => {
                IngestStats::bump(&self.stats.publish_failures);
                self.stats.record_error(err.to_string());
                tracing::warn!(error=%err, node=%node_id, has_fire, "failed to publish alert status");
                false
            }
        }
    }
}

use super::pipeline::{IngestionPipeline, MessageOutcome};
use crate::reading::{decode_reading, Reading};
use crate::stats::IngestStats;
use futures::future;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug)]
enum LaneCommand {
    Reading(Reading),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    Undecodable,
    LaneFull,
}

/// Routes readings to one sequential worker per node. Readings of a node
/// are applied in arrival order; different nodes proceed independently.
#[derive(Clone)]
pub struct NodeLanes {
    pipeline: IngestionPipeline,
    capacity: usize,
    lanes: Arc<Mutex<HashMap<String, mpsc::Sender<LaneCommand>>>>,
}

impl NodeLanes {
    pub fn new(pipeline: IngestionPipeline, capacity: usize) -> Self {
        Self {
            pipeline,
            capacity: capacity.max(1),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decodes a raw sensor payload and queues it. Never waits, so the
    /// broker event loop is not held up by a busy node.
    pub fn dispatch_payload(&self, topic: &str, payload: &[u8]) -> Dispatch {
        let stats = self.pipeline.stats();
        IngestStats::bump(&stats.received);

        let mut payload = payload.to_vec();
        match decode_reading(&mut payload) {
            Ok(reading) => self.dispatch(reading),
            Err(err) => {
                IngestStats::bump(&stats.decode_failures);
                stats.record_error(err.to_string());
                tracing::warn!(error=%err, topic=%topic, "failed to decode sensor payload; dropping");
                Dispatch::Undecodable
            }
        }
    }

    pub fn dispatch(&self, reading: Reading) -> Dispatch {
        let node_id = reading.node_id.clone();
        let mut command = LaneCommand::Reading(reading);
        // a closed lane gets one respawn
        for _ in 0..2 {
            let lane = self.lane(&node_id);
            match lane.try_send(command) {
                Ok(()) => return Dispatch::Queued,
                Err(TrySendError::Full(_)) => {
                    IngestStats::bump(&self.pipeline.stats().lane_drops);
                    tracing::warn!(node=%node_id, capacity = self.capacity, "node lane full; dropping reading");
                    return Dispatch::LaneFull;
                }
                Err(TrySendError::Closed(returned)) => {
                    tracing::warn!(node=%node_id, "node lane closed; respawning");
                    self.remove_lane(&node_id, &lane);
                    command = returned;
                }
            }
        }
        IngestStats::bump(&self.pipeline.stats().lane_drops);
        Dispatch::LaneFull
    }

    /// Waits until every reading queued so far has been processed.
    pub async fn flush(&self) {
        let lanes: Vec<mpsc::Sender<LaneCommand>> = {
            let lanes = self
                .lanes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            lanes.values().cloned().collect()
        };
        let waits = lanes.into_iter().map(|lane| async move {
            let (tx, rx) = oneshot::channel();
            if lane.send(LaneCommand::Flush(tx)).await.is_ok() {
                let _ = rx.await;
            }
        });
        future::join_all(waits).await;
    }

    pub fn lane_count(&self) -> usize {
        self.lanes
            .lock()
            .map(|lanes| lanes.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    fn lane(&self, node_id: &str) -> mpsc::Sender<LaneCommand> {
        let mut lanes = self
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lane) = lanes.get(node_id) {
            return lane.clone();
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        spawn_lane_worker(node_id.to_string(), self.pipeline.clone(), rx);
        lanes.insert(node_id.to_string(), tx.clone());
        tx
    }

    fn remove_lane(&self, node_id: &str, stale: &mpsc::Sender<LaneCommand>) {
        let mut lanes = self
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if lanes
            .get(node_id)
            .map(|current| current.same_channel(stale))
            .unwrap_or(false)
        {
            lanes.remove(node_id);
        }
    }
}

fn spawn_lane_worker(
    node_id: String,
    pipeline: IngestionPipeline,
    mut rx: mpsc::Receiver<LaneCommand>,
) {
    tokio::spawn(async move {
        tracing::debug!(node=%node_id, "node lane started");
        while let Some(command) = rx.recv().await {
            match command {
                LaneCommand::Reading(reading) => {
                    match pipeline.process_reading(reading, Instant::now()).await {
                        MessageOutcome::Applied {
                            row_id,
                            probability,
                            transition,
                            published,
                        } => tracing::trace!(
                            node=%node_id,
                            row_id,
                            probability = probability.value(),
                            status = ?transition.status,
                            published,
                            "lane applied reading"
                        ),
                        MessageOutcome::Dropped(stage) => {
                            tracing::trace!(node=%node_id, ?stage, "lane dropped reading")
                        }
                    }
                }
                LaneCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(node=%node_id, "node lane stopped");
    });
}

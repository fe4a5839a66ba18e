use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub decode_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub scoring_failures: AtomicU64,
    pub transitions: AtomicU64,
    pub publish_failures: AtomicU64,
    pub lane_drops: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub scoring_failures: u64,
    pub transitions: u64,
    pub publish_failures: u64,
    pub lane_drops: u64,
    pub mqtt_connected: bool,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            scoring_failures: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            lane_drops: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            scoring_failures: self.scoring_failures.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            lane_drops: self.lane_drops.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

pub fn log_snapshot(stats: &IngestStats, tracked_nodes: usize) {
    let snapshot = stats.snapshot();
    tracing::info!(
        received = snapshot.received,
        decode_failures = snapshot.decode_failures,
        persisted = snapshot.persisted,
        persist_failures = snapshot.persist_failures,
        scoring_failures = snapshot.scoring_failures,
        transitions = snapshot.transitions,
        publish_failures = snapshot.publish_failures,
        lane_drops = snapshot.lane_drops,
        mqtt_connected = snapshot.mqtt_connected,
        tracked_nodes,
        last_error = stats.last_error().as_deref().unwrap_or(""),
        "ingest stats"
    );
}

use super::lanes::{Dispatch, NodeLanes};
use super::pipeline::{DropStage, HistoryLimits, IngestionPipeline, MessageOutcome};
use super::ports::{AlertPublisher, ReadingStore};
use crate::alert::{AlertPolicy, AlertState, AlertStateMachine, AlertStatus};
use crate::error::{PersistenceError, PublishError, ScoringError};
use crate::reading::Reading;
use crate::scoring::{
    Estimate, ProbabilityEstimator, ReadingWindow, Scorer, ThresholdEstimator, WeightedEstimator,
};
use crate::stats::IngestStats;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct MemoryStore {
    next_id: AtomicI64,
    fail_inserts: AtomicBool,
    fail_alert_updates: AtomicBool,
    fail_estimates: AtomicBool,
    panic_inserts: AtomicBool,
    held_node: Mutex<Option<String>>,
    release: Notify,
    readings: Mutex<Vec<(i64, Reading)>>,
    estimates: Mutex<HashMap<i64, Estimate>>,
    alert_rows: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<i64, PersistenceError> {
        if self.panic_inserts.load(Ordering::SeqCst) {
            panic!("storage driver crashed");
        }
        let held = self.held_node.lock().unwrap().as_deref() == Some(reading.node_id.as_str());
        if held {
            self.release.notified().await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("storage offline".to_string()));
        }
        let row_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.readings.lock().unwrap().push((row_id, reading.clone()));
        Ok(row_id)
    }

    async fn record_estimate(
        &self,
        row_id: i64,
        estimate: &Estimate,
    ) -> Result<(), PersistenceError> {
        if self.fail_estimates.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("readings table read-only".to_string()));
        }
        self.estimates.lock().unwrap().insert(row_id, *estimate);
        Ok(())
    }

    async fn update_alert_status(
        &self,
        node_id: &str,
        has_fire: bool,
        _at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        if self.fail_alert_updates.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("alert table locked".to_string()));
        }
        self.alert_rows
            .lock()
            .unwrap()
            .insert(node_id.to_string(), has_fire);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    fail: AtomicBool,
    sent: Mutex<Vec<(String, u8)>>,
}

impl RecordingPublisher {
    fn sent(&self) -> Vec<(String, u8)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertPublisher for RecordingPublisher {
    async fn publish_status(&self, node_id: &str, status: AlertStatus) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Encode(
                serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            ));
        }
        self.sent
            .lock()
            .unwrap()
            .push((node_id.to_string(), status.as_flag()));
        Ok(())
    }
}

struct BrokenEstimator;

impl ProbabilityEstimator for BrokenEstimator {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn estimate(&self, _reading: &Reading, _history: &ReadingWindow) -> Result<Estimate, ScoringError> {
        Err(ScoringError::Unscored)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    alerts: Arc<AlertStateMachine>,
    pipeline: IngestionPipeline,
}

fn harness_with(estimator: Arc<dyn ProbabilityEstimator>, alerts: AlertStateMachine) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let alerts = Arc::new(alerts);
    let pipeline = IngestionPipeline::new(
        store.clone(),
        publisher.clone(),
        Scorer::Local(estimator),
        alerts.clone(),
        HistoryLimits {
            max_age: Duration::from_secs(1800),
            max_samples: 512,
        },
        Arc::new(IngestStats::new()),
    );
    Harness {
        store,
        publisher,
        alerts,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(ThresholdEstimator::default()),
        AlertStateMachine::new(AlertPolicy::default()),
    )
}

fn reading(node: &str, secs: i64, flame: bool) -> Reading {
    Reading {
        node_id: node.to_string(),
        timestamp: Utc.timestamp_opt(1_714_000_000 + secs, 0).single().unwrap(),
        temperature: Some(if flame { 65.0 } else { 24.0 }),
        humidity: Some(55.0),
        air_quality: Some(120.0),
        flame_present: Some(flame),
    }
}

fn status_of(outcome: MessageOutcome) -> (AlertStatus, bool) {
    match outcome {
        MessageOutcome::Applied { transition, .. } => (transition.status, transition.changed),
        MessageOutcome::Dropped(stage) => panic!("unexpected drop at {stage:?}"),
    }
}

#[tokio::test]
async fn escalation_publishes_once() {
    let h = harness();
    let t0 = Instant::now();

    let first = h.pipeline.process_reading(reading("n1", 0, true), t0).await;
    assert_eq!(status_of(first), (AlertStatus::Fire, true));
    let second = h
        .pipeline
        .process_reading(reading("n1", 5, true), t0 + Duration::from_secs(5))
        .await;
    assert_eq!(status_of(second), (AlertStatus::Fire, false));

    assert_eq!(h.publisher.sent(), vec![("n1".to_string(), 1)]);
    assert_eq!(h.store.alert_rows.lock().unwrap().get("n1"), Some(&true));
    assert_eq!(h.store.readings.lock().unwrap().len(), 2);

    let estimates = h.store.estimates.lock().unwrap();
    assert_eq!(estimates.len(), 2);
    assert!(estimates.values().all(|e| e.probability.value() == 1.0));
}

#[tokio::test]
async fn clears_after_cooldown_and_publishes_no_fire() {
    let h = harness();
    let t0 = Instant::now();
    let min = |m: u64| Duration::from_secs(60 * m);

    h.pipeline.process_reading(reading("n1", 0, true), t0).await;
    h.pipeline.process_reading(reading("n1", 1, false), t0).await;
    let at_4m = h.pipeline.process_reading(reading("n1", 240, false), t0 + min(4)).await;
    assert_eq!(status_of(at_4m), (AlertStatus::Fire, false));

    let at_5m1s = h
        .pipeline
        .process_reading(reading("n1", 301, false), t0 + min(5) + Duration::from_secs(1))
        .await;
    assert_eq!(status_of(at_5m1s), (AlertStatus::NoFire, true));

    assert_eq!(
        h.publisher.sent(),
        vec![("n1".to_string(), 1), ("n1".to_string(), 0)]
    );
    assert_eq!(h.store.alert_rows.lock().unwrap().get("n1"), Some(&false));
}

#[tokio::test]
async fn persistence_failure_drops_without_touching_state() {
    let h = harness();
    let t0 = Instant::now();

    h.store.fail_inserts.store(true, Ordering::SeqCst);
    let dropped = h.pipeline.process_reading(reading("n1", 0, true), t0).await;
    assert_eq!(dropped, MessageOutcome::Dropped(DropStage::Persist));
    assert_eq!(h.alerts.snapshot("n1"), None);
    assert!(h.publisher.sent().is_empty());

    h.store.fail_inserts.store(false, Ordering::SeqCst);
    let next = h.pipeline.process_reading(reading("n1", 1, true), t0).await;
    assert_eq!(status_of(next), (AlertStatus::Fire, true));

    let snapshot = h.pipeline.stats().snapshot();
    assert_eq!(snapshot.persist_failures, 1);
    assert_eq!(snapshot.persisted, 1);
}

#[tokio::test]
async fn scoring_failure_drops_after_persisting() {
    let h = harness_with(
        Arc::new(BrokenEstimator),
        AlertStateMachine::new(AlertPolicy::default()),
    );
    let outcome = h
        .pipeline
        .process_reading(reading("n1", 0, true), Instant::now())
        .await;
    assert_eq!(outcome, MessageOutcome::Dropped(DropStage::Score));
    assert_eq!(h.store.readings.lock().unwrap().len(), 1);
    assert!(h.store.estimates.lock().unwrap().is_empty());
    assert_eq!(h.alerts.snapshot("n1"), None);
    assert_eq!(h.pipeline.stats().snapshot().scoring_failures, 1);
}

#[tokio::test]
async fn publish_failure_keeps_committed_state() {
    let h = harness();
    h.publisher.fail.store(true, Ordering::SeqCst);

    let outcome = h
        .pipeline
        .process_reading(reading("n1", 0, true), Instant::now())
        .await;
    match outcome {
        MessageOutcome::Applied {
            transition,
            published,
            ..
        } => {
            assert!(transition.changed);
            assert!(!published);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::Fire);
    assert_eq!(h.store.alert_rows.lock().unwrap().get("n1"), Some(&true));
    assert_eq!(h.pipeline.stats().snapshot().publish_failures, 1);
}

#[tokio::test]
async fn alert_row_failure_still_publishes() {
    let h = harness();
    h.store.fail_alert_updates.store(true, Ordering::SeqCst);

    let outcome = h
        .pipeline
        .process_reading(reading("n1", 0, true), Instant::now())
        .await;
    assert!(matches!(
        outcome,
        MessageOutcome::Applied {
            published: true,
            ..
        }
    ));
    assert_eq!(h.publisher.sent(), vec![("n1".to_string(), 1)]);
}

#[tokio::test]
async fn estimate_write_failure_is_counted_but_still_transitions() {
    let h = harness();
    h.store.fail_estimates.store(true, Ordering::SeqCst);

    let outcome = h
        .pipeline
        .process_reading(reading("n1", 0, true), Instant::now())
        .await;
    assert_eq!(status_of(outcome), (AlertStatus::Fire, true));
    assert_eq!(h.publisher.sent(), vec![("n1".to_string(), 1)]);

    let stats = h.pipeline.stats();
    assert_eq!(stats.snapshot().persist_failures, 1);
    assert!(stats
        .last_error()
        .is_some_and(|err| err.contains("readings table read-only")));
}

#[tokio::test]
async fn nodes_do_not_share_alert_state() {
    let h = harness();
    let t0 = Instant::now();
    h.pipeline.process_reading(reading("b", 0, false), t0).await;
    h.pipeline.process_reading(reading("a", 0, true), t0).await;

    assert_eq!(h.alerts.snapshot("a").unwrap().status, AlertStatus::Fire);
    assert_eq!(h.alerts.snapshot("b").unwrap(), AlertState::default());
    assert_eq!(h.publisher.sent(), vec![("a".to_string(), 1)]);
}

#[tokio::test]
async fn replayed_reading_gets_the_same_decision() {
    // weighted scoring depends on history, so a replay must not skew it
    let build = || {
        harness_with(
            Arc::new(WeightedEstimator),
            AlertStateMachine::new(AlertPolicy::default()),
        )
    };
    let original = build();
    let replay = build();
    let t0 = Instant::now();

    let warmup: Vec<Reading> = (0..3).map(|i| reading("n1", i, false)).collect();
    let last = reading("n1", 3, true);

    for (i, r) in warmup.iter().enumerate() {
        let at = t0 + Duration::from_secs(i as u64);
        original.pipeline.process_reading(r.clone(), at).await;
        replay.pipeline.process_reading(r.clone(), at).await;
    }
    let at = t0 + Duration::from_secs(3);
    let first = original.pipeline.process_reading(last.clone(), at).await;

    // the replaying node saw the warmup twice
    for r in &warmup {
        replay.pipeline.process_reading(r.clone(), at).await;
    }
    let replayed = replay.pipeline.process_reading(last.clone(), at).await;

    match (first, replayed) {
        (
            MessageOutcome::Applied {
                probability: p1,
                transition: t1,
                ..
            },
            MessageOutcome::Applied {
                probability: p2,
                transition: t2,
                ..
            },
        ) => {
            assert_eq!(p1, p2);
            assert_eq!(t1, t2);
        }
        other => panic!("unexpected outcomes {other:?}"),
    }
}

fn lanes_for(h: &Harness) -> NodeLanes {
    NodeLanes::new(h.pipeline.clone(), 16)
}

#[tokio::test]
async fn undecodable_payload_does_not_block_the_node() {
    let h = harness();
    let lanes = lanes_for(&h);

    assert_eq!(
        lanes.dispatch_payload("greendot/sensor/data", b"{\"id\":\"n1\",\"timestamp\":"),
        Dispatch::Undecodable
    );
    assert_eq!(
        lanes.dispatch_payload(
            "greendot/sensor/data",
            br#"{"id":"n1","timestamp":1714000000,"temp":70.0,"humidity":20.0,"air":300,"flame":1}"#,
        ),
        Dispatch::Queued
    );
    lanes.flush().await;

    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::Fire);
    let snapshot = h.pipeline.stats().snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.decode_failures, 1);
    assert_eq!(lanes.lane_count(), 1);
}

#[tokio::test]
async fn lanes_keep_per_node_order() {
    let h = harness();
    let lanes = lanes_for(&h);

    // fire, then enough quiet readings to start a cooldown on n1
    lanes.dispatch(reading("n1", 0, true));
    lanes.dispatch(reading("n2", 0, false));
    lanes.dispatch(reading("n1", 1, false));
    lanes.dispatch(reading("n1", 2, false));
    lanes.flush().await;

    let n1 = h.alerts.snapshot("n1").unwrap();
    assert_eq!(n1.status, AlertStatus::Fire);
    assert!(n1.below_threshold_since.is_some());
    assert_eq!(h.alerts.snapshot("n2").unwrap(), AlertState::default());

    let stored: Vec<(String, i64)> = h
        .store
        .readings
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, r)| r.node_id == "n1")
        .map(|(_, r)| (r.node_id.clone(), r.timestamp.timestamp() - 1_714_000_000))
        .collect();
    assert_eq!(
        stored,
        vec![
            ("n1".to_string(), 0),
            ("n1".to_string(), 1),
            ("n1".to_string(), 2)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn lanes_clear_on_monotonic_cooldown() {
    let h = harness();
    let lanes = lanes_for(&h);

    lanes.dispatch(reading("n1", 0, true));
    lanes.dispatch(reading("n1", 1, false));
    lanes.flush().await;
    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::Fire);

    // sensor clock says hours passed; the cooldown only trusts local time
    lanes.dispatch(reading("n1", 7200, false));
    lanes.flush().await;
    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::Fire);

    tokio::time::advance(Duration::from_secs(301)).await;
    lanes.dispatch(reading("n1", 7201, false));
    lanes.flush().await;
    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::NoFire);
    assert_eq!(
        h.publisher.sent(),
        vec![("n1".to_string(), 1), ("n1".to_string(), 0)]
    );
}

async fn wait_for_fire(alerts: &AlertStateMachine, node_id: &str) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if alerts
                .snapshot(node_id)
                .is_some_and(|state| state.status == AlertStatus::Fire)
            {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn stalled_node_does_not_hold_up_others() {
    let h = harness();
    *h.store.held_node.lock().unwrap() = Some("slow".to_string());
    let lanes = NodeLanes::new(h.pipeline.clone(), 1);

    let slow: Vec<Dispatch> = (0..4)
        .map(|i| lanes.dispatch(reading("slow", i, true)))
        .collect();
    assert_eq!(
        slow,
        vec![
            Dispatch::Queued,
            Dispatch::LaneFull,
            Dispatch::LaneFull,
            Dispatch::LaneFull
        ]
    );
    assert_eq!(h.pipeline.stats().snapshot().lane_drops, 3);

    assert_eq!(lanes.dispatch(reading("fast", 0, true)), Dispatch::Queued);
    assert!(wait_for_fire(&h.alerts, "fast").await);
    assert_eq!(h.alerts.snapshot("slow"), None);
    assert_eq!(h.publisher.sent(), vec![("fast".to_string(), 1)]);

    h.store.release.notify_one();
    lanes.flush().await;

    assert_eq!(h.alerts.snapshot("slow").unwrap().status, AlertStatus::Fire);
    let slow_rows = h
        .store
        .readings
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, r)| r.node_id == "slow")
        .count();
    assert_eq!(slow_rows, 1);
    assert_eq!(lanes.lane_count(), 2);
}

#[tokio::test]
async fn crashed_lane_is_replaced_on_next_reading() {
    let h = harness();
    let lanes = lanes_for(&h);

    h.store.panic_inserts.store(true, Ordering::SeqCst);
    assert_eq!(lanes.dispatch(reading("n1", 0, true)), Dispatch::Queued);
    // returns once the worker is gone and the flush reply is dropped
    lanes.flush().await;
    assert_eq!(h.alerts.snapshot("n1"), None);

    h.store.panic_inserts.store(false, Ordering::SeqCst);
    assert_eq!(lanes.dispatch(reading("n1", 1, true)), Dispatch::Queued);
    lanes.flush().await;

    assert_eq!(h.alerts.snapshot("n1").unwrap().status, AlertStatus::Fire);
    assert_eq!(lanes.lane_count(), 1);
    assert_eq!(h.pipeline.stats().snapshot().lane_drops, 0);
}

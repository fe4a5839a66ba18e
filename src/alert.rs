use crate::scoring::FireProbability;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_THRESHOLD: f64 = 0.3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertStatus {
    #[default]
    NoFire,
    Fire,
}

impl AlertStatus {
    pub fn is_fire(self) -> bool {
        matches!(self, AlertStatus::Fire)
    }

    /// Wire value of the status message: 1 = fire.
    pub fn as_flag(self) -> u8 {
        match self {
            AlertStatus::NoFire => 0,
            AlertStatus::Fire => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub threshold: f64,
    pub cooldown: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertState {
    pub status: AlertStatus,
    pub below_threshold_since: Option<Instant>,
}

impl AlertState {
    fn with_status(status: AlertStatus) -> Self {
        Self {
            status,
            below_threshold_since: None,
        }
    }

    /// Applies one probability sample and returns true when the status
    /// flipped. Anything above the threshold cancels a pending cooldown;
    /// clearing needs the cooldown to elapse with no such sample.
    pub fn apply(&mut self, probability: FireProbability, now: Instant, policy: &AlertPolicy) -> bool {
        let above = probability.value() > policy.threshold;
        match (self.status, above) {
            (AlertStatus::NoFire, true) => {
                self.status = AlertStatus::Fire;
                self.below_threshold_since = None;
                true
            }
            (AlertStatus::Fire, true) => {
                self.below_threshold_since = None;
                false
            }
            (AlertStatus::Fire, false) => match self.below_threshold_since {
                None => {
                    self.below_threshold_since = Some(now);
                    false
                }
                Some(since) if now.saturating_duration_since(since) > policy.cooldown => {
                    self.status = AlertStatus::NoFire;
                    self.below_threshold_since = None;
                    true
                }
                Some(_) => false,
            },
            (AlertStatus::NoFire, false) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: AlertStatus,
    pub changed: bool,
}

/// Alert state for every node seen so far. Each node has its own lock, so a
/// transition on one node never waits on another.
#[derive(Debug, Default)]
pub struct AlertStateMachine {
    policy: AlertPolicy,
    nodes: Mutex<HashMap<String, Arc<Mutex<AlertState>>>>,
}

impl AlertStateMachine {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds statuses recovered from storage. Cooldown timers start empty.
    pub fn with_statuses<I>(policy: AlertPolicy, statuses: I) -> Self
    where
        I: IntoIterator<Item = (String, AlertStatus)>,
    {
        let machine = Self::new(policy);
        {
            let mut nodes = machine
                .nodes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (node_id, status) in statuses {
                nodes.insert(node_id, Arc::new(Mutex::new(AlertState::with_status(status))));
            }
        }
        machine
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    fn slot(&self, node_id: &str) -> Arc<Mutex<AlertState>> {
        let mut nodes = self
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = nodes.get(node_id) {
            return slot.clone();
        }
        let slot = Arc::new(Mutex::new(AlertState::default()));
        nodes.insert(node_id.to_string(), slot.clone());
        slot
    }

    pub fn transition(&self, node_id: &str, probability: FireProbability, now: Instant) -> Transition {
        let slot = self.slot(node_id);
        let mut state = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let changed = state.apply(probability, now, &self.policy);
        Transition {
            status: state.status,
            changed,
        }
    }

    /// Current state of a node, or `None` if it has never been seen.
    #[cfg(test)]
    pub fn snapshot(&self, node_id: &str) -> Option<AlertState> {
        let slot = {
            let nodes = self
                .nodes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            nodes.get(node_id).cloned()?
        };
        let state = *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(state)
    }

    pub fn tracked_nodes(&self) -> usize {
        self.nodes
            .lock()
            .map(|nodes| nodes.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}

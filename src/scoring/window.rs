use crate::reading::Reading;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq)]
pub struct WindowSample {
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub air_quality: Option<f64>,
}

/// Recent history of one node, bounded by age (on sensor time) and count.
#[derive(Debug, Clone)]
pub struct ReadingWindow {
    max_age: ChronoDuration,
    max_samples: usize,
    buffer: VecDeque<WindowSample>,
}

impl ReadingWindow {
    pub fn new(max_age: std::time::Duration, max_samples: usize) -> Self {
        Self {
            max_age: ChronoDuration::from_std(max_age)
                .unwrap_or_else(|_| ChronoDuration::minutes(30)),
            max_samples: max_samples.max(1),
            buffer: VecDeque::new(),
        }
    }

    /// Records a reading. Returns false when a sample with the same
    /// timestamp is already held.
    pub fn push(&mut self, reading: &Reading) -> bool {
        if self
            .buffer
            .iter()
            .any(|entry| entry.timestamp == reading.timestamp)
        {
            return false;
        }

        let sample = WindowSample {
            timestamp: reading.timestamp,
            temperature: reading.temperature,
            humidity: reading.humidity,
            air_quality: reading.air_quality,
        };
        let at = self
            .buffer
            .iter()
            .rposition(|entry| entry.timestamp < sample.timestamp)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        self.buffer.insert(at, sample);
        self.evict();
        true
    }

    fn evict(&mut self) {
        let Some(newest) = self.buffer.back().map(|entry| entry.timestamp) else {
            return;
        };
        // no age cutoff when the window reaches past the earliest representable time
        let cutoff = newest.checked_sub_signed(self.max_age);
        while let Some(front) = self.buffer.front() {
            let expired = cutoff.is_some_and(|cutoff| front.timestamp < cutoff);
            if expired || self.buffer.len() > self.max_samples {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Temperature/humidity pairs from samples that carry both.
    pub fn paired_temperature_humidity(&self) -> (Vec<f64>, Vec<f64>) {
        self.buffer
            .iter()
            .filter_map(|entry| Some((entry.temperature?, entry.humidity?)))
            .unzip()
    }

    pub fn count_air_quality_above(&self, threshold_ppm: f64) -> usize {
        self.buffer
            .iter()
            .filter_map(|entry| entry.air_quality)
            .filter(|value| *value > threshold_ppm)
            .count()
    }
}

use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Key/value pair attached to a finished stage.
#[derive(Debug, Clone)]
pub enum StageValue {
    U64(u64),
    Text(String),
}

impl From<usize> for StageValue {
    fn from(value: usize) -> Self {
        StageValue::U64(value as u64)
    }
}

impl From<u64> for StageValue {
    fn from(value: u64) -> Self {
        StageValue::U64(value)
    }
}

impl From<&str> for StageValue {
    fn from(value: &str) -> Self {
        StageValue::Text(value.to_owned())
    }
}

impl std::fmt::Display for StageValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageValue::U64(v) => write!(f, "{v}"),
            StageValue::Text(v) => f.write_str(v),
        }
    }
}

/// Measurement for one compilation stage.
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub stage: &'static str,
    pub duration: Duration,
    pub fields: Vec<(&'static str, StageValue)>,
}

impl StageEvent {
    pub fn add_field<V: Into<StageValue>>(&mut self, key: &'static str, value: V) {
        self.fields.push((key, value.into()));
    }
}

/// Wall-clock timer for a named stage. Finished timers are logged at debug level; with the
/// `bench-metrics` feature every field is also traced individually.
pub struct Timer {
    stage: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// Closes the stage and returns its duration.
    pub fn finish<F>(self, update: F) -> Duration
    where
        F: FnOnce(&mut StageEvent),
    {
        let mut event = StageEvent {
            stage: self.stage,
            duration: self.start.elapsed(),
            fields: Vec::new(),
        };
        update(&mut event);
        debug!(
            stage = event.stage,
            elapsed_us = event.duration.as_micros() as u64,
            fields = event.fields.len(),
            "stage finished"
        );
        if cfg!(feature = "bench-metrics") {
            for (key, value) in &event.fields {
                trace!(stage = event.stage, key = *key, value = %value, "stage field");
            }
        }
        event.duration
    }
}

/// Counters accumulated over one prompt compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub images: usize,
    pub skipped_images: usize,
    pub vision_rows: usize,
    pub text_tokens: usize,
    pub vision_us: u64,
}

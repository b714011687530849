//! Progress parsing and throttled reporting.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::core::events::{Phase, ProgressEvent};
use crate::core::TaskKey;

/// Matches `NN%` and `NN.N%` markers in tool output.
fn percent_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").ok())
        .as_ref()
}

/// Extracts the last percent marker on a line, if it is within 0-100.
pub fn parse_percent(line: &str) -> Option<f32> {
    let value: f32 = percent_pattern()?
        .captures_iter(line)
        .last()?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// Maps a stage-local percentage onto the `[start, end]` slice of overall progress.
pub fn map_to_range(stage_percent: f32, start: u8, end: u8) -> u8 {
    let clamped = stage_percent.clamp(0.0, 100.0);
    let span = f32::from(end.saturating_sub(start));
    (f32::from(start) + span * clamped / 100.0).round().min(f32::from(end)) as u8
}

/// Receives every progress event that passes the throttle.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Per-task progress emitter.
///
/// Within a phase, percent never decreases and at most one event is emitted
/// per interval. Phase changes and 100% are always emitted.
pub struct ProgressReporter {
    task_key: TaskKey,
    sink: ProgressSink,
    interval: Duration,
    last_phase: Option<Phase>,
    last_percent: u8,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(task_key: impl Into<TaskKey>, interval: Duration, sink: ProgressSink) -> Self {
        Self {
            task_key: task_key.into(),
            sink,
            interval,
            last_phase: None,
            last_percent: 0,
            last_emit: None,
        }
    }

    /// Reporter that discards everything.
    pub fn noop(task_key: impl Into<TaskKey>) -> Self {
        Self::new(task_key, Duration::ZERO, Arc::new(|_| {}))
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }

    /// Reports progress. Returns true when an event was emitted.
    pub fn report(&mut self, phase: Phase, percent: u8, message: Option<String>) -> bool {
        let percent = percent.min(100);
        let now = Instant::now();

        if self.last_phase == Some(phase) {
            if percent <= self.last_percent {
                return false;
            }
            let throttled = self
                .last_emit
                .is_some_and(|last| now.duration_since(last) < self.interval);
            if throttled && percent < 100 {
                return false;
            }
        }

        self.last_phase = Some(phase);
        self.last_percent = percent;
        self.last_emit = Some(now);

        let mut event = ProgressEvent::new(self.task_key.clone(), phase, percent);
        event.message = message;
        (self.sink)(event);
        true
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_key", &self.task_key)
            .field("interval", &self.interval)
            .field("last_phase", &self.last_phase)
            .field("last_percent", &self.last_percent)
            .finish()
    }
}

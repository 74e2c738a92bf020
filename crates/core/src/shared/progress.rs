use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives progress fractions for a running compression.
///
/// Called from a background copy thread, never from the caller's thread.
/// `identifier` is whatever the caller passed in its options.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, fraction: f64, identifier: Option<&str>);
}

impl<F> ProgressSink for F
where
    F: Fn(f64, Option<&str>) + Send + Sync,
{
    fn on_progress(&self, fraction: f64, identifier: Option<&str>) {
        self(fraction, identifier)
    }
}

/// Fraction of the asset covered by a sample at `timestamp`, clamped to [0, 1].
///
/// A non-positive or non-finite duration yields 0.
pub fn progress_fraction(timestamp: f64, duration: f64) -> f64 {
    if !(duration.is_finite() && duration > 0.0) || !timestamp.is_finite() {
        return 0.0;
    }
    (timestamp / duration).clamp(0.0, 1.0)
}

/// Per-operation reporter that keeps reported values non-decreasing.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    identifier: Option<String>,
    duration: f64,
    last: f64,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, identifier: Option<String>, duration: f64) -> Self {
        Self {
            sink,
            identifier,
            duration,
            last: 0.0,
        }
    }

    pub fn report(&mut self, timestamp: f64) {
        let fraction = progress_fraction(timestamp, self.duration).max(self.last);
        self.emit(fraction);
    }

    pub fn complete(&mut self) {
        self.emit(1.0);
    }

    fn emit(&mut self, fraction: f64) {
        self.last = fraction;
        self.sink.on_progress(fraction, self.identifier.as_deref());
    }
}

/// Logs progress through the `log` crate, throttled to every `step_percent`.
///
/// Throttling is tracked per identifier, so one sink can be shared by
/// concurrent operations.
pub struct LogProgressSink {
    step_percent: u32,
    last_logged: Mutex<HashMap<Option<String>, u32>>,
}

impl LogProgressSink {
    pub fn new(step_percent: u32) -> Self {
        Self {
            step_percent: step_percent.max(1),
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the percentage bucket to log for `fraction`, if it is new
    /// for `identifier`.
    fn bucket_to_log(&self, fraction: f64, identifier: Option<&str>) -> Option<u32> {
        let percent = (fraction * 100.0).floor() as u32;
        let bucket = percent / self.step_percent * self.step_percent;
        let mut last = self.last_logged.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(&identifier.map(str::to_string)) {
            Some(&prev) if prev >= bucket => None,
            _ => {
                last.insert(identifier.map(str::to_string), bucket);
                Some(bucket)
            }
        }
    }
}

impl Default for LogProgressSink {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressSink for LogProgressSink {
    fn on_progress(&self, fraction: f64, identifier: Option<&str>) {
        if let Some(bucket) = self.bucket_to_log(fraction, identifier) {
            match identifier {
                Some(id) => log::info!("Compressing {id}: {bucket}%"),
                None => log::info!("Compressing: {bucket}%"),
            }
        }
    }
}

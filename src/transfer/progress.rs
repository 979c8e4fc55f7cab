//! Byte progress tracking for streamed bodies.
//!
//! [`ByteProgress`] decides when a progress line is worth logging (every 10%
//! or once per interval for bodies without a known length).
//! [`TransferObserver`] lets a front end mirror progress, e.g. with
//! `indicatif` bars.

use std::path::Path;
use std::time::{Duration, Instant};

use super::TransferState;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const MIN_PERCENTAGE_STEP: f64 = 10.0;

/// Receives transfer events; all methods default to no-ops
pub trait TransferObserver: Send + Sync {
    /// A transfer moved to `state`
    fn on_state(&self, _target: &Path, _state: TransferState) {}

    /// Streaming started; `total` is the announced body length
    fn on_start(&self, _target: &Path, _total: Option<u64>) {}

    /// `bytes` more bytes were written
    fn on_bytes(&self, _target: &Path, _bytes: u64) {}

    /// The transfer ended, successfully or not
    fn on_finish(&self, _target: &Path, _success: bool) {}
}

/// Progress of one streamed body
#[derive(Debug, Clone)]
pub struct ByteProgress {
    /// Bytes written so far
    pub bytes: u64,
    /// Announced length, if any
    pub total: Option<u64>,
    start_time: Instant,
    last_update: Instant,
    update_interval: Duration,
    last_reported_percentage: f64,
}

impl ByteProgress {
    /// Start tracking a body of `total` bytes
    pub fn new(total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes: 0,
            total,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            last_reported_percentage: 0.0,
        }
    }

    /// Record written bytes
    pub fn update(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Completion in percent when the length is known
    pub fn percentage(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes as f64 / total as f64 * 100.0).min(100.0)
            }
        })
    }

    /// Average rate in bytes per second
    pub fn rate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Whether a log line is due
    pub fn should_emit_update(&self) -> bool {
        if self.bytes == 0 {
            return false;
        }
        match self.percentage() {
            Some(pct) => pct - self.last_reported_percentage >= MIN_PERCENTAGE_STEP,
            None => self.last_update.elapsed() >= self.update_interval,
        }
    }

    /// Reset the emission window after logging
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Human readable progress line
    pub fn format(&self) -> String {
        let rate = format_bytes(self.rate() as u64);
        match (self.percentage(), self.total) {
            (Some(pct), Some(total)) => format!(
                "{:.0}% ({} / {}) at {}/s",
                pct,
                format_bytes(self.bytes),
                format_bytes(total),
                rate
            ),
            _ => format!("{} at {}/s", format_bytes(self.bytes), rate),
        }
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_steps() {
        let mut progress = ByteProgress::new(Some(1000));
        assert!(!progress.should_emit_update());
        progress.update(50);
        assert!(!progress.should_emit_update());
        progress.update(60);
        assert!(progress.should_emit_update());
        progress.mark_emitted();
        assert!(!progress.should_emit_update());
        progress.update(2000);
        assert_eq!(progress.percentage(), Some(100.0));
    }

    #[test]
    fn test_unknown_length_has_no_percentage() {
        let mut progress = ByteProgress::new(None);
        progress.update(10);
        assert!(progress.percentage().is_none());
        assert!(progress.format().starts_with("10 B"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}

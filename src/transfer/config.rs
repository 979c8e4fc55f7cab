//! Transfer configuration constants

use std::time::Duration;

/// Maximum number of redirect hops followed per request.
/// Provider download links chain through at most a few hops (catalogue,
/// zipper/CDN, signed storage URL); a 6th hop is treated as a loop.
pub const MAX_REDIRECTS: u32 = 5;

/// Maximum number of retries for transient failures.
/// 5 retries with exponential backoff recovers from short outages
/// while bounding the total wait to about one minute.
pub const MAX_RETRIES: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
/// Caps the doubling so retry 5 (32s) waits 30s.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Allowed positional character differences between the catalogue name and
/// the name found inside an archive.
pub const NAME_TOLERANCE: usize = 1;

/// Write buffer size for streamed bodies.
pub const CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Suffix of in-flight files; renamed into place only on success.
pub const PARTIAL_SUFFIX: &str = "part";

/// Calculate exponential backoff delay
pub fn calculate_backoff(retry_count: u32) -> Duration {
    backoff_between(retry_count, Duration::from_millis(INITIAL_BACKOFF_MS), Duration::from_millis(MAX_BACKOFF_MS))
}

fn backoff_between(retry_count: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    initial.saturating_mul(factor).min(max)
}

/// Tunables of the transfer engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Retries for transient failures (5xx, 429, network)
    pub max_retries: u32,
    /// First backoff delay, doubled on every retry
    pub initial_backoff: Duration,
    /// Upper bound of a single backoff delay
    pub max_backoff: Duration,
    /// Redirect hops followed before failing with a loop error
    pub max_redirects: u32,
    /// Re-authentications allowed per transfer after an auth failure
    pub max_reauthentications: u32,
    /// Positional name difference tolerated after unpacking
    pub name_tolerance: usize,
    /// Wall-clock budget of one transfer including retries
    pub deadline: Option<Duration>,
}

impl TransferConfig {
    /// Backoff before retry number `retry_count` (0-based)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        backoff_between(retry_count, self.initial_backoff, self.max_backoff)
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the backoff window
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Abort transfers that take longer than `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            max_redirects: MAX_REDIRECTS,
            max_reauthentications: 1,
            name_tolerance: NAME_TOLERANCE,
            deadline: None,
        }
    }
}

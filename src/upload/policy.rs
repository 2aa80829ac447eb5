use std::time::Duration;

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Limits and timings of the upload pipeline. Durations are given in seconds
/// when loaded from a config file.
#[serde_as]
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UploadPolicy {
    /// Hard ceiling per file, in bytes.
    pub max_file_size: u64,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub attempt_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stall_window: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_backoff: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            stall_window: DEFAULT_STALL_WINDOW,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl UploadPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// How a single attempt ended, when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("attempt timed out")]
    Timeout,
    #[error("server responded with status {status}: {message}")]
    Server { status: u16, message: String },
    #[error("aborted")]
    Aborted,
}

impl AttemptFailure {
    /// Only transport failures are retried. A received response, whatever its
    /// status, is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

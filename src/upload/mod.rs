//! Resilient record upload
//!
//! Drives one multipart create/update of a record through a [`Transport`],
//! reporting progress, flagging stalls and retrying transport failures with a
//! fixed backoff until the configured attempt ceiling is reached.

mod policy;
mod request;
mod session;
mod transport;

use serde::{Deserialize, Serialize};

pub use policy::{
    AttemptFailure, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF, DEFAULT_STALL_WINDOW, UploadPolicy,
};
pub use request::{BlobSource, FileBlob, UploadRequest};
pub use session::{CancelHandle, Outcome, UploadSession, Uploader};
pub use transport::{AttemptRequest, Method, RETRY_COUNT_HEADER, Transport, TransportEvent};

/// Record returned by the store. Treated as opaque apart from its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(serde_json::Value);

impl Record {
    pub fn id(&self) -> Option<&str> {
        self.0.get("id")?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Uploaded {
    pub record: Record,
    /// Number of attempts made, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("missing required file: {0}")]
    MissingFile(String),
    #[error("file {field} is {size} bytes, exceeding the limit of {limit} bytes")]
    FileTooLarge { field: String, size: u64, limit: u64 },
    #[error("base url cannot hold a record path: {0}")]
    InvalidBaseUrl(url::Url),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Precondition(PreconditionError),
    #[error("server responded with status {status}: {message}")]
    Server { status: u16, message: String },
    #[error("upload failed after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },
    #[error("upload was aborted")]
    Aborted,
}

impl UploadError {
    /// Cancellation is not a failure the user has to act on.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

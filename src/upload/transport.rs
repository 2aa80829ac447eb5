use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;

use super::UploadRequest;

/// Header carrying the 0-based attempt index of a submission.
pub const RETRY_COUNT_HEADER: &str = "X-Retry-Count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Patch,
}

/// Everything a transport needs to perform one attempt.
#[derive(derive_debug::Dbg, Clone)]
pub struct AttemptRequest {
    pub method: Method,
    pub url: url::Url,
    #[dbg(skip)]
    pub authorization: Option<String>,
    pub attempt: u32,
    pub request: Arc<UploadRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes of the body handed to the connection so far.
    Progress { sent: u64, total: u64 },
    /// A response was received, whatever its status.
    Completed {
        status: u16,
        reason: String,
        body: Bytes,
    },
    /// The request could not be completed (connection refused, reset, DNS...).
    Failed(String),
}

/// Capability to perform a single multipart submission.
///
/// The returned stream yields any number of `Progress` events followed by at
/// most one `Completed` or `Failed`. Dropping the stream aborts the
/// operation.
pub trait Transport {
    type Events: Stream<Item = TransportEvent> + Send + Unpin + 'static;

    fn send(&self, request: AttemptRequest) -> Self::Events;
}

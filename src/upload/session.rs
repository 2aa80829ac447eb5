use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
};

use futures::StreamExt as _;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{auth::AuthStore, progress::ProgressReporter, record_store::records_url};

use super::{
    AttemptFailure, AttemptRequest, Method, PreconditionError, Record, Transport, TransportEvent,
    UploadError, UploadPolicy, UploadRequest, Uploaded,
};

/// Final result of a session.
pub type Outcome = Result<Uploaded, UploadError>;

/// Submits upload requests through a transport.
pub struct Uploader<T> {
    transport: Arc<T>,
    base_url: Url,
    auth: AuthStore,
    policy: UploadPolicy,
}

impl<T> Clone for Uploader<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            base_url: self.base_url.clone(),
            auth: self.auth.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<T: Transport + Send + Sync + 'static> Uploader<T> {
    pub fn new(transport: T, base_url: Url, auth: AuthStore, policy: UploadPolicy) -> Self {
        Self {
            transport: Arc::new(transport),
            base_url,
            auth,
            policy,
        }
    }

    /// Start a session for `request`. Nothing happens until the returned
    /// session is awaited.
    pub fn submit(
        &self,
        request: UploadRequest,
        reporter: Arc<dyn ProgressReporter>,
    ) -> UploadSession {
        let cancel = CancellationToken::new();
        let driver = Driver {
            transport: self.transport.clone(),
            base_url: self.base_url.clone(),
            auth: self.auth.clone(),
            policy: self.policy.clone(),
            request: Arc::new(request),
            reporter,
            cancel: cancel.clone(),
            high_water: 0,
            finished: false,
        };
        UploadSession {
            cancel: CancelHandle(cancel),
            outcome: Box::pin(driver.run()),
        }
    }
}

/// Requests cancellation of a session. Cheap to clone; cancelling a finished
/// session does nothing.
#[derive(Clone, Debug)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// One logical upload. Await it for the outcome.
pub struct UploadSession {
    cancel: CancelHandle,
    outcome: Pin<Box<dyn Future<Output = Outcome> + Send>>,
}

impl UploadSession {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl IntoFuture for UploadSession {
    type Output = Outcome;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome
    }
}

/// Per-attempt bookkeeping, dropped when the attempt ends.
struct AttemptState {
    number: u32,
    started_at: Instant,
    bytes_sent: u64,
    bytes_total: u64,
    last_progress_at: Instant,
    stalled: bool,
}

impl AttemptState {
    fn new(number: u32, bytes_total: u64) -> Self {
        let now = Instant::now();
        Self {
            number,
            started_at: now,
            bytes_sent: 0,
            bytes_total,
            last_progress_at: now,
            stalled: false,
        }
    }

    fn record_progress(&mut self, sent: u64, total: u64) {
        self.bytes_sent = sent;
        self.bytes_total = total;
        self.last_progress_at = Instant::now();
        self.stalled = false;
    }

    /// Never 100: completion is only signalled once the server has answered.
    fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }
        let sent = self.bytes_sent.min(self.bytes_total) as u128;
        let percent = sent * 100 / self.bytes_total as u128;
        percent.min(99) as u8
    }
}

enum Step {
    Cancelled,
    Event(Option<TransportEvent>),
    TimedOut,
    Stalled,
}

struct Driver<T> {
    transport: Arc<T>,
    base_url: Url,
    auth: AuthStore,
    policy: UploadPolicy,
    request: Arc<UploadRequest>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    high_water: u8,
    finished: bool,
}

impl<T: Transport> Driver<T> {
    fn report(&mut self, percent: u8, status: Option<&str>) {
        if self.finished {
            return;
        }
        let percent = percent.max(self.high_water);
        if percent == self.high_water && status.is_none() {
            return;
        }
        self.high_water = percent;
        self.reporter.report(percent, status);
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        match &outcome {
            Ok(uploaded) => {
                self.report(100, None);
                info!(
                    collection = %self.request.collection,
                    id = uploaded.record.id().unwrap_or_default(),
                    attempts = uploaded.attempts,
                    "upload completed"
                );
            }
            Err(UploadError::Aborted) => {
                info!(collection = %self.request.collection, "upload aborted");
            }
            Err(error) => {
                warn!(collection = %self.request.collection, %error, "upload failed");
            }
        }
        self.finished = true;
        outcome
    }

    async fn run(mut self) -> Outcome {
        let outcome = self.drive().await;
        self.finish(outcome)
    }

    async fn drive(&mut self) -> Outcome {
        self.request
            .check(&self.policy)
            .map_err(UploadError::Precondition)?;
        let (method, url) = self.endpoint()?;
        let max_attempts = self.policy.max_attempts();

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Aborted);
            }
            let failure = match self.attempt(attempt, method, &url).await {
                Ok(record) => {
                    return Ok(Uploaded {
                        record,
                        attempts: attempt + 1,
                    });
                }
                Err(failure) => failure,
            };
            let failure = match failure {
                AttemptFailure::Aborted => return Err(UploadError::Aborted),
                AttemptFailure::Server { status, message } => {
                    return Err(UploadError::Server { status, message });
                }
                retryable @ (AttemptFailure::Network(_) | AttemptFailure::Timeout) => retryable,
            };
            warn!(attempt, error = %failure, "upload attempt failed");
            if attempt >= self.policy.max_retries {
                return Err(UploadError::Network {
                    attempts: attempt + 1,
                    message: failure.to_string(),
                });
            }

            attempt += 1;
            if self.request.is_create() {
                warn!(
                    collection = %self.request.collection,
                    attempt,
                    "retrying a create; the store may end up with a duplicate record"
                );
            }
            let status = format!("retrying, attempt {} of {max_attempts}", attempt + 1);
            self.report(self.high_water, Some(&status));
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Aborted),
                _ = sleep(self.policy.retry_backoff) => {}
            }
        }
    }

    fn endpoint(&self) -> Result<(Method, Url), UploadError> {
        let method = match self.request.record_id {
            Some(_) => Method::Patch,
            None => Method::Post,
        };
        let url = records_url(
            &self.base_url,
            &self.request.collection,
            self.request.record_id.as_deref(),
        )
        .ok_or_else(|| {
            UploadError::Precondition(PreconditionError::InvalidBaseUrl(self.base_url.clone()))
        })?;
        Ok((method, url))
    }

    async fn attempt(
        &mut self,
        number: u32,
        method: Method,
        url: &Url,
    ) -> Result<Record, AttemptFailure> {
        let request = AttemptRequest {
            method,
            url: url.clone(),
            authorization: self.auth.token(),
            attempt: number,
            request: self.request.clone(),
        };
        debug!(?request, "starting upload attempt");
        let mut state = AttemptState::new(number, self.request.total_file_bytes());
        let mut events = self.transport.send(request);
        let deadline = state.started_at + self.policy.attempt_timeout;

        loop {
            let stall_at = state.last_progress_at + self.policy.stall_window;
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                event = events.next() => Step::Event(event),
                _ = sleep_until(deadline) => Step::TimedOut,
                _ = sleep_until(stall_at), if !state.stalled => Step::Stalled,
            };
            match step {
                Step::Cancelled => return Err(AttemptFailure::Aborted),
                Step::TimedOut => {
                    warn!(
                        attempt = state.number,
                        elapsed = ?state.started_at.elapsed(),
                        "upload attempt timed out"
                    );
                    return Err(AttemptFailure::Timeout);
                }
                Step::Stalled => {
                    state.stalled = true;
                    warn!(
                        attempt = state.number,
                        sent = state.bytes_sent,
                        total = state.bytes_total,
                        "upload appears stalled"
                    );
                    self.report(self.high_water, Some("upload appears stalled"));
                }
                Step::Event(Some(TransportEvent::Progress { sent, total })) => {
                    trace!(attempt = state.number, sent, total, "upload progress");
                    state.record_progress(sent, total);
                    self.report(state.percent(), None);
                }
                Step::Event(Some(TransportEvent::Completed {
                    status,
                    reason,
                    body,
                })) => {
                    if !(200..300).contains(&status) {
                        return Err(AttemptFailure::Server {
                            status,
                            message: response_message(&reason, &body),
                        });
                    }
                    return serde_json::from_slice::<Record>(&body).map_err(|error| {
                        let payload = format!("invalid record payload: {error}");
                        AttemptFailure::Server {
                            status,
                            message: response_message(&reason, payload.as_bytes()),
                        }
                    });
                }
                Step::Event(Some(TransportEvent::Failed(message))) => {
                    return Err(AttemptFailure::Network(message));
                }
                Step::Event(None) => {
                    return Err(AttemptFailure::Network(
                        "connection closed before a response was received".to_owned(),
                    ));
                }
            }
        }
    }
}

fn response_message(reason: &str, body: &[u8]) -> String {
    let body = String::from_utf8_lossy(body);
    let body = body.trim();
    match (reason.is_empty(), body.is_empty()) {
        (_, true) => reason.to_owned(),
        (true, false) => body.to_owned(),
        (false, false) => format!("{reason}: {body}"),
    }
}

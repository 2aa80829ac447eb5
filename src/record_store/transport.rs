use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt as _, TryStreamExt as _, stream::BoxStream};
use reqwest::multipart::{Form, Part};
use tokio::{io::AsyncReadExt as _, sync::mpsc, task::AbortHandle};
use tracing::{debug, warn};

use crate::upload::{
    AttemptRequest, BlobSource, FileBlob, Method, RETRY_COUNT_HEADER, Transport, TransportEvent,
    UploadRequest,
};

use super::RecordStore;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("{0}")]
    Http(reqwest::Error),
    #[error("failed to read file {file}: {error}")]
    Read { file: String, error: std::io::Error },
}

/// Events of one HTTP submission. Dropping it aborts the request.
pub struct HttpEvents {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    task: AbortHandle,
}

impl Stream for HttpEvents {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for HttpEvents {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
struct ByteCounter {
    sent: Arc<AtomicU64>,
    total: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ByteCounter {
    fn advance(&self, len: usize) {
        let sent = self.sent.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
        // receiver gone means the attempt was abandoned
        let _ = self.events.send(TransportEvent::Progress {
            sent,
            total: self.total,
        });
    }
}

impl Transport for RecordStore {
    type Events = HttpEvents;

    fn send(&self, request: AttemptRequest) -> HttpEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            let event = match submit(client, request, tx.clone()).await {
                Ok(event) => event,
                Err(error) => TransportEvent::Failed(error.to_string()),
            };
            let _ = tx.send(event);
        });
        HttpEvents {
            events: rx,
            task: task.abort_handle(),
        }
    }
}

async fn submit(
    client: reqwest::Client,
    request: AttemptRequest,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<TransportEvent, SendError> {
    let counter = ByteCounter {
        sent: Arc::new(AtomicU64::new(0)),
        total: request.request.total_file_bytes(),
        events,
    };
    let form = build_form(&request.request, &counter).await?;
    let method = match request.method {
        Method::Post => reqwest::Method::POST,
        Method::Patch => reqwest::Method::PATCH,
    };
    let mut builder = client
        .request(method, request.url)
        .header(RETRY_COUNT_HEADER, request.attempt.to_string())
        .multipart(form);
    if let Some(token) = &request.authorization {
        builder = builder.header(reqwest::header::AUTHORIZATION, token);
    }
    let response = builder
        .send()
        .await
        .inspect_err(|error| warn!(%error, attempt = request.attempt, "record store unreachable"))
        .map_err(SendError::Http)?;
    let status = response.status();
    debug!(%status, attempt = request.attempt, "record store responded");
    // the store has answered, so a broken body must not turn into a retry
    let (reason, body) = match response.bytes().await {
        Ok(body) => (
            status.canonical_reason().unwrap_or_default().to_owned(),
            body,
        ),
        Err(error) => {
            warn!(%error, %status, attempt = request.attempt, "failed to read response body");
            (format!("response body interrupted: {error}"), Bytes::new())
        }
    };
    Ok(TransportEvent::Completed {
        status: status.as_u16(),
        reason,
        body,
    })
}

async fn build_form(request: &UploadRequest, counter: &ByteCounter) -> Result<Form, SendError> {
    let mut form = Form::new();
    for (name, value) in &request.fields {
        form = form.text(name.clone(), value.clone());
    }
    for (name, blob) in &request.files {
        form = form.part(name.clone(), file_part(blob, counter.clone()).await?);
    }
    Ok(form)
}

async fn file_part(blob: &FileBlob, counter: ByteCounter) -> Result<Part, SendError> {
    let chunks = match &blob.source {
        BlobSource::Memory(data) => memory_chunks(data.clone()),
        BlobSource::File { path, .. } => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|error| SendError::Read {
                    file: path.display().to_string(),
                    error,
                })?;
            file_chunks(file)
        }
    };
    let chunks = chunks.inspect_ok(move |chunk| counter.advance(chunk.len()));
    Part::stream_with_length(reqwest::Body::wrap_stream(chunks), blob.size())
        .file_name(blob.file_name.clone())
        .mime_str(blob.content_type.as_ref())
        .map_err(SendError::Http)
}

fn memory_chunks(data: Bytes) -> BoxStream<'static, std::io::Result<Bytes>> {
    let len = data.len();
    futures::stream::iter(
        (0..len)
            .step_by(CHUNK_SIZE)
            .map(move |start| Ok(data.slice(start..(start + CHUNK_SIZE).min(len)))),
    )
    .boxed()
}

fn file_chunks(file: tokio::fs::File) -> BoxStream<'static, std::io::Result<Bytes>> {
    futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0; CHUNK_SIZE];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some((Bytes::from(buf), file)))
    })
    .boxed()
}

//! A single enclosure transfer: streamed to a temp file, optionally resumed
//! with a Range request, verified, and atomically published into the library.

use futures::StreamExt;
use reqwest::{header, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::events::{EngineEvent, Events};
use crate::library::remove_file_quietly;
use crate::store::{Database, Item};

/// Timeout for receiving response headers. The body itself may stream for as
/// long as it keeps making progress.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Emit progress (db + event) at most once per this many bytes.
const PROGRESS_STRIDE: u64 = 512 * 1024;
/// Allowed relative deviation between the feed-declared enclosure size and
/// the bytes actually received. Feeds routinely mis-declare by a little; a
/// large deviation suggests corruption or a swapped file.
const DECLARED_SIZE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS, connection, TLS, mid-body reset)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// No response headers within the timeout
    #[error("Request timed out")]
    Timeout,
    /// Non-success HTTP status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Received size deviates from the declared enclosure size beyond
    /// tolerance
    #[error("Declared size {declared} but received {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    /// Enclosure URL is not something we download
    #[error("Unsupported enclosure URL: {0}")]
    UnsupportedEnclosure(String),
    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Body ended short of Content-Length
    #[error("Incomplete body: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
    /// Torn down by cancellation; temp file already removed
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the failure is worth another attempt. Cancellation is not a
    /// failure and is handled before this is consulted.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_)
            | TransferError::Timeout
            | TransferError::Io(_)
            | TransferError::Incomplete { .. } => true,
            // 416 means our resume offset went stale; the temp was removed,
            // so the next attempt restarts clean.
            TransferError::HttpStatus(status) => {
                *status >= 500 || *status == 429 || *status == 416
            }
            TransferError::SizeMismatch { .. }
            | TransferError::UnsupportedEnclosure(_)
            | TransferError::Cancelled => false,
        }
    }
}

/// Result of a finished transfer, ready to record on the item.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub file_path: PathBuf,
    pub file_size: u64,
}

/// Run one transfer to completion, cancellation, or failure.
///
/// Writes stream into `temp_path`. If a previous attempt left bytes there,
/// the server is offered a Range request and the file is appended on 206;
/// a 200 means the server ignored the range and the file restarts from
/// zero. On success the verified temp file is renamed to `final_path` —
/// the only way a file ever appears under its final name.
///
/// Teardown discipline: whatever the outcome, the temp file handle is
/// closed before this function returns, so the item can safely re-enter
/// the queue with no second writer possible. The temp file itself is kept
/// only for retryable failures (resume); cancellation and non-retryable
/// failures remove it.
pub async fn run(
    client: &reqwest::Client,
    db: &Database,
    events: &Events,
    item: &Item,
    temp_path: &Path,
    final_path: &Path,
    cancel: &CancellationToken,
) -> Result<CompletedTransfer, TransferError> {
    let result = stream_to_temp(client, db, events, item, temp_path, cancel).await;

    match result {
        Ok(received) => {
            if let Some(declared) = item.enclosure.length.filter(|l| *l > 0) {
                let declared = declared as u64;
                let deviation =
                    (received as f64 - declared as f64).abs() / declared as f64;
                if deviation > DECLARED_SIZE_TOLERANCE {
                    remove_file_quietly(temp_path).await;
                    return Err(TransferError::SizeMismatch {
                        declared,
                        actual: received,
                    });
                }
            }

            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(temp_path, final_path).await?;

            Ok(CompletedTransfer {
                file_path: final_path.to_path_buf(),
                file_size: received,
            })
        }
        Err(e) => {
            match &e {
                // Keep the partial file so a retry can resume
                TransferError::Network(_)
                | TransferError::Timeout
                | TransferError::Incomplete { .. } => {}
                _ => remove_file_quietly(temp_path).await,
            }
            Err(e)
        }
    }
}

/// Stream the enclosure body into the temp file. Returns total bytes on
/// disk (offset + streamed).
async fn stream_to_temp(
    client: &reqwest::Client,
    db: &Database,
    events: &Events,
    item: &Item,
    temp_path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let url = &item.enclosure.url;
    match Url::parse(url).map(|u| u.scheme().to_ascii_lowercase()) {
        Ok(scheme) if scheme == "http" || scheme == "https" => {}
        _ => return Err(TransferError::UnsupportedEnclosure(url.clone())),
    }

    // Resume from whatever a previous attempt actually persisted; the file
    // is the source of truth, not the bookkeeping column.
    let mut offset = match tokio::fs::metadata(temp_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(header::RANGE, format!("bytes={offset}-"));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            remove_file_quietly(temp_path).await;
            return Err(TransferError::Cancelled);
        }
        response = tokio::time::timeout(RESPONSE_TIMEOUT, request.send()) => {
            response.map_err(|_| TransferError::Timeout)?.map_err(TransferError::Network)?
        }
    };

    let resuming = match response.status() {
        StatusCode::PARTIAL_CONTENT if offset > 0 => true,
        StatusCode::OK => false,
        status if status.is_success() => false,
        status => {
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                // Stale offset; restart clean next attempt
                remove_file_quietly(temp_path).await;
            }
            return Err(TransferError::HttpStatus(status.as_u16()));
        }
    };
    if !resuming {
        offset = 0;
    }

    let body_expected = response.content_length();
    let bytes_expected = item
        .enclosure
        .length
        .filter(|l| *l > 0)
        .map(|l| l as u64)
        .or(body_expected.map(|len| offset + len));

    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(resuming)
        .truncate(!resuming)
        .open(temp_path)
        .await?;

    let mut stream = response.bytes_stream();
    let mut total = offset;
    let mut since_progress: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                // Deterministic teardown: close the handle, drop the temp
                file.flush().await.ok();
                drop(file);
                remove_file_quietly(temp_path).await;
                return Err(TransferError::Cancelled);
            }
            chunk = stream.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                file.flush().await.ok();
                return Err(TransferError::Network(e));
            }
            None => break,
        };

        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
        since_progress += chunk.len() as u64;

        if since_progress >= PROGRESS_STRIDE {
            since_progress = 0;
            if let Err(e) = db.update_transfer_progress(item.id, total as i64).await {
                tracing::debug!(item_id = item.id, error = %e, "Progress update failed");
            }
            events.emit(EngineEvent::DownloadProgress {
                item_id: item.id,
                bytes_downloaded: total,
                bytes_expected,
            });
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    // A short body relative to Content-Length is a truncated connection
    if let Some(expected) = body_expected {
        let streamed = total - offset;
        if streamed < expected {
            if let Err(e) = db.update_transfer_progress(item.id, total as i64).await {
                tracing::debug!(item_id = item.id, error = %e, "Progress update failed");
            }
            return Err(TransferError::Incomplete {
                expected,
                received: streamed,
            });
        }
    }

    Ok(total)
}

use futures::StreamExt;
use reqwest::header;
use std::time::Duration;
use thiserror::Error;

use crate::store::Validators;

/// Per-request timeout for feed fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Feed documents larger than this are rejected outright — a feed is
/// metadata, not media.
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors from a single feed fetch. All of them are recorded on the owning
/// subscription and drive poll backoff; none are fatal to the engine.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the fetch timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the feed size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Result of one conditional feed fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The source answered 304 from our validators. Counts as a successful
    /// poll; there is nothing to parse.
    NotModified,
    /// Fresh document bytes plus the validators to present next time.
    Fetched {
        bytes: Vec<u8>,
        validators: Validators,
    },
}

/// Fetch a feed document with a conditional GET.
///
/// Stored validators are presented as `If-None-Match` / `If-Modified-Since`;
/// a 304 comes back as [`FetchOutcome::NotModified`]. The body read is
/// streamed with a hard size cap and checked against Content-Length so a
/// truncated response is surfaced instead of parsed.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    validators: &Validators,
) -> Result<FetchOutcome, FetchError> {
    fetch_feed_with_limit(client, url, validators, MAX_FEED_SIZE).await
}

async fn fetch_feed_with_limit(
    client: &reqwest::Client,
    url: &str,
    validators: &Validators,
    limit: usize,
) -> Result<FetchOutcome, FetchError> {
    let mut request = client.get(url);
    if let Some(etag) = &validators.etag {
        request = request.header(header::IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = &validators.last_modified {
        request = request.header(header::IF_MODIFIED_SINCE, last_modified);
    }

    let response = tokio::time::timeout(FETCH_TIMEOUT, request.send())
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Network)?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified);
    }
    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    let fresh = response_validators(&response);
    let bytes = read_limited_bytes(response, limit).await?;

    Ok(FetchOutcome::Fetched {
        bytes,
        validators: fresh,
    })
}

fn response_validators(response: &reqwest::Response) -> Validators {
    let header_str = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Validators {
        etag: header_str(header::ETAG),
        last_modified: header_str(header::LAST_MODIFIED),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for the completeness check
    let expected_length = response.content_length();

    // Fast path: reject on the declared length before reading anything
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A network interruption mid-body shows up as a short read; surface it
    // so the next poll retries instead of parsing a truncated document.
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Default budget for one fetch, headers and body included
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default `User-Agent` sent with every feed request
pub const DEFAULT_USER_AGENT: &str = "gator";

/// Errors that can occur while retrieving a feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the fetch budget
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl FetchError {
    /// Failures where the remote may well answer next time: the feed itself
    /// was never seen.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout | FetchError::IncompleteResponse { .. }
        )
    }
}

/// Raw body of a feed and the headers the parser cares about.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: Vec<u8>,
    /// `Content-Type` header, used as a charset hint
    pub content_type: Option<String>,
}

/// HTTP client for feed retrieval with a fixed time budget per request.
///
/// Performs exactly one GET per call. Retrying is left to the scheduler,
/// which simply tries the feed again on a later cycle.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    /// Build a fetcher whose requests identify themselves with `user_agent`.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url` and return its body.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] - the whole exchange exceeded the budget
    /// - [`FetchError::Network`] - connection, TLS or body read failure
    /// - [`FetchError::HttpStatus`] - any non-2xx response
    /// - [`FetchError::ResponseTooLarge`] - body over 10MB
    /// - [`FetchError::IncompleteResponse`] - body shorter than Content-Length
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        tokio::time::timeout(self.timeout, self.fetch_unbounded(url))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_unbounded(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = read_limited_bytes(response, MAX_FEED_SIZE).await?;
        tracing::debug!(url = %url, bytes = body.len(), "Fetched feed");

        Ok(FetchedDocument { body, content_type })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

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

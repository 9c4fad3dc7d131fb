//! Fetches user defined metrics from a remote HTTP endpoint.

use prometheus::proto;
use thiserror::Error;

use crate::textparse::{ParseError, parse_text};

/// Errors raised while fetching and decoding remote metrics.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("failed to read response body: {0}")]
    Read(#[source] reqwest::Error),
    #[error("failed to parse exposition text: {0}")]
    Parse(#[from] ParseError),
}

/// Fetches metric families from a fixed URL on demand.
///
/// The client's request timeout bounds the whole fetch; the response is
/// released on every exit path.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
    url: String,
}

impl RemoteFetcher {
    /// Create a fetcher for `url` using the given client.
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    /// The URL this fetcher scrapes.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and decode the remote metric families.
    ///
    /// Anything but a 200 response is a failure carrying the status code;
    /// the body is fully read before it is parsed.
    pub async fn fetch(&self) -> Result<Vec<proto::MetricFamily>, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(FetchError::Request)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(FetchError::Read)?;
        Ok(parse_text(&body)?)
    }
}

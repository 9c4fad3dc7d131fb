//! Merges locally gathered metric families with remotely fetched ones.

use std::sync::Arc;

use prometheus::proto;
use thiserror::Error;
use tracing::error;

use crate::fetch::RemoteFetcher;

/// The ordered metric families produced by one gather.
pub type GatherResult = Vec<proto::MetricFamily>;

/// A local gather failure. Fatal to the scrape: the exporter must never
/// silently serve without its own instrumentation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatherError {
    message: String,
}

impl GatherError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A source of metric families, gathered fresh on every call.
///
/// The local registry is injected through this trait rather than read from
/// global state, which keeps the fatal-failure path testable.
pub trait Gather: Send + Sync {
    fn gather(&self) -> Result<GatherResult, GatherError>;
}

impl Gather for prometheus::Registry {
    fn gather(&self) -> Result<GatherResult, GatherError> {
        Ok(prometheus::Registry::gather(self))
    }
}

/// Gathers the local registry and appends remotely fetched families.
///
/// The two sources are treated asymmetrically: a local failure fails the
/// scrape, a remote failure is logged and the local result served alone.
/// Duplicate family names across the sources pass through uncoalesced.
pub struct MergingGatherer {
    local: Arc<dyn Gather>,
    remote: Option<RemoteFetcher>,
}

impl MergingGatherer {
    /// Create a gatherer over the injected local source. Without a remote
    /// fetcher every gather returns the local result as-is, with no fetch
    /// attempted.
    pub fn new(local: Arc<dyn Gather>, remote: Option<RemoteFetcher>) -> Self {
        Self { local, remote }
    }

    /// Produce the merged gather result for one scrape.
    pub async fn gather(&self) -> Result<GatherResult, GatherError> {
        let local = Arc::clone(&self.local);
        let mut families = tokio::task::spawn_blocking(move || local.gather())
            .await
            .map_err(|err| GatherError::new(format!("local gather task failed: {err}")))??;

        let Some(remote) = &self.remote else {
            return Ok(families);
        };

        match remote.fetch().await {
            Ok(theirs) => families.extend(theirs),
            Err(err) => {
                error!(url = %remote.url(), error = %err, "Scraping user defined metrics failed");
            }
        }
        Ok(families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Registry};

    struct FailingGather;

    impl Gather for FailingGather {
        fn gather(&self) -> Result<GatherResult, GatherError> {
            Err(GatherError::new("collector unavailable"))
        }
    }

    fn registry_with_counter(name: &str, value: u64) -> Registry {
        let registry = Registry::new();
        let counter = IntCounter::new(name.to_string(), format!("{name} help")).unwrap();
        counter.inc_by(value);
        registry.register(Box::new(counter)).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_gather_without_remote_is_identity() {
        let registry = registry_with_counter("local_requests_total", 3);
        let expected = registry.gather();

        let gatherer = MergingGatherer::new(Arc::new(registry), None);
        let families = gatherer.gather().await.unwrap();

        assert_eq!(families, expected);
    }

    #[tokio::test]
    async fn test_local_failure_is_fatal() {
        let gatherer = MergingGatherer::new(Arc::new(FailingGather), None);

        let err = gatherer.gather().await.unwrap_err();
        assert!(err.to_string().contains("collector unavailable"));
    }

    #[tokio::test]
    async fn test_local_failure_is_fatal_with_remote_configured() {
        // The remote is never consulted when the local gather fails; an
        // unreachable fetcher must not change the outcome.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(100))
            .build()
            .unwrap();
        let fetcher = RemoteFetcher::new(client, "http://127.0.0.1:1/metrics".to_string());
        let gatherer = MergingGatherer::new(Arc::new(FailingGather), Some(fetcher));

        assert!(gatherer.gather().await.is_err());
    }

    #[tokio::test]
    async fn test_remote_failure_degrades_to_local() {
        let registry = registry_with_counter("local_requests_total", 1);
        let expected = registry.gather();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(100))
            .build()
            .unwrap();
        let fetcher = RemoteFetcher::new(client, "http://127.0.0.1:1/metrics".to_string());
        let gatherer = MergingGatherer::new(Arc::new(registry), Some(fetcher));

        let families = gatherer.gather().await.unwrap();
        assert_eq!(families, expected);
    }
}

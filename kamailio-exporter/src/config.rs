//! Configuration for the exporter.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::collector::TargetEndpoint;

/// Default path of the Kamailio control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/kamailio/kamailio_ctl";

/// Default Kamailio control port when a host is configured.
pub const DEFAULT_TARGET_PORT: u16 = 3012;

/// Default port the exporter listens on for scrape requests.
pub const DEFAULT_BIND_PORT: u16 = 9494;

/// Default http scrape path.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default upstream url scraped by the rtpengine metrics path.
pub const DEFAULT_RTP_METRICS_URL: &str = "http://127.0.0.1:9901/metrics";

/// Default timeout applied to outbound metric fetches, in seconds.
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 5;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid http path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("conflicting scrape paths: {0:?} is used twice")]
    DuplicatePath(String),
    #[error("scrape timeout must be greater than zero")]
    ZeroTimeout,
}

/// Complete exporter configuration.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Address the exporter listens on for scrape requests.
    pub listen: SocketAddr,

    /// The http scrape path.
    pub metrics_path: String,

    /// The http scrape path for rtpengine metrics. The proxy route is only
    /// registered when this is set.
    pub rtp_metrics_path: Option<String>,

    /// Upstream url scraped by the rtpengine metrics path.
    pub rtp_metrics_url: String,

    /// Url to request user defined metrics from Kamailio. When set, fetched
    /// families are merged into every scrape.
    pub custom_metrics_url: Option<String>,

    /// The Kamailio control endpoint probed by the target collector.
    pub target: TargetEndpoint,

    /// Timeout applied to every outbound metric fetch and probe.
    pub scrape_timeout: Duration,

    /// Enable debug logging.
    pub debug: bool,
}

impl ExporterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scrape_path(&self.metrics_path)?;

        if let Some(path) = &self.rtp_metrics_path {
            validate_scrape_path(path)?;
            if path == &self.metrics_path {
                return Err(ConfigError::DuplicatePath(path.clone()));
            }
            validate_http_url(&self.rtp_metrics_url)?;
        }

        if let Some(url) = &self.custom_metrics_url {
            validate_http_url(url)?;
        }

        if self.scrape_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_BIND_PORT),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            rtp_metrics_path: None,
            rtp_metrics_url: DEFAULT_RTP_METRICS_URL.to_string(),
            custom_metrics_url: None,
            target: TargetEndpoint::UnixSocket(PathBuf::from(DEFAULT_SOCKET_PATH)),
            scrape_timeout: Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS),
            debug: false,
        }
    }
}

/// Scrape paths must be absolute and must leave `/` free for the info page.
fn validate_scrape_path(path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::InvalidPath {
            path: path.to_string(),
            reason: "must start with /",
        });
    }
    if path == "/" {
        return Err(ConfigError::InvalidPath {
            path: path.to_string(),
            reason: "must not be the root path",
        });
    }
    Ok(())
}

fn validate_http_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|err| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExporterConfig::default();

        assert_eq!(config.listen.port(), 9494);
        assert_eq!(config.metrics_path, "/metrics");
        assert!(config.rtp_metrics_path.is_none());
        assert!(config.custom_metrics_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_relative_metrics_path() {
        let config = ExporterConfig {
            metrics_path: "metrics".to_string(),
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must start with /"));
    }

    #[test]
    fn test_validate_rejects_root_metrics_path() {
        let config = ExporterConfig {
            metrics_path: "/".to_string(),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_paths() {
        let config = ExporterConfig {
            rtp_metrics_path: Some("/metrics".to_string()),
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePath(_)));
    }

    #[test]
    fn test_validate_rejects_non_http_custom_url() {
        let config = ExporterConfig {
            custom_metrics_url: Some("ftp://127.0.0.1/metrics".to_string()),
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_validate_rejects_malformed_rtp_url() {
        let config = ExporterConfig {
            rtp_metrics_path: Some("/rtpmetrics".to_string()),
            rtp_metrics_url: "not a url".to_string(),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ExporterConfig {
            scrape_timeout: Duration::ZERO,
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout));
    }
}

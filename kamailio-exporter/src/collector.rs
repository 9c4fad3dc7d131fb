//! Reachability collector for the monitored Kamailio instance.
//!
//! The collector probes the configured control endpoint on every gather and
//! exports `kamailio_up` plus the probe duration. Collectors deriving richer
//! metrics from the control channel register in the same registry and flow
//! through the exposition pipeline unchanged.

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use prometheus::core::{Collector, Desc};
use prometheus::{Gauge, proto};
use tracing::debug;

/// The Kamailio control endpoint to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEndpoint {
    /// Unix domain socket path.
    UnixSocket(PathBuf),
    /// TCP host and port. Used when a host is configured.
    Tcp(String, u16),
}

impl TargetEndpoint {
    /// Build the endpoint from the flag surface: a configured host selects
    /// TCP, otherwise the domain socket is used.
    pub fn from_flags(socket_path: PathBuf, host: Option<String>, port: u16) -> Self {
        match host {
            Some(host) => Self::Tcp(host, port),
            None => Self::UnixSocket(socket_path),
        }
    }

    /// Attempt a connection to the endpoint, bounding TCP connects by
    /// `timeout`.
    fn probe(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::UnixSocket(path) => {
                #[cfg(unix)]
                {
                    std::os::unix::net::UnixStream::connect(path).map(|_| ())
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "unix domain sockets are not supported on this platform",
                    ))
                }
            }
            Self::Tcp(host, port) => {
                let mut last_err = None;
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(_) => return Ok(()),
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
                }))
            }
        }
    }
}

impl fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnixSocket(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Collector probing the Kamailio control endpoint at gather time.
pub struct TargetCollector {
    endpoint: TargetEndpoint,
    timeout: Duration,
    up: Gauge,
    scrape_duration: Gauge,
}

impl TargetCollector {
    /// Create a collector for the given endpoint. Probes are bounded by
    /// `timeout`.
    pub fn new(endpoint: TargetEndpoint, timeout: Duration) -> Result<Self, prometheus::Error> {
        let up = Gauge::new(
            "kamailio_up",
            "Whether the Kamailio control endpoint is reachable.",
        )?;
        let scrape_duration = Gauge::new(
            "kamailio_scrape_duration_seconds",
            "Duration of the last probe of the Kamailio control endpoint.",
        )?;
        Ok(Self {
            endpoint,
            timeout,
            up,
            scrape_duration,
        })
    }
}

impl Collector for TargetCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.up
            .desc()
            .into_iter()
            .chain(self.scrape_duration.desc())
            .collect()
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let start = Instant::now();
        match self.endpoint.probe(self.timeout) {
            Ok(()) => self.up.set(1.0),
            Err(err) => {
                debug!(endpoint = %self.endpoint, error = %err, "Probing Kamailio failed");
                self.up.set(0.0);
            }
        }
        self.scrape_duration.set(start.elapsed().as_secs_f64());

        let mut families = self.up.collect();
        families.extend(self.scrape_duration.collect());
        families
    }
}

//! Prometheus metrics exporter for Kamailio.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

use kamailio_exporter::config::{
    DEFAULT_BIND_PORT, DEFAULT_METRICS_PATH, DEFAULT_RTP_METRICS_URL, DEFAULT_SCRAPE_TIMEOUT_SECS,
    DEFAULT_SOCKET_PATH, DEFAULT_TARGET_PORT,
};
use kamailio_exporter::http::ProxyTarget;
use kamailio_exporter::{
    AppState, ExporterConfig, HandlerMetrics, HttpServer, MergingGatherer, RemoteFetcher,
    TargetCollector, TargetEndpoint,
};

/// Expose Kamailio statistics as an http endpoint for prometheus.
#[derive(Parser, Debug)]
#[command(name = "kamailio-exporter")]
#[command(about = "Expose Kamailio statistics as an http endpoint for prometheus")]
#[command(version)]
struct Args {
    /// Enable debug logging.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Path to the Kamailio unix domain socket.
    #[arg(long, env = "SOCKET_PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

    /// Kamailio ip or hostname. The domain socket is used if no host is
    /// defined.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Kamailio port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_TARGET_PORT)]
    port: u16,

    /// Listen on this ip for scrape requests.
    #[arg(long, env = "BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Listen on this port for scrape requests.
    #[arg(long, env = "BIND_PORT", default_value_t = DEFAULT_BIND_PORT)]
    bind_port: u16,

    /// The http scrape path.
    #[arg(long, env = "METRICS_PATH", default_value = DEFAULT_METRICS_PATH)]
    metrics_path: String,

    /// The http scrape path for rtpengine metrics.
    #[arg(long, env = "RTPMETRICS_PATH")]
    rtp_metrics_path: Option<String>,

    /// Upstream url scraped by the rtpengine metrics path.
    #[arg(long, env = "RTPMETRICS_URL", default_value = DEFAULT_RTP_METRICS_URL)]
    rtp_metrics_url: String,

    /// Url to request user defined metrics from Kamailio.
    #[arg(long, env = "CUSTOM_METRICS_URL")]
    custom_metrics_url: Option<String>,

    /// Timeout in seconds for outbound metric fetches.
    #[arg(long, env = "SCRAPE_TIMEOUT", default_value_t = DEFAULT_SCRAPE_TIMEOUT_SECS)]
    scrape_timeout: u64,
}

impl Args {
    fn into_config(self) -> ExporterConfig {
        ExporterConfig {
            listen: SocketAddr::new(self.bind_ip, self.bind_port),
            metrics_path: self.metrics_path,
            rtp_metrics_path: self.rtp_metrics_path,
            rtp_metrics_url: self.rtp_metrics_url,
            custom_metrics_url: self.custom_metrics_url,
            target: TargetEndpoint::from_flags(self.socket_path, self.host, self.port),
            scrape_timeout: Duration::from_secs(self.scrape_timeout),
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config();
    config.validate()?;

    // Initialize logging
    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("kamailio_exporter={}", level).parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.debug {
        debug!("Debug logging is enabled");
    }
    info!("Starting kamailio exporter");

    // Build the local registry and register the target collector
    let registry = Registry::new();
    let collector = TargetCollector::new(config.target.clone(), config.scrape_timeout)?;
    registry.register(Box::new(collector))?;
    info!(endpoint = %config.target, "Probing Kamailio control endpoint per scrape");

    let handler_metrics = HandlerMetrics::new(&registry)?;

    // One client with a bounded timeout serves both outbound fetch paths
    let client = reqwest::Client::builder()
        .timeout(config.scrape_timeout)
        .build()?;

    let fetcher = config.custom_metrics_url.as_ref().map(|url| {
        info!(url = %url, "Merging user defined metrics into the scrape");
        RemoteFetcher::new(client.clone(), url.clone())
    });
    let gatherer = Arc::new(MergingGatherer::new(Arc::new(registry.clone()), fetcher));

    let proxy = config.rtp_metrics_path.as_ref().map(|path| {
        info!(path = %path, url = %config.rtp_metrics_url, "Enabling rtp metrics");
        ProxyTarget::new(path.clone(), config.rtp_metrics_url.clone(), client.clone())
    });

    let state = AppState::new(
        gatherer,
        handler_metrics,
        config.metrics_path.clone(),
        proxy,
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start HTTP server
    let server = HttpServer::new(state, config.listen);
    info!(addr = %config.listen, path = %config.metrics_path, "Listening for scrape requests");
    let http_task = tokio::spawn(async move {
        if let Err(err) = server.run(shutdown_rx).await {
            error!("HTTP server error: {}", err);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).unwrap();
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for the server to drain
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!("Exporter stopped");
    Ok(())
}

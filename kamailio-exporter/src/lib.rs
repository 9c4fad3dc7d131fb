//! Prometheus metrics exporter for Kamailio.
//!
//! This crate serves the metrics of a Kamailio instance as a single HTTP
//! scrape endpoint. On every scrape the local registry is gathered, and, if a
//! user-defined metrics URL is configured, the families fetched from that URL
//! are appended to the result before encoding.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌───────────────────┐     ┌─────────────────┐
//! │ Local registry  │────>│  MergingGatherer  │────>│   HTTP server   │
//! │ (collectors)    │     │                   │     │   (/metrics)    │
//! └─────────────────┘     └───────────────────┘     └─────────────────┘
//!                                   ▲
//!                                   │ optional, best effort
//!                         ┌───────────────────┐
//!                         │   RemoteFetcher   │
//!                         │ (user metrics url)│
//!                         └───────────────────┘
//! ```
//!
//! A second, independent scrape path can be configured that proxies requests
//! verbatim to an rtpengine metrics endpoint.
//!
//! # Usage
//!
//! Run the exporter binary; every flag can also be set through its
//! environment variable:
//!
//! ```bash
//! kamailio-exporter --bind-port 9494 --custom-metrics-url http://127.0.0.1:5060/metrics
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod fetch;
pub mod gather;
pub mod http;
pub mod textparse;

pub use collector::{TargetCollector, TargetEndpoint};
pub use config::ExporterConfig;
pub use fetch::{FetchError, RemoteFetcher};
pub use gather::{Gather, GatherError, GatherResult, MergingGatherer};
pub use http::{AppState, HandlerMetrics, HttpServer, ProxyTarget, create_router};
pub use textparse::{ParseError, parse_text};

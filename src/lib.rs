//! Range Relay
//!
//! A resumable, range-aware request relay. A client byte-range request is
//! served by one or more internal fetches against a backend; the relay
//! stitches them into a single coherent response, resuming short deliveries,
//! retrying failed fetches within a bounded budget and following backend
//! relocations.
//!
//! # Overview
//!
//! Each client request is driven by an explicit state machine
//! ([`Orchestrator`]) that is re-entered after every fetch. Only one fetch is
//! in flight per request. Bytes are counted as they reach the client, so a
//! fetch that ends early is resumed from the exact offset that was missed.
//! The client sees one status line and one header set, whatever happened
//! behind it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use range_relay::{HttpBackend, RangeRelay, RelayConfig, RelayServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(RelayConfig::from_file("range_relay.yaml")?);
//! let backend = Arc::new(HttpBackend::new(config.fetch_timeout())?);
//! let relay = Arc::new(RangeRelay::new(Arc::clone(&config), backend)?);
//!
//! RelayServer::new(relay, config.listen_address.parse()?).start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`range`]: client Range and backend content-range parsing, outbound serialization
//! - [`FetchRelay`]: issues fetches through the request's variable slots and
//!   classifies their completion
//! - [`Orchestrator`]: the per-request state machine
//! - [`ResponseComposer`]: classifies backend responses and builds the outward head
//! - [`RangeRelay`]: the async session performing fetches and streaming bodies
//! - [`HttpBackend`] / [`RelayServer`]: the reqwest backend and hyper front server
//! - [`RelayMetrics`] / [`MetricsEndpoint`]: counters and their HTTP exposition
//!
//! # Configuration
//!
//! ```yaml
//! fetch_uri: "http://backend.internal:8081"
//! max_retries: 3
//! max_redirects: 5
//! size_header: "X-NP-File-Size"
//! listen_address: "0.0.0.0:8080"
//! ```
//!
//! See [`RelayConfig`] for every option.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch_relay;
pub mod metrics;
pub mod metrics_endpoint;
pub mod orchestrator;
pub mod range;
pub mod relay;
pub mod response_composer;
pub mod server;
pub mod variables;

pub use backend::HttpBackend;
pub use config::{ConfigChanges, MetricsEndpointConfig, RelayConfig};
pub use context::{FetchContext, Readiness, RequestContext, RequestId};
pub use error::{RelayError, Result};
pub use fetch_relay::{
    Backend, BufferedBody, FetchBody, FetchOutcome, FetchRelay, FetchRequest, FetchResponse, FetchResponseHead,
    PendingFetch,
};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use orchestrator::{Orchestrator, PhaseOutcome, RelayLimits, RelayState};
pub use range::{RangeDescriptor, RangeKind};
pub use relay::{ClientRequest, ClientSink, RangeRelay, RelayOutcome, RelaySummary};
pub use response_composer::{OutwardHead, ResponseComposer, Verdict};
pub use server::RelayServer;
pub use variables::{SlotIndex, SlotRegistry, SlotTable};

//! RangeRelay: the per-request session driving the orchestrator
//!
//! `RangeRelay` holds everything shared across requests (configuration,
//! backend client, slot registry, metrics). [`RangeRelay::handle`] runs one
//! client request to the end: it re-drives the orchestrator after every
//! fetch, performs dispatched fetches against the backend and streams
//! accepted bodies into the client sink.

use crate::config::RelayConfig;
use crate::context::{FetchContext, RequestId};
use crate::error::{RelayError, Result};
use crate::fetch_relay::{Backend, FetchBody, FetchOutcome, FetchRelay, FetchResponse, PendingFetch};
use crate::metrics::RelayMetrics;
use crate::orchestrator::{Orchestrator, PhaseOutcome, RelayState};
use crate::response_composer::{OutwardHead, ResponseComposer, Verdict};
use crate::variables::SlotRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The parts of a client request the relay looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Path and query, appended to the configured fetch target
    pub path: String,
    /// Raw Range header value
    pub range: Option<String>,
}

impl ClientRequest {
    pub fn new(path: impl Into<String>, range: Option<&str>) -> Self {
        ClientRequest {
            path: path.into(),
            range: range.map(str::to_string),
        }
    }
}

/// Output path towards the client
#[async_trait]
pub trait ClientSink: Send {
    async fn send_head(&mut self, head: OutwardHead) -> Result<()>;
    async fn send_body(&mut self, chunk: Bytes) -> Result<()>;
    /// End the response; a body shorter than announced is left truncated
    async fn finish(&mut self) -> Result<()>;
}

/// How a served request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub request_id: RequestId,
    pub status: StatusCode,
    /// Every requested byte reached the client
    pub complete: bool,
    pub fetches: u32,
    pub fetch_errors: u32,
    pub redirects: u32,
    pub bytes_sent: u64,
    pub resource_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// No fetch target is configured; nothing was sent
    Declined,
    Served(RelaySummary),
}

/// Shared relay state, one per process
pub struct RangeRelay {
    config: Arc<RelayConfig>,
    backend: Arc<dyn Backend>,
    metrics: Arc<RelayMetrics>,
    registry: SlotRegistry,
    fetch_relay: FetchRelay,
    composer: ResponseComposer,
    next_id: AtomicU64,
}

impl RangeRelay {
    /// Create a new RangeRelay
    ///
    /// # Returns
    /// * `Err(RelayError::ConfigError)` if the variable names or size header are invalid
    pub fn new(config: Arc<RelayConfig>, backend: Arc<dyn Backend>) -> Result<Self> {
        Self::with_metrics(config, backend, Arc::new(RelayMetrics::new()))
    }

    /// Create a new RangeRelay recording into an existing metrics collector
    pub fn with_metrics(
        config: Arc<RelayConfig>,
        backend: Arc<dyn Backend>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self> {
        let mut registry = SlotRegistry::new();
        let uri_slot = registry.register(&config.uri_var)?;
        let range_slot = registry.register(&config.range_var)?;
        if uri_slot == range_slot {
            return Err(RelayError::ConfigError(
                "uri_var and range_var must name different variables".to_string(),
            ));
        }
        let composer = ResponseComposer::new(&config.size_header)?;

        Ok(RangeRelay {
            config,
            backend,
            metrics,
            registry,
            fetch_relay: FetchRelay::new(uri_slot, range_slot),
            composer,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Absolute primary fetch target for a client path
    pub fn primary_target(&self, path: &str) -> Option<String> {
        let base = self.config.fetch_target()?.trim_end_matches('/');
        if path.starts_with('/') {
            Some(format!("{}{}", base, path))
        } else {
            Some(format!("{}/{}", base, path))
        }
    }

    /// Relay one client request into `sink`
    ///
    /// # Returns
    /// * `Ok(RelayOutcome::Declined)` if the relay is disabled; nothing was sent
    /// * `Ok(RelayOutcome::Served)` once a response was sent, complete or not
    /// * `Err(RelayError)` if the sink failed or the session hit an internal error
    pub async fn handle<S>(&self, request: &ClientRequest, sink: &mut S) -> Result<RelayOutcome>
    where
        S: ClientSink + ?Sized,
    {
        let started = Instant::now();
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut orchestrator = Orchestrator::new(
            id,
            self.fetch_relay,
            self.config.limits(),
            self.primary_target(&request.path),
            request.range.clone(),
            self.registry.new_table(),
        );

        let result = self.run(&mut orchestrator, sink, started).await;
        if let Err(e) = &result {
            warn!("Relay session aborted: request={}, error={}", id, e);
            self.metrics.record_request(0, false);
            self.metrics.record_request_duration(started.elapsed());
        }
        result
    }

    async fn run<S>(&self, orchestrator: &mut Orchestrator, sink: &mut S, started: Instant) -> Result<RelayOutcome>
    where
        S: ClientSink + ?Sized,
    {
        let mut last_fetch: Option<FetchContext> = None;

        loop {
            match orchestrator.drive() {
                PhaseOutcome::Declined => {
                    self.metrics.record_declined();
                    return Ok(RelayOutcome::Declined);
                }
                PhaseOutcome::Again => {
                    match orchestrator.state() {
                        RelayState::DispatchResume => self.metrics.record_resume(),
                        RelayState::FollowRedirect => self.metrics.record_redirect(),
                        _ => {}
                    }

                    let pending = orchestrator.take_dispatched().ok_or_else(|| {
                        RelayError::InconsistentState("waiting without a dispatched fetch".to_string())
                    })?;
                    last_fetch = Some(self.run_fetch(orchestrator, pending, sink).await?);
                }
                PhaseOutcome::Complete => {
                    if let (Some(ctx), Some(fetch)) = (orchestrator.context_mut(), last_fetch.as_ref()) {
                        if let Some(head) = self.composer.compose_outward_head(ctx, fetch)? {
                            sink.send_head(head).await?;
                        }
                    }
                    sink.finish().await?;
                    return Ok(RelayOutcome::Served(self.summarize(orchestrator, started, true)));
                }
                PhaseOutcome::Status(status) => {
                    let head = match orchestrator.context_mut() {
                        Some(ctx) => self.composer.compose_error_head(ctx, status),
                        None => Some(OutwardHead {
                            status,
                            headers: HeaderMap::new(),
                        }),
                    };
                    if let Some(head) = head {
                        sink.send_head(head).await?;
                    }
                    sink.finish().await?;
                    return Ok(RelayOutcome::Served(self.summarize(orchestrator, started, false)));
                }
            }
        }
    }

    /// Perform one dispatched fetch and report its completion
    async fn run_fetch<S>(&self, orchestrator: &mut Orchestrator, pending: PendingFetch, sink: &mut S) -> Result<FetchContext>
    where
        S: ClientSink + ?Sized,
    {
        let fetch_started = Instant::now();
        let PendingFetch { request, mut fetch } = pending;

        let status = match self.backend.fetch(&request).await {
            Ok(FetchResponse { head, mut body }) => {
                fetch.status = Some(head.status);
                fetch.content_length = head.content_length();

                let verdict = orchestrator
                    .context_mut()
                    .and_then(|ctx| self.composer.classify_fetch(ctx, &head));
                if let Some(verdict) = verdict {
                    let accepted = verdict == Verdict::AcceptBody;
                    orchestrator.apply_verdict(verdict);

                    if accepted {
                        let misaligned = orchestrator
                            .context_mut()
                            .and_then(|ctx| self.composer.align_body(ctx, &mut fetch, &head).err());
                        if let Some(e) = misaligned {
                            orchestrator.apply_verdict(Verdict::Fatal(e));
                        }
                    }
                }

                let relay_body = orchestrator
                    .context()
                    .map(|ctx| ctx.body_ready() && ctx.terminal_error.is_none())
                    .unwrap_or(false);
                if relay_body {
                    self.relay_body(orchestrator, &mut fetch, body.as_mut(), sink).await?;
                }
                head.status
            }
            Err(e) => {
                warn!(
                    "Fetch failed: request={}, seq={}, uri={}, error={}",
                    request.request_id, request.sequence, request.uri, e
                );
                orchestrator.apply_verdict(Verdict::Fatal(e));
                StatusCode::BAD_GATEWAY
            }
        };

        self.metrics.record_fetch_duration(fetch_started.elapsed());
        let outcome = orchestrator.complete_fetch(&fetch, status)?;
        self.metrics.record_fetch(outcome != FetchOutcome::Failed);

        Ok(fetch)
    }

    /// Stream an accepted body into the sink, counting what was written
    async fn relay_body<S>(
        &self,
        orchestrator: &mut Orchestrator,
        fetch: &mut FetchContext,
        body: &mut dyn FetchBody,
        sink: &mut S,
    ) -> Result<()>
    where
        S: ClientSink + ?Sized,
    {
        loop {
            let mut chunk = match body.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Body interrupted: request={}, seq={}, delivered={}, error={}",
                        fetch.request_id, fetch.sequence, fetch.delivered_end, e
                    );
                    break;
                }
            };
            if fetch.discard > 0 {
                let skipped = fetch.discard.min(chunk.len() as u64);
                chunk = chunk.split_off(skipped as usize);
                fetch.discard -= skipped;
            }
            if chunk.is_empty() {
                continue;
            }

            let Some(ctx) = orchestrator.context_mut() else {
                break;
            };
            if ctx.terminal_error.is_some() {
                debug!("Suppressing body after terminal error: request={}", ctx.id);
                break;
            }

            // Never send more than the client asked for
            let expected = ctx.requested().requested_len(ctx.outward_total());
            if expected > 0 {
                let remaining = expected.saturating_sub(ctx.delivered_bytes() + fetch.delivered_end);
                if remaining == 0 {
                    break;
                }
                if (chunk.len() as u64) > remaining {
                    chunk.truncate(remaining as usize);
                }
            }

            if let Some(head) = self.composer.compose_outward_head(ctx, fetch)? {
                sink.send_head(head).await?;
            }

            let len = chunk.len() as u64;
            sink.send_body(chunk).await?;
            fetch.record_delivered(len);
            self.metrics.record_bytes_to_client(len);
        }

        Ok(())
    }

    fn summarize(&self, orchestrator: &Orchestrator, started: Instant, complete: bool) -> RelaySummary {
        let ctx = orchestrator.context();
        let summary = RelaySummary {
            request_id: orchestrator.id(),
            status: ctx
                .and_then(|ctx| ctx.final_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            complete,
            fetches: ctx.map_or(0, |ctx| ctx.fetch_count),
            fetch_errors: ctx.map_or(0, |ctx| ctx.fetch_error_count),
            redirects: ctx.map_or(0, |ctx| ctx.redirect_hops),
            bytes_sent: ctx.map_or(0, |ctx| ctx.delivered_bytes()),
            resource_size: ctx.map_or(0, |ctx| ctx.resource_size),
        };

        self.metrics.record_request(summary.status.as_u16(), complete);
        self.metrics.record_request_duration(started.elapsed());

        info!(
            "Request finished: request={}, status={}, complete={}, fetches={}, errors={}, redirects={}, bytes={}",
            summary.request_id,
            summary.status.as_u16(),
            summary.complete,
            summary.fetches,
            summary.fetch_errors,
            summary.redirects,
            summary.bytes_sent
        );

        summary
    }
}

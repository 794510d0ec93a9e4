//! Orchestration state machine for one client request
//!
//! The orchestrator is re-entered on every pass through the request phase.
//! Each call to [`Orchestrator::drive`] inspects the persisted
//! [`RequestContext`], decides the next step and returns immediately; fetches
//! it dispatches are picked up with [`Orchestrator::take_dispatched`] and
//! performed by the caller, which reports back through
//! [`Orchestrator::apply_verdict`] and [`Orchestrator::complete_fetch`].

use crate::context::{FetchContext, Readiness, RequestContext, RequestId};
use crate::error::{RelayError, Result};
use crate::fetch_relay::{FetchOutcome, FetchRelay, PendingFetch};
use crate::range::parse_client_range;
use crate::response_composer::Verdict;
use crate::variables::SlotTable;
use http::StatusCode;
use tracing::{debug, error, warn};

/// Result of one pass through the request phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The relay is not configured for this request
    Declined,
    /// A fetch is pending or in flight; re-enter once it completes
    Again,
    /// Every requested byte was relayed
    Complete,
    /// Terminal status for the client
    Status(StatusCode),
}

/// Where the orchestrator stands after the last pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Start,
    AwaitFetch,
    DispatchRetry,
    FollowRedirect,
    DispatchResume,
    Complete,
    Failed,
}

/// Per-request bounds on extra fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Failed or short fetches tolerated before the request fails
    pub max_retries: u32,
    /// Redirect hops followed before the request fails
    pub max_redirects: u32,
}

impl Default for RelayLimits {
    fn default() -> Self {
        RelayLimits {
            max_retries: 3,
            max_redirects: 5,
        }
    }
}

/// State machine driving the fetches of one client request
pub struct Orchestrator {
    id: RequestId,
    relay: FetchRelay,
    limits: RelayLimits,
    primary_target: Option<String>,
    client_range: Option<String>,
    slots: Option<SlotTable>,
    ctx: Option<RequestContext>,
    state: RelayState,
    dispatched: Option<PendingFetch>,
}

impl Orchestrator {
    /// Create the orchestrator for one client request
    ///
    /// # Arguments
    /// * `primary_target` - Absolute fetch target, or `None` when the relay is disabled
    /// * `client_range` - The client's Range header, if any
    /// * `slots` - Fresh slot table for this request
    pub fn new(
        id: RequestId,
        relay: FetchRelay,
        limits: RelayLimits,
        primary_target: Option<String>,
        client_range: Option<String>,
        slots: SlotTable,
    ) -> Self {
        Orchestrator {
            id,
            relay,
            limits,
            primary_target,
            client_range,
            slots: Some(slots),
            ctx: None,
            state: RelayState::Start,
            dispatched: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn context(&self) -> Option<&RequestContext> {
        self.ctx.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut RequestContext> {
        self.ctx.as_mut()
    }

    /// Run one pass of the state machine
    pub fn drive(&mut self) -> PhaseOutcome {
        let Some(primary) = self.primary_target.clone() else {
            debug!("Relay disabled: request={}", self.id);
            return PhaseOutcome::Declined;
        };

        if self.ctx.is_none() {
            return self.start(primary);
        }

        match self.step() {
            Ok(outcome) => outcome,
            Err(e) => self.fail(e),
        }
    }

    /// Hand the most recently dispatched fetch to the caller
    pub fn take_dispatched(&mut self) -> Option<PendingFetch> {
        let pending = self.dispatched.take()?;
        self.state = RelayState::AwaitFetch;
        Some(pending)
    }

    /// Record the composer's verdict on the current fetch's response
    pub fn apply_verdict(&mut self, verdict: Verdict) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };

        match verdict {
            Verdict::AcceptBody => ctx.readiness = Readiness::Body,
            Verdict::FollowRedirect(target) => ctx.readiness = Readiness::Redirect(target),
            Verdict::Fatal(e) if e.should_retry() => {
                warn!("Recoverable fetch failure: request={}, error={}", ctx.id, e);
                ctx.readiness = Readiness::Retry;
            }
            Verdict::Fatal(e) => {
                error!("Fatal fetch failure: request={}, error={}", ctx.id, e);
                ctx.terminal_error = Some(e);
            }
        }
    }

    /// Report completion of a dispatched fetch
    ///
    /// # Returns
    /// * `Err(RelayError::InternalError)` if the fetch belongs to another request
    pub fn complete_fetch(&mut self, fetch: &FetchContext, status: StatusCode) -> Result<FetchOutcome> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| RelayError::InternalError("fetch completed before the request started".to_string()))?;

        if fetch.request_id != ctx.id {
            return Err(RelayError::InternalError(format!(
                "fetch of {} completed on {}",
                fetch.request_id, ctx.id
            )));
        }

        let outcome = self.relay.on_fetch_complete(fetch, ctx, status);
        if outcome == FetchOutcome::Failed && ctx.readiness == Readiness::Idle {
            ctx.readiness = Readiness::Retry;
        }
        Ok(outcome)
    }

    fn start(&mut self, primary: String) -> PhaseOutcome {
        let slots = self.slots.take().unwrap_or_default();
        let parsed = parse_client_range(self.client_range.as_deref());

        let ranges = parsed.as_ref().map(Vec::clone).unwrap_or_default();
        let mut ctx = RequestContext::new(self.id, ranges, slots);
        ctx.saved_primary_uri = primary;
        self.ctx = Some(ctx);

        let ranges = match parsed {
            Ok(ranges) => ranges,
            Err(e) => return self.fail(e),
        };
        if ranges.len() > 1 {
            return self.fail(RelayError::unsatisfiable(format!(
                "{} ranges requested, multipart responses are not supported",
                ranges.len()
            )));
        }

        let Some(ctx) = self.ctx.as_mut() else {
            return self.fail(RelayError::InternalError("request context missing".to_string()));
        };
        let requested = ctx.requested();
        let target = ctx.saved_primary_uri.clone();

        match self.relay.dispatch(ctx, &target, &requested) {
            Ok(pending) => {
                debug!("Primary fetch dispatched: request={}, range={}", self.id, requested);
                self.dispatched = Some(pending);
                self.state = RelayState::AwaitFetch;
                PhaseOutcome::Again
            }
            Err(e) => self.fail(e),
        }
    }

    fn step(&mut self) -> Result<PhaseOutcome> {
        let limits = self.limits;
        let relay = self.relay;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| RelayError::InternalError("request context missing".to_string()))?;

        if let Some(e) = ctx.terminal_error.clone() {
            return Err(e);
        }

        if ctx.fetch_error_count >= limits.max_retries {
            return Err(RelayError::RetryBudgetExhausted {
                attempts: ctx.fetch_error_count,
                max_retries: limits.max_retries,
            });
        }

        if !ctx.current_fetch_done {
            self.state = RelayState::AwaitFetch;
            return Ok(PhaseOutcome::Again);
        }

        match ctx.readiness.clone() {
            Readiness::Body => {
                if ctx.requested_ranges.len() > 1 {
                    return Err(RelayError::unsatisfiable("multiple ranges"));
                }

                let requested = ctx.requested();
                let expected = requested.requested_len(ctx.outward_total());
                let delivered = ctx.delivered_bytes();
                // An empty success counts as a failure even while the size is unknown
                if delivered >= expected && !ctx.current_fetch_errored {
                    debug!(
                        "Request complete: request={}, delivered={}, fetches={}",
                        ctx.id, delivered, ctx.fetch_count
                    );
                    self.state = RelayState::Complete;
                    return Ok(PhaseOutcome::Complete);
                }

                if !ctx.current_fetch_errored {
                    ctx.fetch_error_count += 1;
                }
                let short = RelayError::ShortDelivery { delivered, expected };
                if ctx.fetch_error_count >= limits.max_retries {
                    warn!("Giving up after short delivery: request={}, {}", ctx.id, short);
                    return Err(RelayError::RetryBudgetExhausted {
                        attempts: ctx.fetch_error_count,
                        max_retries: limits.max_retries,
                    });
                }

                ctx.readiness = Readiness::Idle;
                let remainder = requested.resume_from(delivered);
                let target = ctx.saved_primary_uri.clone();
                warn!("Resuming: request={}, {}, next range={}", ctx.id, short, remainder);

                self.dispatched = Some(relay.dispatch(ctx, &target, &remainder)?);
                self.state = RelayState::DispatchResume;
                Ok(PhaseOutcome::Again)
            }
            Readiness::Redirect(target) => {
                ctx.readiness = Readiness::Idle;

                if target.is_empty() || target.starts_with('/') {
                    return Err(RelayError::RedirectTargetMissing(format!(
                        "unresolved redirect target \"{}\"",
                        target
                    )));
                }

                let hops = ctx.redirect_hops + 1;
                if hops > limits.max_redirects {
                    return Err(RelayError::RedirectLimitExceeded { hops });
                }
                ctx.redirect_hops = hops;

                let remainder = ctx.requested().resume_from(ctx.delivered_bytes());
                debug!(
                    "Following redirect: request={}, hop={}, target={}, range={}",
                    ctx.id, hops, target, remainder
                );

                self.dispatched = Some(relay.dispatch(ctx, &target, &remainder)?);
                self.state = RelayState::FollowRedirect;
                Ok(PhaseOutcome::Again)
            }
            Readiness::Retry => {
                ctx.readiness = Readiness::Idle;

                let remainder = ctx.requested().resume_from(ctx.delivered_bytes());
                let target = ctx.saved_primary_uri.clone();
                debug!(
                    "Retrying: request={}, errors={}/{}, range={}",
                    ctx.id, ctx.fetch_error_count, limits.max_retries, remainder
                );

                self.dispatched = Some(relay.dispatch(ctx, &target, &remainder)?);
                self.state = RelayState::DispatchRetry;
                Ok(PhaseOutcome::Again)
            }
            Readiness::Idle => Err(RelayError::InconsistentState(
                "fetch finished without a classified response".to_string(),
            )),
        }
    }

    fn fail(&mut self, e: RelayError) -> PhaseOutcome {
        let status = StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if self.state != RelayState::Failed {
            error!("Request failed: request={}, status={}, error={}", self.id, status.as_u16(), e);
        }
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.terminal_error.get_or_insert(e);
        }

        self.dispatched = None;
        self.state = RelayState::Failed;
        PhaseOutcome::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::SlotRegistry;

    fn orchestrator(range: Option<&str>) -> Orchestrator {
        let mut registry = SlotRegistry::new();
        let uri = registry.register("$relay_uri").unwrap();
        let range_slot = registry.register("$relay_range").unwrap();
        Orchestrator::new(
            RequestId(1),
            FetchRelay::new(uri, range_slot),
            RelayLimits::default(),
            Some("http://origin/file".to_string()),
            range.map(str::to_string),
            registry.new_table(),
        )
    }

    /// Complete the pending fetch with `status`, claiming `bytes` were relayed
    fn finish(orch: &mut Orchestrator, verdict: Verdict, status: StatusCode, bytes: u64) -> PendingFetch {
        let mut pending = orch.take_dispatched().expect("a fetch should be pending");
        orch.apply_verdict(verdict);
        pending.fetch.status = Some(status);
        pending.fetch.record_delivered(bytes);
        orch.complete_fetch(&pending.fetch, status).unwrap();
        pending
    }

    #[test]
    fn test_disabled_declines() {
        let mut registry = SlotRegistry::new();
        let uri = registry.register("$a").unwrap();
        let range = registry.register("$b").unwrap();
        let mut orch = Orchestrator::new(
            RequestId(1),
            FetchRelay::new(uri, range),
            RelayLimits::default(),
            None,
            None,
            registry.new_table(),
        );
        assert_eq!(orch.drive(), PhaseOutcome::Declined);
        assert!(orch.context().is_none());
    }

    #[test]
    fn test_multi_range_rejected_before_fetch() {
        let mut orch = orchestrator(Some("bytes=0-9,20-29"));
        assert_eq!(orch.drive(), PhaseOutcome::Status(StatusCode::RANGE_NOT_SATISFIABLE));
        assert!(orch.take_dispatched().is_none());
        assert_eq!(orch.context().unwrap().fetch_count, 0);
        assert_eq!(orch.state(), RelayState::Failed);
    }

    #[test]
    fn test_malformed_range_rejected() {
        let mut orch = orchestrator(Some("bytes=abc"));
        assert_eq!(orch.drive(), PhaseOutcome::Status(StatusCode::RANGE_NOT_SATISFIABLE));
        assert_eq!(orch.drive(), PhaseOutcome::Status(StatusCode::RANGE_NOT_SATISFIABLE));
    }

    #[test]
    fn test_in_flight_fetch_keeps_waiting() {
        let mut orch = orchestrator(None);
        assert_eq!(orch.drive(), PhaseOutcome::Again);
        assert_eq!(orch.drive(), PhaseOutcome::Again);
        assert_eq!(orch.context().unwrap().fetch_count, 1);
    }

    #[test]
    fn test_short_delivery_resumes_from_offset() {
        let mut orch = orchestrator(Some("bytes=100-199"));
        assert_eq!(orch.drive(), PhaseOutcome::Again);
        orch.context_mut().unwrap().resource_size = 1000;
        finish(&mut orch, Verdict::AcceptBody, StatusCode::PARTIAL_CONTENT, 50);

        assert_eq!(orch.drive(), PhaseOutcome::Again);
        assert_eq!(orch.state(), RelayState::DispatchResume);
        let pending = orch.take_dispatched().unwrap();
        assert_eq!(pending.request.range, "bytes=150-199");
        assert_eq!(orch.context().unwrap().fetch_error_count, 1);
    }

    #[test]
    fn test_empty_success_resumed_while_size_unknown() {
        let mut orch = orchestrator(None);
        assert_eq!(orch.drive(), PhaseOutcome::Again);
        finish(&mut orch, Verdict::AcceptBody, StatusCode::OK, 0);

        assert_eq!(orch.drive(), PhaseOutcome::Again);
        assert_eq!(orch.state(), RelayState::DispatchResume);
        let pending = orch.take_dispatched().unwrap();
        assert_eq!(pending.request.range, "bytes=0-");

        let ctx = orch.context().unwrap();
        assert_eq!(ctx.fetch_count, 2);
        assert_eq!(ctx.fetch_error_count, 1);
    }

    #[test]
    fn test_error_budget_exhausted() {
        let mut orch = orchestrator(None);
        let mut fetches = 0;
        let mut outcome = orch.drive();
        while outcome == PhaseOutcome::Again {
            fetches += 1;
            finish(
                &mut orch,
                Verdict::Fatal(RelayError::from_http_status(500)),
                StatusCode::INTERNAL_SERVER_ERROR,
                0,
            );
            outcome = orch.drive();
        }
        assert_eq!(outcome, PhaseOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(fetches, 3);
        assert!(matches!(
            orch.context().unwrap().terminal_error,
            Some(RelayError::RetryBudgetExhausted { attempts: 3, max_retries: 3 })
        ));
    }

    #[test]
    fn test_redirect_follows_and_counts_hops() {
        let mut orch = orchestrator(None);
        orch.drive();
        finish(
            &mut orch,
            Verdict::FollowRedirect("http://mirror/file".to_string()),
            StatusCode::FOUND,
            0,
        );

        assert_eq!(orch.drive(), PhaseOutcome::Again);
        assert_eq!(orch.state(), RelayState::FollowRedirect);
        let pending = orch.take_dispatched().unwrap();
        assert_eq!(pending.request.uri, "http://mirror/file");
        assert_eq!(pending.request.range, "bytes=0-");

        let ctx = orch.context().unwrap();
        assert_eq!(ctx.redirect_hops, 1);
        assert_eq!(ctx.fetch_error_count, 0);
        assert_eq!(ctx.saved_primary_uri, "http://origin/file");
    }

    #[test]
    fn test_redirect_limit() {
        let mut orch = orchestrator(None);
        let mut outcome = orch.drive();
        let mut hops = 0;
        while outcome == PhaseOutcome::Again {
            finish(
                &mut orch,
                Verdict::FollowRedirect(format!("http://mirror/{}", hops)),
                StatusCode::FOUND,
                0,
            );
            hops += 1;
            outcome = orch.drive();
        }
        assert_eq!(outcome, PhaseOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(hops, 6);
        assert_eq!(orch.context().unwrap().redirect_hops, 5);
    }

    #[test]
    fn test_terminal_verdict_not_retried() {
        let mut orch = orchestrator(None);
        orch.drive();
        finish(
            &mut orch,
            Verdict::Fatal(RelayError::RedirectTargetMissing("no Location".to_string())),
            StatusCode::FOUND,
            0,
        );
        assert_eq!(orch.drive(), PhaseOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(orch.take_dispatched().is_none());
    }

    #[test]
    fn test_idle_after_completion_is_inconsistent() {
        let mut orch = orchestrator(None);
        orch.drive();
        let mut pending = orch.take_dispatched().unwrap();
        pending.fetch.record_delivered(10);
        orch.complete_fetch(&pending.fetch, StatusCode::OK).unwrap();

        assert_eq!(orch.drive(), PhaseOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(matches!(
            orch.context().unwrap().terminal_error,
            Some(RelayError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_foreign_fetch_rejected() {
        let mut orch = orchestrator(None);
        orch.drive();
        let foreign = FetchContext::new(RequestId(99), 1, "http://x/".to_string(), Default::default());
        assert!(orch.complete_fetch(&foreign, StatusCode::OK).is_err());
    }
}

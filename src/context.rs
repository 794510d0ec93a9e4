//! Per-request and per-fetch state
//!
//! A client request and each of its internal fetches own separate contexts,
//! linked only by [`RequestId`]. The fetch context always ends before the
//! request context does.

use crate::error::RelayError;
use crate::range::RangeDescriptor;
use crate::variables::SlotTable;
use http::StatusCode;
use std::fmt;

/// Identifier tying a fetch back to the client request that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What the last classified fetch asked the orchestrator to do next
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Readiness {
    /// Nothing classified since the last dispatch
    #[default]
    Idle,
    /// A body-bearing response is being relayed to the client
    Body,
    /// The backend relocated the resource
    Redirect(String),
    /// The last fetch failed in a recoverable way
    Retry,
}

/// State of one client request, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: RequestId,

    /// Status presented to the client once decided
    pub final_status: Option<StatusCode>,

    pub fetch_count: u32,
    pub fetch_error_count: u32,
    pub redirect_hops: u32,

    /// Total size of the backing resource; 0 while unknown
    pub resource_size: u64,

    /// Content length adopted from the first accepted fetch when the size is unknown
    pub backfilled_length: Option<u64>,

    /// Parsed client ranges (at most one after validation)
    pub requested_ranges: Vec<RangeDescriptor>,

    /// Progress cursor: `delivered.end` counts body bytes relayed so far
    pub delivered: RangeDescriptor,

    pub saved_primary_uri: String,
    pub current_target: String,
    pub redirect_target_is_relative: bool,

    pub readiness: Readiness,
    pub current_fetch_done: bool,
    pub current_fetch_errored: bool,
    pub header_sent: bool,

    /// Non-recoverable error recorded by classification
    pub terminal_error: Option<RelayError>,

    pub slots: SlotTable,
}

impl RequestContext {
    pub fn new(id: RequestId, requested_ranges: Vec<RangeDescriptor>, slots: SlotTable) -> Self {
        let requested = requested_ranges.first().copied().unwrap_or_default();
        RequestContext {
            id,
            final_status: None,
            fetch_count: 0,
            fetch_error_count: 0,
            redirect_hops: 0,
            resource_size: 0,
            backfilled_length: None,
            requested_ranges,
            delivered: RangeDescriptor {
                start: requested.start,
                end: 0,
                length: 0,
                kind: requested.kind,
            },
            saved_primary_uri: String::new(),
            current_target: String::new(),
            redirect_target_is_relative: false,
            readiness: Readiness::Idle,
            current_fetch_done: true,
            current_fetch_errored: false,
            header_sent: false,
            terminal_error: None,
            slots,
        }
    }

    /// The client's (single) requested range
    pub fn requested(&self) -> RangeDescriptor {
        self.requested_ranges.first().copied().unwrap_or_default()
    }

    pub fn body_ready(&self) -> bool {
        self.readiness == Readiness::Body
    }

    pub fn redirect_ready(&self) -> bool {
        matches!(self.readiness, Readiness::Redirect(_))
    }

    /// Bytes relayed to the client across every fetch so far
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered.end
    }

    /// Total length used for outward headers: the learned size, else the backfill
    pub fn outward_total(&self) -> u64 {
        if self.resource_size > 0 {
            self.resource_size
        } else {
            self.backfilled_length.unwrap_or(0)
        }
    }
}

/// State of one internal fetch
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub request_id: RequestId,
    /// 1-based position of this fetch within its request
    pub sequence: u32,
    pub target: String,
    pub range: RangeDescriptor,
    pub status: Option<StatusCode>,
    pub content_length: Option<u64>,
    /// Bytes of this fetch's body written to the client
    pub delivered_end: u64,
    /// Leading body bytes that precede the position owed to the client
    pub discard: u64,
}

impl FetchContext {
    pub fn new(request_id: RequestId, sequence: u32, target: String, range: RangeDescriptor) -> Self {
        FetchContext {
            request_id,
            sequence,
            target,
            range,
            status: None,
            content_length: None,
            delivered_end: 0,
            discard: 0,
        }
    }

    pub fn record_delivered(&mut self, bytes: u64) {
        self.delivered_end = self.delivered_end.saturating_add(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeKind;

    #[test]
    fn test_new_context_starts_at_requested_offset() {
        let range = RangeDescriptor::explicit(100, 199).unwrap();
        let ctx = RequestContext::new(RequestId(7), vec![range], SlotTable::default());
        assert_eq!(ctx.delivered.start, 100);
        assert_eq!(ctx.delivered_bytes(), 0);
        assert_eq!(ctx.delivered.kind, RangeKind::Explicit);
        assert_eq!(ctx.requested(), range);
        assert!(!ctx.body_ready());
        assert!(!ctx.header_sent);
    }

    #[test]
    fn test_outward_total_prefers_resource_size() {
        let mut ctx = RequestContext::new(RequestId(1), vec![RangeDescriptor::whole()], SlotTable::default());
        assert_eq!(ctx.outward_total(), 0);
        ctx.backfilled_length = Some(512);
        assert_eq!(ctx.outward_total(), 512);
        ctx.resource_size = 1000;
        assert_eq!(ctx.outward_total(), 1000);
    }

    #[test]
    fn test_fetch_context_counts_bytes() {
        let mut fetch = FetchContext::new(RequestId(1), 1, "http://o/a".to_string(), RangeDescriptor::whole());
        fetch.record_delivered(10);
        fetch.record_delivered(5);
        assert_eq!(fetch.delivered_end, 15);
        assert_eq!(RequestId(3).to_string(), "req-3");
    }
}

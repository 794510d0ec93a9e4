//! Fetch relay: issuing internal fetches and classifying their completion

use crate::context::{FetchContext, RequestContext, RequestId};
use crate::error::{RelayError, Result};
use crate::range::RangeDescriptor;
use crate::variables::SlotIndex;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use std::collections::VecDeque;
use tracing::debug;

/// Status reserved for "relocate and retry elsewhere"
pub const RELOCATE_STATUS: StatusCode = StatusCode::FOUND;

/// One outbound fetch, as read back from the request's variable slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub request_id: RequestId,
    pub sequence: u32,
    /// Absolute target URI
    pub uri: String,
    /// Range header value, e.g. `bytes=150-199`
    pub range: String,
}

/// Status and headers of a backend response
#[derive(Debug, Clone)]
pub struct FetchResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Header lines in arrival order and original case, when the backend keeps them.
    /// `HttpBackend` only sees a normalized `HeaderMap`, so its names are lowercase
    /// and never match the case-sensitive `Location` scan.
    pub raw_headers: Vec<(String, String)>,
    /// `scheme://host[:port]` of the backend that answered
    pub origin: Option<String>,
}

impl FetchResponseHead {
    pub fn new(status: StatusCode) -> Self {
        FetchResponseHead {
            status,
            headers: HeaderMap::new(),
            raw_headers: Vec::new(),
            origin: None,
        }
    }

    /// Add a header to both the structured map and the raw list
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self.raw_headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Add a header line to the raw list only
    pub fn with_raw_header(mut self, name: &str, value: &str) -> Self {
        self.raw_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

/// Streamed body of a backend response
#[async_trait]
pub trait FetchBody: Send {
    /// Next body chunk, or `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// A backend response: head first, body streamed afterwards
pub struct FetchResponse {
    pub head: FetchResponseHead,
    pub body: Box<dyn FetchBody>,
}

impl FetchResponse {
    pub fn new(head: FetchResponseHead, body: impl FetchBody + 'static) -> Self {
        FetchResponse {
            head,
            body: Box::new(body),
        }
    }
}

/// Internal fetch dispatch
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// In-memory body, optionally ending in an error
#[derive(Debug, Default)]
pub struct BufferedBody {
    chunks: VecDeque<Bytes>,
    error: Option<RelayError>,
}

impl BufferedBody {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        BufferedBody {
            chunks: chunks.into(),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Yields `chunks`, then fails with `error` instead of ending cleanly
    pub fn interrupted(chunks: Vec<Bytes>, error: RelayError) -> Self {
        BufferedBody {
            chunks: chunks.into(),
            error: Some(error),
        }
    }
}

#[async_trait]
impl FetchBody for BufferedBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

/// Classification of a completed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Body bytes reached the client
    Delivered,
    /// The backend answered with the relocate status
    Relocated,
    /// Error status, or a success status without any body
    Failed,
}

/// A dispatched fetch waiting to be performed
#[derive(Debug, Clone)]
pub struct PendingFetch {
    pub request: FetchRequest,
    pub fetch: FetchContext,
}

/// Issues fetches through the variable slots and classifies their completion
#[derive(Debug, Clone, Copy)]
pub struct FetchRelay {
    uri_slot: SlotIndex,
    range_slot: SlotIndex,
}

impl FetchRelay {
    pub fn new(uri_slot: SlotIndex, range_slot: SlotIndex) -> Self {
        FetchRelay { uri_slot, range_slot }
    }

    /// Prepare one fetch to `uri` for `range`
    ///
    /// Writes the target and serialized range into the request's slots and
    /// builds the outbound request from them. Returns immediately; the caller
    /// performs the fetch and reports back through [`FetchRelay::on_fetch_complete`].
    ///
    /// # Returns
    /// * `Err(RelayError::InternalError)` if the slots cannot be written
    pub fn dispatch(
        &self,
        ctx: &mut RequestContext,
        uri: &str,
        range: &RangeDescriptor,
    ) -> Result<PendingFetch> {
        ctx.slots.set(self.uri_slot, uri)?;
        ctx.slots.set(self.range_slot, range.to_header())?;

        let uri = self.read_slot(ctx, self.uri_slot)?;
        let range_header = self.read_slot(ctx, self.range_slot)?;

        ctx.fetch_count += 1;
        ctx.current_fetch_done = false;
        ctx.current_fetch_errored = false;
        ctx.current_target = uri.clone();

        debug!(
            "Dispatching fetch: request={}, seq={}, uri={}, range={}",
            ctx.id, ctx.fetch_count, uri, range_header
        );

        Ok(PendingFetch {
            request: FetchRequest {
                request_id: ctx.id,
                sequence: ctx.fetch_count,
                uri: uri.clone(),
                range: range_header,
            },
            fetch: FetchContext::new(ctx.id, ctx.fetch_count, uri, *range),
        })
    }

    /// Record the completion of `fetch` on its parent request
    ///
    /// Must be called exactly once per dispatched fetch.
    pub fn on_fetch_complete(
        &self,
        fetch: &FetchContext,
        ctx: &mut RequestContext,
        status: StatusCode,
    ) -> FetchOutcome {
        ctx.delivered.end = ctx.delivered.end.saturating_add(fetch.delivered_end);

        let outcome = classify_completion(status, fetch.delivered_end);
        if outcome == FetchOutcome::Failed {
            ctx.fetch_error_count += 1;
            ctx.current_fetch_errored = true;
        }
        ctx.current_fetch_done = true;

        debug!(
            "Fetch complete: request={}, seq={}, status={}, delivered={}, total_delivered={}, outcome={:?}, errors={}",
            ctx.id,
            fetch.sequence,
            status.as_u16(),
            fetch.delivered_end,
            ctx.delivered.end,
            outcome,
            ctx.fetch_error_count
        );

        outcome
    }

    fn read_slot(&self, ctx: &RequestContext, index: SlotIndex) -> Result<String> {
        ctx.slots
            .get(index)
            .map(str::to_string)
            .ok_or_else(|| RelayError::InternalError(format!("variable slot {} is empty", index)))
    }
}

/// Classify a finished fetch from its status and the bytes it delivered
pub fn classify_completion(status: StatusCode, delivered: u64) -> FetchOutcome {
    if status == RELOCATE_STATUS {
        FetchOutcome::Relocated
    } else if status.as_u16() >= 300 {
        FetchOutcome::Failed
    } else if (status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT) && delivered == 0 {
        FetchOutcome::Failed
    } else {
        FetchOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::SlotRegistry;

    fn setup() -> (FetchRelay, RequestContext) {
        let mut registry = SlotRegistry::new();
        let uri = registry.register("$relay_uri").unwrap();
        let range = registry.register("$relay_range").unwrap();
        let ctx = RequestContext::new(RequestId(1), vec![RangeDescriptor::whole()], registry.new_table());
        (FetchRelay::new(uri, range), ctx)
    }

    #[test]
    fn test_dispatch_goes_through_slots() {
        let (relay, mut ctx) = setup();
        let range = RangeDescriptor::explicit(150, 199).unwrap();
        let pending = relay.dispatch(&mut ctx, "http://origin/file", &range).unwrap();

        assert_eq!(pending.request.uri, "http://origin/file");
        assert_eq!(pending.request.range, "bytes=150-199");
        assert_eq!(pending.request.sequence, 1);
        assert_eq!(pending.fetch.request_id, ctx.id);
        assert_eq!(ctx.fetch_count, 1);
        assert!(!ctx.current_fetch_done);
    }

    #[test]
    fn test_classify_completion() {
        assert_eq!(classify_completion(StatusCode::OK, 10), FetchOutcome::Delivered);
        assert_eq!(classify_completion(StatusCode::PARTIAL_CONTENT, 1), FetchOutcome::Delivered);
        assert_eq!(classify_completion(StatusCode::OK, 0), FetchOutcome::Failed);
        assert_eq!(classify_completion(StatusCode::PARTIAL_CONTENT, 0), FetchOutcome::Failed);
        assert_eq!(classify_completion(StatusCode::FOUND, 0), FetchOutcome::Relocated);
        assert_eq!(classify_completion(StatusCode::MOVED_PERMANENTLY, 0), FetchOutcome::Failed);
        assert_eq!(classify_completion(StatusCode::NOT_FOUND, 0), FetchOutcome::Failed);
        assert_eq!(classify_completion(StatusCode::BAD_GATEWAY, 0), FetchOutcome::Failed);
    }

    #[test]
    fn test_completion_updates_parent() {
        let (relay, mut ctx) = setup();
        let mut pending = relay.dispatch(&mut ctx, "http://origin/file", &RangeDescriptor::whole()).unwrap();
        pending.fetch.record_delivered(600);

        let outcome = relay.on_fetch_complete(&pending.fetch, &mut ctx, StatusCode::OK);
        assert_eq!(outcome, FetchOutcome::Delivered);
        assert_eq!(ctx.delivered_bytes(), 600);
        assert_eq!(ctx.fetch_error_count, 0);
        assert!(ctx.current_fetch_done);

        let pending = relay.dispatch(&mut ctx, "http://origin/file", &RangeDescriptor::open_ended(600)).unwrap();
        let outcome = relay.on_fetch_complete(&pending.fetch, &mut ctx, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(outcome, FetchOutcome::Failed);
        assert_eq!(ctx.delivered_bytes(), 600);
        assert_eq!(ctx.fetch_error_count, 1);
        assert!(ctx.current_fetch_errored);
    }

    #[test]
    fn test_response_head_helpers() {
        let head = FetchResponseHead::new(StatusCode::OK)
            .with_header("Content-Length", "42")
            .with_raw_header("X-Odd", "1")
            .with_origin("http://origin:8080");
        assert_eq!(head.content_length(), Some(42));
        assert_eq!(head.raw_headers.len(), 2);
        assert!(head.headers.get("x-odd").is_none());
        assert_eq!(head.origin.as_deref(), Some("http://origin:8080"));
    }

    #[tokio::test]
    async fn test_buffered_body_interrupted() {
        let mut body = BufferedBody::interrupted(
            vec![Bytes::from_static(b"abc")],
            RelayError::HttpError("reset".to_string()),
        );
        assert_eq!(body.next_chunk().await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert!(body.next_chunk().await.is_err());
        assert_eq!(body.next_chunk().await.unwrap(), None);
    }

    #[test]
    fn test_empty_body_ends_immediately() {
        let mut body = BufferedBody::empty();
        let chunk = tokio_test::block_on(body.next_chunk()).unwrap();
        assert!(chunk.is_none());
    }
}

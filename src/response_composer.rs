//! Response composer: classifies backend responses and builds the one
//! outward header set presented to the client

use crate::context::{FetchContext, RequestContext};
use crate::error::{RelayError, Result};
use crate::fetch_relay::{FetchResponseHead, RELOCATE_STATUS};
use crate::range::{parse_backend_content_range, RangeDescriptor, RangeKind};
use http::header::{HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, LOCATION};
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

/// Default metadata header carrying the total resource size
pub const DEFAULT_SIZE_HEADER: &str = "X-NP-File-Size";

const LOCATION_RAW: &str = "Location";

/// Decision taken on one fetch's backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Relay this response's body to the client
    AcceptBody,
    /// Dispatch the next fetch to this absolute target
    FollowRedirect(String),
    /// Give up on this fetch; recoverability is decided by the error
    Fatal(RelayError),
}

/// Status and headers sent to the client
#[derive(Debug, Clone)]
pub struct OutwardHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Classifies fetch responses and synthesizes outward headers
#[derive(Debug, Clone)]
pub struct ResponseComposer {
    size_header: HeaderName,
}

impl ResponseComposer {
    /// Create a composer reading the resource size from `size_header`
    ///
    /// # Returns
    /// * `Err(RelayError::ConfigError)` if `size_header` is not a valid header name
    pub fn new(size_header: &str) -> Result<Self> {
        let size_header = HeaderName::from_bytes(size_header.as_bytes())
            .map_err(|e| RelayError::ConfigError(format!("invalid size header \"{}\": {}", size_header, e)))?;
        Ok(ResponseComposer { size_header })
    }

    /// Classify the response head of the current fetch
    ///
    /// Returns `None` once the outward body is already being relayed.
    /// Resource metadata found on the response is recorded on `ctx`.
    pub fn classify_fetch(&self, ctx: &mut RequestContext, head: &FetchResponseHead) -> Option<Verdict> {
        if ctx.body_ready() {
            return None;
        }

        let status = head.status;

        if status.as_u16() >= 300 && status != RELOCATE_STATUS {
            warn!(
                "Backend error response: request={}, target={}, status={}",
                ctx.id,
                ctx.current_target,
                status.as_u16()
            );
            return Some(Verdict::Fatal(RelayError::from_http_status(status.as_u16())));
        }

        if let Err(e) = self.extract_resource_size(ctx, head) {
            if ctx.resource_size == 0 {
                return Some(Verdict::Fatal(e));
            }
            debug!("Ignoring malformed size header, size already known: {}", e);
        }

        if status == RELOCATE_STATUS {
            return Some(match self.redirect_target(ctx, head) {
                Ok(target) => {
                    debug!("Relocated: request={}, target={}", ctx.id, target);
                    Verdict::FollowRedirect(target)
                }
                Err(e) => {
                    warn!("Unusable relocation: request={}, error={}", ctx.id, e);
                    Verdict::Fatal(e)
                }
            });
        }

        if ctx.resource_size == 0 && head.headers.get(&self.size_header).is_none() {
            self.learn_size_from_content_range(ctx, head);
        }

        if ctx.resource_size == 0 && status == StatusCode::OK && ctx.backfilled_length.is_none() {
            ctx.backfilled_length = head.content_length();
        }

        debug!(
            "Accepting body: request={}, status={}, resource_size={}",
            ctx.id,
            status.as_u16(),
            ctx.resource_size
        );
        Some(Verdict::AcceptBody)
    }

    /// Line up an accepted body with the position owed to the client
    ///
    /// A 200 answering the first fetch of a ranged request means the backend
    /// ignored `Range`: the request is served as the whole resource from then
    /// on. Otherwise the body start (0 for a 200, the `Content-Range` start
    /// for a 206) is compared with the owed position and any bytes before it
    /// are marked for discarding on `fetch`. A 206 without a usable
    /// `Content-Range` is taken as aligned.
    ///
    /// # Returns
    /// * `Err(RelayError::MisalignedBody)` if the body starts past the owed position
    pub fn align_body(&self, ctx: &mut RequestContext, fetch: &mut FetchContext, head: &FetchResponseHead) -> Result<()> {
        let requested = ctx.requested();
        let delivered = ctx.delivered_bytes();

        if head.status == StatusCode::OK && requested.kind != RangeKind::None && delivered == 0 && !ctx.header_sent {
            warn!(
                "Backend ignored Range, relaying whole resource: request={}, range={}",
                ctx.id, requested
            );
            ctx.requested_ranges = vec![RangeDescriptor::whole()];
            ctx.delivered = RangeDescriptor::whole();
            return Ok(());
        }

        let body_start = match head.status {
            StatusCode::OK => Some(0),
            _ => head
                .header_str(CONTENT_RANGE.as_str())
                .and_then(|value| parse_backend_content_range(value).ok())
                .filter(|range| range.kind == RangeKind::Explicit)
                .map(|range| range.start),
        };
        let (Some(body_start), Some(owed)) = (body_start, owed_position(&requested, delivered, ctx.outward_total()))
        else {
            return Ok(());
        };

        if body_start > owed {
            return Err(RelayError::MisalignedBody {
                expected: owed,
                actual: body_start,
            });
        }

        fetch.discard = owed - body_start;
        if fetch.discard > 0 {
            debug!(
                "Discarding leading body bytes: request={}, seq={}, bytes={}",
                ctx.id, fetch.sequence, fetch.discard
            );
        }
        Ok(())
    }

    /// Build the outward head from the first body-bearing fetch
    ///
    /// Returns `Ok(None)` if a head was already sent for this request.
    pub fn compose_outward_head(&self, ctx: &mut RequestContext, fetch: &FetchContext) -> Result<Option<OutwardHead>> {
        if ctx.header_sent {
            return Ok(None);
        }

        let requested = ctx.requested();
        let status = match fetch.status.unwrap_or(StatusCode::OK) {
            StatusCode::PARTIAL_CONTENT if requested.kind == RangeKind::None => StatusCode::OK,
            status => status,
        };

        let total = ctx.outward_total();
        let mut headers = HeaderMap::new();

        match status {
            StatusCode::OK => {
                let length = if total > 0 { Some(total) } else { fetch.content_length };
                if let Some(length) = length {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                }
            }
            StatusCode::PARTIAL_CONTENT => match requested.resolve(total) {
                Some((start, end)) => {
                    let total_text = if total > 0 { total.to_string() } else { "*".to_string() };
                    let content_range = format!("bytes {}-{}/{}", start, end, total_text);
                    headers.insert(
                        CONTENT_RANGE,
                        HeaderValue::from_str(&content_range)
                            .map_err(|e| RelayError::InternalError(format!("Invalid header value: {}", e)))?,
                    );
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(end - start + 1));
                }
                None => {
                    if let Some(length) = fetch.content_length {
                        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                    }
                }
            },
            _ => {
                if let Some(length) = fetch.content_length {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                }
            }
        }

        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        ctx.final_status = Some(status);
        ctx.header_sent = true;

        debug!(
            "Outward head: request={}, status={}, content_length={:?}, content_range={:?}",
            ctx.id,
            status.as_u16(),
            headers.get(CONTENT_LENGTH),
            headers.get(CONTENT_RANGE)
        );

        Ok(Some(OutwardHead { status, headers }))
    }

    /// Build a terminal error head with an empty body
    ///
    /// Returns `None` if a head was already sent for this request.
    pub fn compose_error_head(&self, ctx: &mut RequestContext, status: StatusCode) -> Option<OutwardHead> {
        if ctx.header_sent {
            return None;
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));

        ctx.final_status = Some(status);
        ctx.header_sent = true;

        Some(OutwardHead { status, headers })
    }

    fn extract_resource_size(&self, ctx: &mut RequestContext, head: &FetchResponseHead) -> Result<()> {
        let Some(value) = head.headers.get(&self.size_header) else {
            return Ok(());
        };

        let value = value
            .to_str()
            .map_err(|e| RelayError::ParseError(format!("{} is not text: {}", self.size_header, e)))?;
        let size = parse_resource_size(value)?;

        if ctx.resource_size != size {
            debug!("Resource size learned: request={}, size={}", ctx.id, size);
        }
        ctx.resource_size = size;
        Ok(())
    }

    fn learn_size_from_content_range(&self, ctx: &mut RequestContext, head: &FetchResponseHead) {
        let Some(value) = head.header_str(CONTENT_RANGE.as_str()) else {
            return;
        };

        match parse_backend_content_range(value) {
            Ok(range) if range.length > 0 => {
                debug!(
                    "Resource size from Content-Range: request={}, size={}",
                    ctx.id, range.length
                );
                ctx.resource_size = range.length;
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring backend Content-Range: {}", e),
        }
    }

    fn redirect_target(&self, ctx: &mut RequestContext, head: &FetchResponseHead) -> Result<String> {
        let location = head
            .header_str(LOCATION.as_str())
            .map(str::to_string)
            .or_else(|| {
                head.raw_headers
                    .iter()
                    .find(|(name, _)| name.starts_with(LOCATION_RAW))
                    .map(|(_, value)| value.clone())
            })
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| RelayError::RedirectTargetMissing("relocation without Location".to_string()))?;

        if !location.starts_with('/') {
            ctx.redirect_target_is_relative = false;
            return Ok(location);
        }

        ctx.redirect_target_is_relative = true;
        let origin = head.origin.as_deref().filter(|origin| !origin.is_empty()).ok_or_else(|| {
            RelayError::RedirectTargetMissing(format!("relative Location {} without backend origin", location))
        })?;

        Ok(format!("{}{}", origin.trim_end_matches('/'), location))
    }
}

impl Default for ResponseComposer {
    fn default() -> Self {
        ResponseComposer {
            size_header: HeaderName::from_static("x-np-file-size"),
        }
    }
}

/// Absolute resource offset of the next byte owed to the client
///
/// `None` for a suffix range while the total is unknown.
fn owed_position(requested: &RangeDescriptor, delivered: u64, total: u64) -> Option<u64> {
    match requested.kind {
        RangeKind::None => Some(delivered),
        RangeKind::Explicit | RangeKind::OpenEnded => Some(requested.start.saturating_add(delivered)),
        RangeKind::Suffix if total > 0 => Some(total - requested.end.min(total) + delivered),
        RangeKind::Suffix => None,
    }
}

/// Parse a resource size metadata value
///
/// Digits only; leading spaces are the only padding accepted.
pub fn parse_resource_size(value: &str) -> Result<u64> {
    let digits = value.trim_start_matches(' ');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RelayError::ParseError(format!("invalid resource size \"{}\"", value)));
    }
    digits
        .parse::<u64>()
        .map_err(|e| RelayError::ParseError(format!("invalid resource size \"{}\": {}", value, e)))
}

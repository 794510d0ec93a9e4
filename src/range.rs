//! Byte range model: client Range headers, backend content ranges and the
//! outbound range strings handed to each fetch

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a byte range as written on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RangeKind {
    /// No client range: the whole resource
    #[default]
    None,
    /// `start-end`
    Explicit,
    /// `start-`
    OpenEnded,
    /// `-N`, the last N bytes (N is stored in `end`)
    Suffix,
}

/// Canonical byte range descriptor
///
/// The same type serves three roles: a parsed client range, a parsed backend
/// content range (with `length` holding the resource total) and the progress
/// cursor tracking how many bytes have reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RangeDescriptor {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive), or the suffix length for `Suffix`
    pub end: u64,
    /// Total resource length when known
    pub length: u64,
    /// Range shape
    pub kind: RangeKind,
}

impl RangeDescriptor {
    /// The implicit range of a request without a Range header
    pub fn whole() -> Self {
        RangeDescriptor::default()
    }

    /// Create an explicit `start-end` range
    ///
    /// # Returns
    /// * `Err(RelayError::RangeUnsatisfiable)` if start > end
    pub fn explicit(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(RelayError::unsatisfiable(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(RangeDescriptor {
            start,
            end,
            length: 0,
            kind: RangeKind::Explicit,
        })
    }

    /// Create an open-ended `start-` range
    pub fn open_ended(start: u64) -> Self {
        RangeDescriptor {
            start,
            end: 0,
            length: 0,
            kind: RangeKind::OpenEnded,
        }
    }

    /// Create a suffix `-n` range
    pub fn suffix(n: u64) -> Self {
        RangeDescriptor {
            start: 0,
            end: n,
            length: 0,
            kind: RangeKind::Suffix,
        }
    }

    /// Render this descriptor as an outbound Range header value
    pub fn to_header(&self) -> String {
        serialize(self.start, self.end, self.kind)
    }

    /// Number of bytes this client range asks for, given the resource size
    ///
    /// A size of zero means "not known yet". Explicit ranges are clamped to the
    /// end of the resource once the size is known, so a bounded range that the
    /// resource cannot fully satisfy is not mistaken for a short read.
    pub fn requested_len(&self, resource_size: u64) -> u64 {
        match self.kind {
            RangeKind::None => resource_size,
            RangeKind::OpenEnded => resource_size.saturating_sub(self.start),
            RangeKind::Suffix => {
                if resource_size > 0 {
                    self.end.min(resource_size)
                } else {
                    self.end
                }
            }
            RangeKind::Explicit => {
                let end = if resource_size > 0 {
                    self.end.min(resource_size - 1)
                } else {
                    self.end
                };
                if end < self.start {
                    0
                } else {
                    end - self.start + 1
                }
            }
        }
    }

    /// The range still owed to the client after `delivered` bytes were relayed
    pub fn resume_from(&self, delivered: u64) -> Self {
        match self.kind {
            RangeKind::None if delivered == 0 => *self,
            RangeKind::None => RangeDescriptor::open_ended(delivered),
            RangeKind::OpenEnded => RangeDescriptor::open_ended(self.start.saturating_add(delivered)),
            RangeKind::Suffix => RangeDescriptor::suffix(self.end.saturating_sub(delivered)),
            RangeKind::Explicit => RangeDescriptor {
                start: self.start.saturating_add(delivered),
                end: self.end,
                length: self.length,
                kind: RangeKind::Explicit,
            },
        }
    }

    /// Absolute `(start, end)` positions for a Content-Range header
    ///
    /// Returns `None` for whole-resource requests, and for open-ended or
    /// suffix ranges while the total is unknown.
    pub fn resolve(&self, total: u64) -> Option<(u64, u64)> {
        match self.kind {
            RangeKind::None => None,
            RangeKind::Explicit => {
                let end = if total > 0 { self.end.min(total - 1) } else { self.end };
                Some((self.start, end))
            }
            RangeKind::OpenEnded if total > 0 => Some((self.start, total - 1)),
            RangeKind::Suffix if total > 0 => Some((total.saturating_sub(self.end), total - 1)),
            _ => None,
        }
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

/// Render an outbound Range header value
///
/// `None` renders as `bytes=0-`: from the beginning, unbounded.
pub fn serialize(start: u64, end: u64, kind: RangeKind) -> String {
    match kind {
        RangeKind::Explicit => format!("bytes={}-{}", start, end),
        RangeKind::OpenEnded => format!("bytes={}-", start),
        RangeKind::Suffix => format!("bytes=-{}", end),
        RangeKind::None => "bytes=0-".to_string(),
    }
}

/// Parse a client Range header
///
/// An absent header yields a single whole-resource descriptor. Multiple
/// comma-separated ranges are accepted syntactically; rejecting them is up
/// to the caller.
///
/// # Returns
/// * `Err(RelayError::RangeUnsatisfiable)` on any malformed token
pub fn parse_client_range(header: Option<&str>) -> Result<Vec<RangeDescriptor>> {
    let Some(value) = header else {
        return Ok(vec![RangeDescriptor::whole()]);
    };

    let value = value.trim();
    let spec = strip_unit(value, "bytes=")
        .filter(|spec| !spec.is_empty())
        .ok_or_else(|| {
            RelayError::unsatisfiable(format!("Range header must start with 'bytes=', got: {}", value))
        })?;

    let mut cursor = Cursor::new(spec);
    let mut ranges = Vec::new();

    loop {
        cursor.skip_spaces();

        let descriptor = if cursor.peek() == Some(b'-') {
            cursor.bump();
            let n = cursor
                .digits()?
                .ok_or_else(|| RelayError::unsatisfiable(format!("suffix length expected in '{}'", value)))?;
            if n == 0 {
                return Err(RelayError::unsatisfiable(format!("empty suffix range in '{}'", value)));
            }
            RangeDescriptor::suffix(n)
        } else {
            let start = cursor
                .digits()?
                .ok_or_else(|| RelayError::unsatisfiable(format!("range start expected in '{}'", value)))?;
            cursor.skip_spaces();
            if cursor.bump() != Some(b'-') {
                return Err(RelayError::unsatisfiable(format!("missing '-' in '{}'", value)));
            }
            cursor.skip_spaces();
            match cursor.digits()? {
                None => RangeDescriptor::open_ended(start),
                Some(end) => RangeDescriptor::explicit(start, end)?,
            }
        };

        cursor.skip_spaces();
        ranges.push(descriptor);

        match cursor.bump() {
            None => return Ok(ranges),
            Some(b',') => continue,
            Some(other) => {
                return Err(RelayError::unsatisfiable(format!(
                    "unexpected '{}' in '{}'",
                    other as char, value
                )))
            }
        }
    }
}

/// Parse a backend content range of the form `start-end/total` or `-end/total`
///
/// A leading `bytes ` unit is accepted. Only one segment is supported.
pub fn parse_backend_content_range(value: &str) -> Result<RangeDescriptor> {
    let value = value.trim();
    let spec = strip_unit(value, "bytes ").unwrap_or(value);
    let invalid = |what: &str| RelayError::unsatisfiable(format!("{} in content range '{}'", what, value));

    let mut cursor = Cursor::new(spec);
    cursor.skip_spaces();

    let (start, kind) = if cursor.peek() == Some(b'-') {
        cursor.bump();
        (0, RangeKind::Suffix)
    } else {
        let start = cursor.digits()?.ok_or_else(|| invalid("start expected"))?;
        cursor.skip_spaces();
        if cursor.bump() != Some(b'-') {
            return Err(invalid("missing '-'"));
        }
        cursor.skip_spaces();
        (start, RangeKind::Explicit)
    };

    let end = cursor.digits()?.ok_or_else(|| invalid("end expected"))?;
    if start > end {
        return Err(invalid("start after end"));
    }

    cursor.skip_spaces();
    if cursor.bump() != Some(b'/') {
        return Err(invalid("missing '/'"));
    }
    let length = cursor.digits()?.ok_or_else(|| invalid("total expected"))?;
    cursor.skip_spaces();

    match cursor.bump() {
        None => Ok(RangeDescriptor {
            start,
            end,
            length,
            kind,
        }),
        Some(b',') => Err(invalid("multiple segments")),
        Some(_) => Err(invalid("trailing data")),
    }
}

fn strip_unit<'a>(value: &'a str, unit: &str) -> Option<&'a str> {
    let prefix = value.get(..unit.len())?;
    if prefix.eq_ignore_ascii_case(unit) {
        Some(&value[unit.len()..])
    } else {
        None
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Cursor {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    /// Read a run of decimal digits; `None` if the cursor is not on a digit
    fn digits(&mut self) -> Result<Option<u64>> {
        let begin = self.pos;
        let mut value: u64 = 0;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(c - b'0')))
                .ok_or_else(|| RelayError::unsatisfiable("range value overflows"))?;
            self.pos += 1;
        }
        Ok((self.pos > begin).then_some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(header: &str) -> RangeDescriptor {
        let ranges = parse_client_range(Some(header)).unwrap();
        assert_eq!(ranges.len(), 1);
        ranges[0]
    }

    #[test]
    fn test_absent_header_is_whole_resource() {
        let ranges = parse_client_range(None).unwrap();
        assert_eq!(ranges, vec![RangeDescriptor::whole()]);
        assert_eq!(ranges[0].kind, RangeKind::None);
    }

    #[test]
    fn test_parse_explicit() {
        let range = single("bytes=100-199");
        assert_eq!(range.kind, RangeKind::Explicit);
        assert_eq!((range.start, range.end), (100, 199));
    }

    #[test]
    fn test_parse_open_ended_and_suffix() {
        let range = single("bytes=500-");
        assert_eq!(range.kind, RangeKind::OpenEnded);
        assert_eq!(range.start, 500);

        let range = single("bytes=-300");
        assert_eq!(range.kind, RangeKind::Suffix);
        assert_eq!(range.end, 300);
    }

    #[test]
    fn test_parse_tolerates_spaces_and_case() {
        let range = single("Bytes= 10 - 20 ");
        assert_eq!((range.start, range.end), (10, 20));
    }

    #[test]
    fn test_parse_multiple_ranges_syntactically() {
        let ranges = parse_client_range(Some("bytes=0-9,20-29")).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].start, 20);
    }

    #[test]
    fn test_parse_malformed() {
        for header in [
            "bytes=",
            "items=0-1",
            "bytes=a-1",
            "bytes=5",
            "bytes=9-3",
            "bytes=-",
            "bytes=-0",
            "bytes=1-2x",
            "bytes=1-2,",
            "bytes=99999999999999999999-",
        ] {
            let result = parse_client_range(Some(header));
            assert!(
                matches!(result, Err(RelayError::RangeUnsatisfiable(_))),
                "{} should be rejected, got {:?}",
                header,
                result
            );
        }
    }

    #[test]
    fn test_serialize_forms() {
        assert_eq!(serialize(10, 20, RangeKind::Explicit), "bytes=10-20");
        assert_eq!(serialize(10, 0, RangeKind::OpenEnded), "bytes=10-");
        assert_eq!(serialize(0, 10, RangeKind::Suffix), "bytes=-10");
        assert_eq!(serialize(0, 0, RangeKind::None), "bytes=0-");
    }

    #[test]
    fn test_backend_content_range() {
        let range = parse_backend_content_range("bytes 100-199/1000").unwrap();
        assert_eq!((range.start, range.end, range.length), (100, 199, 1000));
        assert_eq!(range.kind, RangeKind::Explicit);

        let range = parse_backend_content_range("-50/1000").unwrap();
        assert_eq!(range.kind, RangeKind::Suffix);
        assert_eq!((range.end, range.length), (50, 1000));
    }

    #[test]
    fn test_backend_content_range_rejects() {
        for value in ["bytes */1000", "0-/10", "5-1/10", "0-9", "0-9/", "0-9/10,20-29/10", "0-9/10x"] {
            assert!(parse_backend_content_range(value).is_err(), "{} should fail", value);
        }
    }

    #[test]
    fn test_requested_len() {
        assert_eq!(RangeDescriptor::whole().requested_len(1000), 1000);
        assert_eq!(RangeDescriptor::open_ended(400).requested_len(1000), 600);
        assert_eq!(RangeDescriptor::suffix(300).requested_len(1000), 300);
        assert_eq!(RangeDescriptor::suffix(3000).requested_len(1000), 1000);
        let explicit = RangeDescriptor::explicit(100, 199).unwrap();
        assert_eq!(explicit.requested_len(0), 100);
        assert_eq!(explicit.requested_len(150), 50);
    }

    #[test]
    fn test_resume_from() {
        let explicit = RangeDescriptor::explicit(100, 199).unwrap();
        assert_eq!(explicit.resume_from(50).to_header(), "bytes=150-199");
        assert_eq!(RangeDescriptor::whole().resume_from(0).to_header(), "bytes=0-");
        assert_eq!(RangeDescriptor::whole().resume_from(600).to_header(), "bytes=600-");
        assert_eq!(RangeDescriptor::open_ended(10).resume_from(5).to_header(), "bytes=15-");
        assert_eq!(RangeDescriptor::suffix(100).resume_from(40).to_header(), "bytes=-60");
    }

    #[test]
    fn test_resolve_for_content_range() {
        assert_eq!(RangeDescriptor::whole().resolve(1000), None);
        assert_eq!(RangeDescriptor::explicit(0, 99).unwrap().resolve(1000), Some((0, 99)));
        assert_eq!(RangeDescriptor::open_ended(900).resolve(1000), Some((900, 999)));
        assert_eq!(RangeDescriptor::suffix(100).resolve(1000), Some((900, 999)));
        assert_eq!(RangeDescriptor::suffix(100).resolve(0), None);
    }
}

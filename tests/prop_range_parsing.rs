// Property: any single well-formed Range header parses to the descriptor it
// describes, and the outbound form of that descriptor parses back to itself.

use proptest::prelude::*;
use range_relay::range::{parse_client_range, serialize};
use range_relay::{RangeDescriptor, RangeKind};

fn parse_single(header: &str) -> RangeDescriptor {
    let ranges = parse_client_range(Some(header)).unwrap();
    assert_eq!(ranges.len(), 1, "expected one range in {}", header);
    ranges[0]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_explicit_range_parsing(
        start in 0u64..=u64::MAX / 2,
        len in 0u64..=1_000_000,
    ) {
        let end = start + len;
        let range = parse_single(&format!("bytes={}-{}", start, end));

        prop_assert_eq!(range.kind, RangeKind::Explicit);
        prop_assert_eq!(range.start, start);
        prop_assert_eq!(range.end, end);
        prop_assert_eq!(range.to_header(), format!("bytes={}-{}", start, end));
    }

    #[test]
    fn prop_open_ended_range_parsing(start in 0u64..=u64::MAX) {
        let range = parse_single(&format!("bytes={}-", start));

        prop_assert_eq!(range.kind, RangeKind::OpenEnded);
        prop_assert_eq!(range.start, start);
        prop_assert_eq!(range.to_header(), format!("bytes={}-", start));
    }

    #[test]
    fn prop_suffix_range_parsing(n in 1u64..=u64::MAX) {
        let range = parse_single(&format!("bytes=-{}", n));

        prop_assert_eq!(range.kind, RangeKind::Suffix);
        prop_assert_eq!(range.end, n);
        prop_assert_eq!(range.to_header(), format!("bytes=-{}", n));
    }

    /// Reversed bounds never parse
    #[test]
    fn prop_reversed_range_rejected(
        end in 0u64..=u64::MAX / 2,
        gap in 1u64..=1_000_000,
    ) {
        let start = end + gap;
        let header = format!("bytes={}-{}", start, end);
        prop_assert!(parse_client_range(Some(&header)).is_err());
    }

    /// Any comma-separated list of valid ranges parses to one descriptor each
    #[test]
    fn prop_range_lists_keep_every_entry(
        starts in prop::collection::vec(0u64..100_000, 1..6),
    ) {
        let spec: Vec<String> = starts.iter().map(|s| format!("{}-{}", s, s + 10)).collect();
        let header = format!("bytes={}", spec.join(","));
        let ranges = parse_client_range(Some(&header)).unwrap();

        prop_assert_eq!(ranges.len(), starts.len());
        for (range, start) in ranges.iter().zip(&starts) {
            prop_assert_eq!(range.start, *start);
            prop_assert_eq!(range.end, start + 10);
        }
    }

    /// Resuming an explicit range after `delivered` bytes asks for exactly the rest
    #[test]
    fn prop_resume_covers_remaining_bytes(
        start in 0u64..1_000_000,
        len in 1u64..100_000,
        delivered_fraction in 0.0f64..1.0,
    ) {
        let end = start + len - 1;
        let range = RangeDescriptor::explicit(start, end).unwrap();
        let delivered = ((len as f64) * delivered_fraction) as u64;

        let rest = range.resume_from(delivered);
        prop_assert_eq!(rest.to_header(), serialize(start + delivered, end, RangeKind::Explicit));
        prop_assert_eq!(rest.requested_len(0) + delivered, range.requested_len(0));
    }
}

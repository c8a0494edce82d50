//! Segment planning
//!
//! Splits content into contiguous byte-range segments and maps segments onto
//! source endpoints. Every plan partitions `[0, total)` exactly.

use crate::config::EngineConfig;
use crate::endpoint::EndpointPool;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::protocol::{ContentDescriptor, SegmentChecksums};
use crate::storage::{Segment, SegmentState};

/// Number of segments for `total` bytes
///
/// `min(concurrency, ceil(total / min_segment_size))`, never less than one.
pub fn segment_count(total: u64, concurrency: usize, min_segment_size: u64) -> usize {
    if total == 0 {
        return 1;
    }
    let by_size = total.div_ceil(min_segment_size.max(1));
    let by_size = usize::try_from(by_size).unwrap_or(usize::MAX);
    concurrency.max(1).min(by_size).max(1)
}

/// Plan segments for content of a known size
///
/// Fails with `InvalidSize` when the size is unknown or zero; the caller then
/// falls back to a single unbounded segment.
pub fn plan(total: Option<u64>, concurrency: usize, min_segment_size: u64) -> Result<Vec<Segment>> {
    let total = match total {
        Some(total) if total > 0 => total,
        other => {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidSize,
                format!("cannot plan segments for total size {:?}", other),
            ))
        }
    };

    let count = segment_count(total, concurrency, min_segment_size);
    let base = (total / count as u64).max(min_segment_size);

    let mut segments = Vec::with_capacity(count);
    for i in 0..count {
        let start = i as u64 * base;
        let end = if i == count - 1 {
            total
        } else {
            (i as u64 + 1) * base
        };
        segments.push(Segment::new(i, start, end));
    }
    Ok(segments)
}

/// Plan segments aligned to checksum blocks
///
/// Whole blocks are grouped so that each segment is at least
/// `min_segment_size` and there are at most `concurrency` segments; the last
/// segment takes the remaining blocks.
pub fn plan_with_checksums(
    total: u64,
    checksums: &SegmentChecksums,
    concurrency: usize,
    min_segment_size: u64,
) -> Result<Vec<Segment>> {
    let block = checksums.block_size;
    if block == 0 || total == 0 {
        return Err(EngineError::protocol(
            ProtocolErrorKind::InvalidSize,
            format!("cannot plan {} bytes in blocks of {}", total, block),
        ));
    }
    let blocks = total.div_ceil(block);
    if blocks != checksums.digests.len() as u64 {
        return Err(EngineError::malformed(format!(
            "{} bytes need {} block digests, got {}",
            total,
            blocks,
            checksums.digests.len()
        )));
    }

    let per_segment = min_segment_size
        .div_ceil(block)
        .max(blocks.div_ceil(concurrency.max(1) as u64))
        .max(1);
    let count = blocks.div_ceil(per_segment);

    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * per_segment * block;
        let end = ((i + 1) * per_segment * block).min(total);
        segments.push(Segment::new(i as usize, start, end));
    }
    Ok(segments)
}

/// Plan segments for a descriptor under the given configuration
///
/// Unknown or zero size yields one unbounded streaming segment; a server
/// without range support gets one segment covering everything.
pub fn plan_for(
    descriptor: &ContentDescriptor,
    config: &EngineConfig,
    supports_ranges: bool,
) -> Result<Vec<Segment>> {
    let total = match descriptor.total_size {
        Some(total) if total > 0 => total,
        other => {
            tracing::info!(
                "Size of {} is {:?}, fetching as a single stream",
                descriptor.name,
                other
            );
            return Ok(vec![Segment::unbounded()]);
        }
    };

    if !supports_ranges {
        tracing::debug!("Ranges unsupported for {}, using one segment", descriptor.name);
        return Ok(vec![Segment::new(0, 0, total)]);
    }

    match descriptor.checksums {
        Some(ref checksums) => plan_with_checksums(
            total,
            checksums,
            config.concurrency,
            config.min_segment_size,
        ),
        None => plan(Some(total), config.concurrency, config.min_segment_size),
    }
}

/// Assign every unverified segment to a usable endpoint
///
/// Round-robin over endpoints ordered healthiest and fastest first. Returns
/// the number of segments assigned; zero usable endpoints assigns nothing.
pub fn assign(segments: &mut [Segment], endpoints: &EndpointPool) -> usize {
    let ranked = endpoints.ranked();
    if ranked.is_empty() {
        return 0;
    }

    let mut assigned = 0;
    let mut next = 0;
    for segment in segments.iter_mut().filter(|s| !s.is_verified()) {
        let choice = (0..ranked.len())
            .map(|offset| ranked[(next + offset) % ranked.len()])
            .find(|idx| !segment.excluded.contains(idx));
        if let Some(idx) = choice {
            segment.endpoint = Some(idx);
            assigned += 1;
            next = (next + 1) % ranked.len();
        }
    }
    assigned
}

/// Move unverified, idle segments away from dead endpoints
///
/// Verified and in-flight segments are left alone; an in-flight segment of a
/// dead endpoint is handled when its worker reports back. Returns the indices
/// of the segments that moved.
pub fn reassign_from_dead(segments: &mut [Segment], endpoints: &EndpointPool) -> Vec<usize> {
    let mut moved = Vec::new();
    for segment in segments.iter_mut() {
        let idle = matches!(segment.state, SegmentState::Pending | SegmentState::Failed { .. });
        let stranded = segment
            .endpoint
            .is_some_and(|idx| !endpoints.is_usable(idx));
        if !idle || !stranded {
            continue;
        }

        segment.endpoint = endpoints.best_excluding(&segment.excluded);
        if let Some(idx) = segment.endpoint {
            tracing::debug!("Segment {} reassigned to endpoint {}", segment.index, idx);
        }
        moved.push(segment.index);
    }
    moved
}

/// Whether segments partition `[0, total)`: contiguous, non-overlapping, complete
pub fn is_partition(segments: &[Segment], total: u64) -> bool {
    let mut expected = 0u64;
    for (i, segment) in segments.iter().enumerate() {
        if segment.index != i || segment.start != expected {
            return false;
        }
        match segment.end {
            Some(end) if end > segment.start => expected = end,
            _ => return false,
        }
    }
    !segments.is_empty() && expected == total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChecksumAlgorithm, EndpointHealth};

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(100 * MIB, 16, MIB), 16);
        assert_eq!(segment_count(10 * MIB, 16, MIB), 10);
        assert_eq!(segment_count(512 * 1024, 16, MIB), 1);
        assert_eq!(segment_count(10 * MIB + 1, 16, MIB), 11);
        assert_eq!(segment_count(1, 16, MIB), 1);
    }

    #[test]
    fn test_plan_25_mib_example() {
        let segments = plan(Some(25 * MIB), 16, 10 * MIB).unwrap();
        let ranges: Vec<(u64, Option<u64>)> = segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(
            ranges,
            vec![
                (0, Some(10 * MIB)),
                (10 * MIB, Some(20 * MIB)),
                (20 * MIB, Some(25 * MIB)),
            ]
        );
    }

    #[test]
    fn test_plan_partitions() {
        for total in [1, 2, 7, 999, 1000, 1001, 4096, 65_537, 10 * MIB + 3] {
            for concurrency in [1, 2, 3, 7, 16, 64] {
                for min in [1, 100, 4096, MIB] {
                    let segments = plan(Some(total), concurrency, min).unwrap();
                    assert!(
                        is_partition(&segments, total),
                        "total={} n={} min={}",
                        total,
                        concurrency,
                        min
                    );
                    assert!(segments.len() <= concurrency);
                    let sum: u64 = segments.iter().filter_map(|s| s.len()).sum();
                    assert_eq!(sum, total);
                }
            }
        }
    }

    #[test]
    fn test_plan_invalid_size() {
        assert!(plan(None, 16, MIB).unwrap_err().is_invalid_size());
        assert!(plan(Some(0), 16, MIB).unwrap_err().is_invalid_size());
    }

    fn checksums(total: u64, block: u64) -> SegmentChecksums {
        SegmentChecksums {
            algorithm: ChecksumAlgorithm::Sha1,
            block_size: block,
            digests: vec![String::new(); total.div_ceil(block) as usize],
        }
    }

    #[test]
    fn test_plan_with_checksums_aligns_to_blocks() {
        let total = 10 * 256 + 100;
        let sums = checksums(total, 256);
        let segments = plan_with_checksums(total, &sums, 16, 1000).unwrap();

        assert!(is_partition(&segments, total));
        // 1000 bytes min -> 4 blocks per segment
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert_eq!(segment.start % 256, 0);
            let end = segment.end.unwrap();
            assert!(sums.digests_for(segment.start, end).is_some());
        }
        assert_eq!(segments[2].end, Some(total));
    }

    #[test]
    fn test_plan_with_checksums_respects_concurrency() {
        let total = 64 * 16;
        let segments = plan_with_checksums(total, &checksums(total, 16), 4, 1).unwrap();
        assert_eq!(segments.len(), 4);
        assert!(is_partition(&segments, total));
    }

    #[test]
    fn test_plan_with_checksums_rejects_digest_count() {
        let mut sums = checksums(1000, 100);
        sums.digests.pop();
        assert!(plan_with_checksums(1000, &sums, 4, 1).is_err());
    }

    #[test]
    fn test_plan_for_fallbacks() {
        let config = EngineConfig::default();

        let streaming = ContentDescriptor::new("id", None, "f");
        let segments = plan_for(&streaming, &config, true).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, None);

        let no_ranges = ContentDescriptor::new("id", Some(100 * MIB), "f");
        let segments = plan_for(&no_ranges, &config, false).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, Some(100 * MIB));

        let segments = plan_for(&no_ranges, &config, true).unwrap();
        assert_eq!(segments.len(), 16);
    }

    #[test]
    fn test_assign_round_robin() {
        let pool = EndpointPool::new(["http://a/f", "http://b/f"], 3);
        let mut segments = plan(Some(400), 4, 100).unwrap();
        segments[1].state = SegmentState::Verified;

        assert_eq!(assign(&mut segments, &pool), 3);
        assert_eq!(segments[0].endpoint, Some(0));
        assert_eq!(segments[1].endpoint, None);
        assert_eq!(segments[2].endpoint, Some(1));
        assert_eq!(segments[3].endpoint, Some(0));
    }

    #[test]
    fn test_assign_skips_excluded() {
        let pool = EndpointPool::new(["http://a/f", "http://b/f"], 3);
        let mut segments = plan(Some(200), 2, 100).unwrap();
        segments[0].excluded.push(0);
        assign(&mut segments, &pool);
        assert_eq!(segments[0].endpoint, Some(1));
    }

    #[test]
    fn test_reassign_from_dead_leaves_verified() {
        let mut pool = EndpointPool::new(["http://a/f", "http://b/f"], 1);
        let mut segments = plan(Some(300), 3, 100).unwrap();
        for segment in &mut segments {
            segment.endpoint = Some(0);
        }
        segments[0].state = SegmentState::Verified;
        segments[1].state = SegmentState::InFlight;

        assert_eq!(pool.report_failure(0), Some(EndpointHealth::Dead));
        let moved = reassign_from_dead(&mut segments, &pool);

        assert_eq!(moved, vec![2]);
        assert_eq!(segments[0].endpoint, Some(0));
        assert_eq!(segments[1].endpoint, Some(0));
        assert_eq!(segments[2].endpoint, Some(1));
    }
}

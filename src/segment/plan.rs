use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::audio::AudioAsset;

/// Upload limit of the speech-to-text API (25 MiB)
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("Invalid asset metadata: {0}")]
    InvalidInput(String),
    #[error("Maximum segment size must be greater than zero")]
    ZeroThreshold,
}

/// Half-open time range `[start_ms, end_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms() as f64 / 1000.0
    }
}

/// Ordered, gap-free partition of `[0, total_duration_ms)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    ranges: Vec<TimeRange>,
    total_duration_ms: u64,
}

impl SegmentPlan {
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = TimeRange> + '_ {
        self.ranges.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when the asset can be submitted as-is
    pub fn is_single(&self) -> bool {
        self.ranges.len() == 1
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }
}

/// Split `duration_ms` into enough equal-duration segments that each one's
/// share of `byte_size` stays within `max_segment_bytes`.
///
/// The segment count is `ceil(byte_size / max_segment_bytes)`, each segment
/// lasts `floor(duration_ms / count)` and the last one runs to the end. A
/// zero-length recording always yields one segment.
pub fn plan_segments(
    byte_size: u64,
    duration_ms: u64,
    max_segment_bytes: u64,
) -> Result<SegmentPlan, PlanError> {
    if max_segment_bytes == 0 {
        return Err(PlanError::ZeroThreshold);
    }

    if byte_size <= max_segment_bytes || duration_ms == 0 {
        return Ok(SegmentPlan {
            ranges: vec![TimeRange::new(0, duration_ms)],
            total_duration_ms: duration_ms,
        });
    }

    let count = byte_size.div_ceil(max_segment_bytes);
    let per_segment_ms = duration_ms / count;

    let ranges = (0..count)
        .map(|i| {
            let start_ms = i * per_segment_ms;
            let end_ms = if i + 1 == count {
                duration_ms
            } else {
                (i + 1) * per_segment_ms
            };
            TimeRange::new(start_ms, end_ms)
        })
        .collect();

    Ok(SegmentPlan {
        ranges,
        total_duration_ms: duration_ms,
    })
}

/// Plan from raw metadata as reported by an external probe, which may be
/// negative when the file could not be read.
pub fn plan_from_raw(
    byte_size: i64,
    duration_ms: i64,
    max_segment_bytes: u64,
) -> Result<SegmentPlan, PlanError> {
    let byte_size = u64::try_from(byte_size)
        .map_err(|_| PlanError::InvalidInput(format!("negative byte size {}", byte_size)))?;
    let duration_ms = u64::try_from(duration_ms)
        .map_err(|_| PlanError::InvalidInput(format!("negative duration {}ms", duration_ms)))?;

    plan_segments(byte_size, duration_ms, max_segment_bytes)
}

/// Plan the segments for a loaded asset
pub fn plan_for_asset(asset: &AudioAsset, max_segment_bytes: u64) -> Result<SegmentPlan, PlanError> {
    let plan = plan_segments(asset.byte_size(), asset.duration_ms(), max_segment_bytes)?;

    if plan.is_single() {
        info!(
            "{} ({} bytes) fits in one upload of at most {} bytes",
            asset.name(),
            asset.byte_size(),
            max_segment_bytes
        );
    } else {
        info!(
            "{} is {:.1} MiB, splitting into {} segments of ~{:.1}s",
            asset.name(),
            asset.byte_size() as f64 / (1024.0 * 1024.0),
            plan.len(),
            plan.ranges()[0].duration_secs()
        );
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_partition(plan: &SegmentPlan, duration_ms: u64) {
        let ranges = plan.ranges();
        assert_eq!(ranges.first().unwrap().start_ms, 0);
        assert_eq!(ranges.last().unwrap().end_ms, duration_ms);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_ms, pair[1].start_ms, "gap or overlap in {:?}", ranges);
        }
        let total: u64 = ranges.iter().map(|r| r.duration_ms()).sum();
        assert_eq!(total, duration_ms);
    }

    #[test]
    fn test_small_asset_is_single_segment() {
        let plan = plan_segments(10 * MIB, 45_000, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert!(plan.is_single());
        assert_eq!(plan.ranges(), &[TimeRange::new(0, 45_000)]);
    }

    #[test]
    fn test_exactly_at_threshold_is_single_segment() {
        let plan = plan_segments(25 * MIB, 1_000, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_sixty_mib_split_in_three() {
        let plan = plan_segments(60 * MIB, 60_000, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(
            plan.ranges(),
            &[
                TimeRange::new(0, 20_000),
                TimeRange::new(20_000, 40_000),
                TimeRange::new(40_000, 60_000),
            ]
        );
    }

    #[test]
    fn test_last_segment_absorbs_remainder() {
        let plan = plan_segments(26 * MIB, 10_001, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.ranges()[0], TimeRange::new(0, 5_000));
        assert_eq!(plan.ranges()[1], TimeRange::new(5_000, 10_001));
        assert_partition(&plan, 10_001);
    }

    #[test]
    fn test_segment_count_is_ceil_of_size_ratio() {
        for (size, duration) in [
            (25 * MIB + 1, 1_000_000),
            (50 * MIB, 3_600_000),
            (51 * MIB, 3_600_000),
            (300 * MIB, 7_200_123),
            (101 * MIB, 17),
        ] {
            let plan = plan_segments(size, duration, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
            assert_eq!(plan.len() as u64, size.div_ceil(DEFAULT_MAX_SEGMENT_BYTES));
            assert_partition(&plan, duration);
        }
    }

    #[test]
    fn test_zero_duration_is_single_segment() {
        let plan = plan_segments(80 * MIB, 0, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(plan.ranges(), &[TimeRange::new(0, 0)]);
    }

    #[test]
    fn test_near_empty_final_segment_is_kept() {
        // 3 segments over 2ms: the first two are empty, the last takes it all
        let plan = plan_segments(3, 2, 1).unwrap();
        assert_eq!(
            plan.ranges(),
            &[TimeRange::new(0, 0), TimeRange::new(0, 0), TimeRange::new(0, 2)]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan_segments(123 * MIB, 3_333_333, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        let b = plan_segments(123 * MIB, 3_333_333, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(plan_segments(10, 10, 0), Err(PlanError::ZeroThreshold));
        assert!(matches!(
            plan_from_raw(-1, 1_000, DEFAULT_MAX_SEGMENT_BYTES),
            Err(PlanError::InvalidInput(_))
        ));
        assert!(matches!(
            plan_from_raw(1_000, -5, DEFAULT_MAX_SEGMENT_BYTES),
            Err(PlanError::InvalidInput(_))
        ));
        assert_eq!(plan_from_raw(100, 1_000, 200).unwrap().len(), 1);
    }

    #[test]
    fn test_plan_for_asset() {
        let asset = AudioAsset::from_parts("lecture.mp3", 60 * MIB, 60_000);
        let plan = plan_for_asset(&asset, DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.total_duration_ms(), 60_000);
    }
}

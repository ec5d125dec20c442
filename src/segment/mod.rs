//! Splitting recordings that exceed the upload limit into time-contiguous
//! segments.

mod export;
mod plan;

pub use export::{
    AudioSegment, DEFAULT_SEGMENT_SAMPLE_RATE, ExportCause, ExportConfig, ExportError,
    PcmFormat, SegmentEncoding, SegmentExporter,
};
pub use plan::{
    DEFAULT_MAX_SEGMENT_BYTES, PlanError, SegmentPlan, TimeRange, plan_for_asset, plan_from_raw,
    plan_segments,
};

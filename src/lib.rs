//! Transcription of long recordings through a size-limited speech-to-text
//! service.
//!
//! A recording above the upload limit is cut into equal-duration segments
//! ([`segment`]), each segment is transcribed in order ([`transcribe`]) and
//! the fragments are joined back into one transcript ([`transcript`]).

pub mod audio;
pub mod config;
pub mod history;
pub mod pipeline;
pub mod segment;
pub mod session;
pub mod transcribe;
pub mod transcript;

pub use audio::{AssetError, AudioAsset, SourceFormat};
pub use config::{Backend, Config, ConfigError};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineEvent, PipelineOutcome};
pub use segment::{AudioSegment, SegmentPlan, TimeRange, plan_segments};
pub use transcribe::{CapabilityError, SequenceError, TranscriptionCapability};
pub use transcript::{ExportFormat, TranscriptDocument, TranscriptResult};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::segment::AudioSegment;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response after {0:?}")]
    Timeout(Duration),
    #[error("segment is {size} bytes, above the {limit} byte upload limit")]
    Oversized { size: u64, limit: u64 },
    #[error("local transcription failed: {0}")]
    Local(String),
}

/// A speech-to-text backend: one encoded audio file in, plain text out.
///
/// Implementations must accept any file up to the configured segment size.
#[async_trait]
pub trait TranscriptionCapability: Send + Sync {
    async fn transcribe(
        &self,
        segment: &AudioSegment,
        language: Option<&str>,
    ) -> Result<String, CapabilityError>;

    /// Model identifier recorded alongside transcripts
    fn model(&self) -> &str;
}

#[async_trait]
impl<T: TranscriptionCapability + ?Sized> TranscriptionCapability for Arc<T> {
    async fn transcribe(
        &self,
        segment: &AudioSegment,
        language: Option<&str>,
    ) -> Result<String, CapabilityError> {
        (**self).transcribe(segment, language).await
    }

    fn model(&self) -> &str {
        (**self).model()
    }
}

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::capability::{CapabilityError, TranscriptionCapability};
use crate::segment::{AudioSegment, DEFAULT_MAX_SEGMENT_BYTES, TimeRange};
use crate::transcript::{TranscriptFragment, TranscriptResult};

#[derive(Error, Debug)]
pub enum SequenceError {
    /// No partial transcript is kept when this is returned
    #[error("Transcription failed for segment {} of {}: {source}", .index + 1, .total)]
    TranscriptionFailure {
        index: usize,
        total: usize,
        #[source]
        source: CapabilityError,
    },
    #[error("Transcription cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SequencerOptions {
    /// Language hint passed to every call
    pub language: Option<String>,
    /// Limit for a single call; `None` waits forever
    pub call_timeout: Option<Duration>,
    /// Segments above this size are rejected without calling the backend
    pub max_segment_bytes: u64,
    /// Calls in flight at once; 1 submits strictly one after another
    pub concurrency: usize,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            language: None,
            call_timeout: Some(Duration::from_secs(300)),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            concurrency: 1,
        }
    }
}

/// Reported after each segment's text comes back
#[derive(Debug, Clone)]
pub struct SegmentProgress {
    pub index: usize,
    pub total: usize,
    /// Segments finished so far, including this one
    pub completed: usize,
    pub range: TimeRange,
    pub chars: usize,
    pub elapsed: Duration,
}

pub type ProgressCallback<'a> = Box<dyn Fn(&SegmentProgress) + Send + Sync + 'a>;

/// Submits segments to a [`TranscriptionCapability`] and assembles the
/// returned fragments in segment order.
pub struct TranscriptionSequencer<'a> {
    capability: &'a dyn TranscriptionCapability,
    options: SequencerOptions,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> TranscriptionSequencer<'a> {
    pub fn new(capability: &'a dyn TranscriptionCapability, options: SequencerOptions) -> Self {
        Self {
            capability,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: impl Fn(&SegmentProgress) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn options(&self) -> &SequencerOptions {
        &self.options
    }

    /// Transcribe `segments` and join their text.
    ///
    /// The first failing segment aborts the run. Cancelling `cancel` drops
    /// any call in flight and returns [`SequenceError::Cancelled`].
    pub async fn run(
        &self,
        segments: &[AudioSegment],
        cancel: &CancellationToken,
    ) -> Result<TranscriptResult, SequenceError> {
        let total = segments.len();
        let concurrency = self.options.concurrency.max(1);
        let started = Instant::now();

        info!(
            "Transcribing {} segment(s) with {} ({} at a time)",
            total,
            self.capability.model(),
            concurrency
        );

        let work = async {
            // buffer_unordered(1) only pulls the next segment once the
            // previous call has resolved
            let mut calls = stream::iter(segments.iter().map(|s| self.transcribe_one(s, total)))
                .buffer_unordered(concurrency);

            let mut fragments = Vec::with_capacity(total);
            while let Some(outcome) = calls.next().await {
                let (fragment, elapsed) = outcome?;
                if let Some(progress) = &self.progress {
                    progress(&SegmentProgress {
                        index: fragment.index,
                        total,
                        completed: fragments.len() + 1,
                        range: fragment.range,
                        chars: fragment.text.len(),
                        elapsed,
                    });
                }
                fragments.push(fragment);
            }
            Ok::<_, SequenceError>(fragments)
        };

        let fragments = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Transcription cancelled");
                return Err(SequenceError::Cancelled);
            }
            outcome = work => outcome?,
        };

        let result = TranscriptResult::from_fragments(fragments);
        info!(
            "Transcribed {} segment(s) in {:.1}s ({} chars)",
            total,
            started.elapsed().as_secs_f32(),
            result.text().len()
        );
        Ok(result)
    }

    async fn transcribe_one(
        &self,
        segment: &AudioSegment,
        total: usize,
    ) -> Result<(TranscriptFragment, Duration), SequenceError> {
        let index = segment.index();
        let fail = |source: CapabilityError| SequenceError::TranscriptionFailure {
            index,
            total,
            source,
        };

        if segment.byte_size() > self.options.max_segment_bytes {
            return Err(fail(CapabilityError::Oversized {
                size: segment.byte_size(),
                limit: self.options.max_segment_bytes,
            }));
        }

        let range = segment.range();
        info!(
            "Transcribing segment {}/{} ({:.1}s - {:.1}s, {} bytes)",
            index + 1,
            total,
            range.start_ms as f64 / 1000.0,
            range.end_ms as f64 / 1000.0,
            segment.byte_size()
        );

        let started = Instant::now();
        let call = self
            .capability
            .transcribe(segment, self.options.language.as_deref());
        let outcome = match self.options.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CapabilityError::Timeout(limit)),
            },
            None => call.await,
        };

        match outcome {
            Ok(text) => {
                let elapsed = started.elapsed();
                let realtime = range.duration_secs() / elapsed.as_secs_f64().max(1e-3);
                info!(
                    "Segment {}/{} done in {:.1}s ({:.1}x realtime)",
                    index + 1,
                    total,
                    elapsed.as_secs_f32(),
                    realtime
                );
                Ok((TranscriptFragment::new(index, range, text), elapsed))
            }
            Err(e) => {
                warn!("Segment {}/{} failed: {}", index + 1, total, e);
                Err(fail(e))
            }
        }
    }
}

//! Plan, export and transcribe one recording.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AssetError, AudioAsset};
use crate::segment::{
    AudioSegment, DEFAULT_MAX_SEGMENT_BYTES, DEFAULT_SEGMENT_SAMPLE_RATE, ExportConfig,
    ExportError, PlanError, SegmentEncoding, SegmentExporter, SegmentPlan, plan_for_asset,
    plan_segments,
};
use crate::transcribe::{
    SegmentProgress, SequenceError, SequencerOptions, TranscriptionCapability,
    TranscriptionSequencer,
};
use crate::transcript::TranscriptResult;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Transcription(SequenceError),
    #[error("Cannot create segment directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cancelled")]
    Cancelled,
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<SequenceError> for PipelineError {
    fn from(err: SequenceError) -> Self {
        match err {
            SequenceError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Transcription(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_segment_bytes: u64,
    /// Each run writes its segment files to a fresh subdirectory of this one
    pub segments_dir: PathBuf,
    /// Forced segment encoding; `None` picks one per source format
    pub encoding: Option<SegmentEncoding>,
    pub sample_rate: u32,
    pub language: Option<String>,
    pub call_timeout: Option<Duration>,
    pub concurrency: usize,
    /// Leave segment files on disk after the run
    pub keep_segments: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            segments_dir: std::env::temp_dir().join("scribe-segments"),
            encoding: None,
            sample_rate: DEFAULT_SEGMENT_SAMPLE_RATE,
            language: None,
            call_timeout: Some(Duration::from_secs(300)),
            concurrency: 1,
            keep_segments: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Planned { segments: usize },
    Exported { index: usize, total: usize },
    Transcribed(SegmentProgress),
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub asset: AudioAsset,
    pub plan: SegmentPlan,
    pub result: TranscriptResult,
    /// Segment files left on disk when `keep_segments` is set
    pub kept_segments: Vec<PathBuf>,
}

pub struct Pipeline {
    config: PipelineConfig,
    capability: Arc<dyn TranscriptionCapability>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, capability: Arc<dyn TranscriptionCapability>) -> Self {
        Self { config, capability }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.capability.model()
    }

    /// Read size and duration of the file at `path`
    pub async fn probe(&self, path: &Path) -> Result<AudioAsset, PipelineError> {
        let path = path.to_path_buf();
        let asset = tokio::task::spawn_blocking(move || AudioAsset::open(path)).await??;
        Ok(asset)
    }

    pub async fn transcribe_file<F>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<PipelineOutcome, PipelineError>
    where
        F: Fn(PipelineEvent) + Send + Sync,
    {
        let asset = self.probe(path).await?;
        self.transcribe_asset(asset, cancel, on_event).await
    }

    /// Segment ranges for `asset`.
    ///
    /// Sources that are re-encoded on export may be split into more segments
    /// than their byte size alone asks for, so that every encoded segment
    /// stays under the limit.
    pub fn plan(&self, asset: &AudioAsset) -> Result<SegmentPlan, PlanError> {
        let max = self.config.max_segment_bytes;
        let plan = plan_for_asset(asset, max)?;
        if plan.is_single() {
            return Ok(plan);
        }

        let upload_size = self.exporter(&self.config.segments_dir).planning_size(asset);
        if upload_size <= asset.byte_size() {
            return Ok(plan);
        }

        let plan = plan_segments(upload_size, asset.duration_ms(), max)?;
        info!(
            "{} re-encodes to about {} bytes, planning {} segments",
            asset.name(),
            upload_size,
            plan.len()
        );
        Ok(plan)
    }

    /// Split `asset` as needed and transcribe every part in order.
    ///
    /// Segment files are removed when the run ends, whether it succeeds,
    /// fails or is cancelled, unless `keep_segments` is set.
    pub async fn transcribe_asset<F>(
        &self,
        asset: AudioAsset,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<PipelineOutcome, PipelineError>
    where
        F: Fn(PipelineEvent) + Send + Sync,
    {
        let plan = self.plan(&asset)?;
        on_event(PipelineEvent::Planned {
            segments: plan.len(),
        });

        // outlives `segments`, so it is removed after their files
        let run_dir = if plan.is_single() {
            None
        } else {
            Some(self.create_run_dir(&asset)?)
        };
        let mut segments = match &run_dir {
            None => vec![AudioSegment::whole(&asset)],
            Some(dir) => {
                self.export_segments(&asset, &plan, dir.path(), cancel, &on_event)
                    .await?
            }
        };

        let options = SequencerOptions {
            language: self.config.language.clone(),
            call_timeout: self.config.call_timeout,
            max_segment_bytes: self.config.max_segment_bytes,
            concurrency: self.config.concurrency,
        };
        let sequencer = TranscriptionSequencer::new(self.capability.as_ref(), options)
            .with_progress(|progress| on_event(PipelineEvent::Transcribed(progress.clone())));

        let result = sequencer.run(&segments, cancel).await?;

        let mut kept_segments = Vec::new();
        if self.config.keep_segments {
            for segment in segments.iter_mut().filter(|s| s.is_ephemeral()) {
                segment.keep();
                kept_segments.push(segment.path().to_path_buf());
            }
            if let Some(dir) = run_dir {
                let kept_dir = dir.keep();
                info!("Kept {} segment file(s) in {:?}", kept_segments.len(), kept_dir);
            }
        }

        Ok(PipelineOutcome {
            asset,
            plan,
            result,
            kept_segments,
        })
    }

    fn exporter(&self, output_dir: &Path) -> SegmentExporter {
        SegmentExporter::new(ExportConfig {
            output_dir: output_dir.to_path_buf(),
            max_segment_bytes: self.config.max_segment_bytes,
            encoding: self.config.encoding,
            sample_rate: self.config.sample_rate,
        })
    }

    /// `<segments_dir>/<stem>-XXXXXX`, unique to this run
    fn create_run_dir(&self, asset: &AudioAsset) -> Result<TempDir, PipelineError> {
        fs::create_dir_all(&self.config.segments_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", asset.stem()))
            .tempdir_in(&self.config.segments_dir)?;
        debug!("Writing segments of {} to {:?}", asset.name(), dir.path());
        Ok(dir)
    }

    async fn export_segments<F>(
        &self,
        asset: &AudioAsset,
        plan: &SegmentPlan,
        output_dir: &Path,
        cancel: &CancellationToken,
        on_event: &F,
    ) -> Result<Vec<AudioSegment>, PipelineError>
    where
        F: Fn(PipelineEvent) + Send + Sync,
    {
        let exporter = self.exporter(output_dir);
        let total = plan.len();
        let mut segments = Vec::with_capacity(total);

        for (index, range) in plan.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let exporter = exporter.clone();
            let source = asset.clone();
            let task = tokio::task::spawn_blocking(move || {
                exporter.export_segment(&source, index, total, range)
            });

            // an abandoned export still drops its segment, removing the file
            let segment = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Export cancelled at segment {}/{}", index + 1, total);
                    return Err(PipelineError::Cancelled);
                }
                exported = task => exported??,
            };

            on_event(PipelineEvent::Exported { index, total });
            segments.push(segment);
        }

        Ok(segments)
    }
}

//! Local transcription with whisper.cpp, for running without an API key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::capability::{CapabilityError, TranscriptionCapability};
use crate::audio::{DecodeError, decode_window};
use crate::segment::{AudioSegment, DEFAULT_SEGMENT_SAMPLE_RATE};

/// Consecutive identical lines allowed before the rest are dropped as
/// hallucinated repeats
const MAX_REPEATS: usize = 2;

/// Available Whisper model sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperModel {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    pub fn hf_url(&self) -> String {
        format!(
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
            self.filename()
        )
    }

    pub fn filename(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "ggml-tiny.bin",
            WhisperModel::Base => "ggml-base.bin",
            WhisperModel::Small => "ggml-small.bin",
            WhisperModel::Medium => "ggml-medium.bin",
            WhisperModel::Large => "ggml-large-v3.bin",
        }
    }

    /// Approximate download size in MB
    pub fn size_mb(&self) -> u64 {
        match self {
            WhisperModel::Tiny => 75,
            WhisperModel::Base => 142,
            WhisperModel::Small => 466,
            WhisperModel::Medium => 1500,
            WhisperModel::Large => 3100,
        }
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::Large => "large",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large" => Ok(WhisperModel::Large),
            _ => Err(format!("Unknown model: {}. Use tiny, base, small, medium, or large", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum WhisperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to download model: {0}")]
    Download(String),
    #[error("Failed to initialize Whisper: {0}")]
    Init(String),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Transcription failed: {0}")]
    Transcription(String),
}

impl From<WhisperError> for CapabilityError {
    fn from(err: WhisperError) -> Self {
        match err {
            WhisperError::Io(e) => CapabilityError::Io(e),
            other => CapabilityError::Local(other.to_string()),
        }
    }
}

/// A downloaded model is considered complete at half its nominal size
pub fn is_model_downloaded(model: WhisperModel, models_dir: &Path) -> bool {
    std::fs::metadata(models_dir.join(model.filename()))
        .map(|m| m.len() >= model.size_mb() * 1024 * 1024 / 2)
        .unwrap_or(false)
}

/// Fetch `model` from Hugging Face into `models_dir` unless already present
pub async fn download_model(model: WhisperModel, models_dir: &Path) -> Result<PathBuf, WhisperError> {
    let path = models_dir.join(model.filename());
    if is_model_downloaded(model, models_dir) {
        info!("Model {} already downloaded at {:?}", model, path);
        return Ok(path);
    }

    tokio::fs::create_dir_all(models_dir).await?;
    info!("Downloading Whisper {} model (~{}MB)...", model, model.size_mb());

    let url = model.hf_url();
    let response = reqwest::get(&url)
        .await
        .map_err(|e| WhisperError::Download(format!("HTTP request failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(WhisperError::Download(format!("HTTP {} from {}", response.status(), url)));
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let temp_path = path.with_extension("bin.tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| WhisperError::Download(format!("Failed to read response: {}", e)))?;
        file.write_all(&chunk).await?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    pb.finish_with_message("Download complete");

    tokio::fs::rename(&temp_path, &path).await?;
    info!("Model downloaded to {:?}", path);
    Ok(path)
}

/// whisper.cpp running in-process
pub struct LocalWhisper {
    ctx: Arc<WhisperContext>,
    model_name: String,
    n_threads: i32,
}

impl LocalWhisper {
    /// Download `model` if needed and load it
    pub async fn load(model: WhisperModel, models_dir: &Path) -> Result<Self, WhisperError> {
        let path = download_model(model, models_dir).await?;
        info!("Loading Whisper {} model...", model);

        let ctx = tokio::task::spawn_blocking(move || {
            let path = path
                .to_str()
                .ok_or_else(|| WhisperError::Init(format!("non UTF-8 model path {:?}", path)))?;
            WhisperContext::new_with_params(path, WhisperContextParameters::default())
                .map_err(|e| WhisperError::Init(format!("Failed to load model: {}", e)))
        })
        .await
        .map_err(|e| WhisperError::Init(e.to_string()))??;

        let n_threads = std::thread::available_parallelism()
            .map(|p| p.get() as i32)
            .unwrap_or(4);
        info!("Whisper model loaded (using {} threads)", n_threads);

        Ok(Self {
            ctx: Arc::new(ctx),
            model_name: format!("whisper.cpp/{}", model),
            n_threads,
        })
    }
}

fn run_whisper(
    ctx: &WhisperContext,
    samples: &[f32],
    language: Option<&str>,
    n_threads: i32,
) -> Result<String, WhisperError> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_n_threads(n_threads);
    params.set_token_timestamps(false);

    params.set_no_speech_thold(0.6);
    params.set_entropy_thold(2.4);
    params.set_logprob_thold(-1.0);
    params.set_temperature(0.0);
    params.set_temperature_inc(0.2);
    params.set_no_context(true);
    params.set_suppress_non_speech_tokens(true);

    params.set_language(Some(language.unwrap_or("auto")));
    params.set_translate(false);

    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_print_special(false);

    let mut state = ctx
        .create_state()
        .map_err(|e| WhisperError::Transcription(format!("Failed to create state: {}", e)))?;
    state
        .full(params, samples)
        .map_err(|e| WhisperError::Transcription(format!("Inference failed: {}", e)))?;

    let num_segments = state
        .full_n_segments()
        .map_err(|e| WhisperError::Transcription(format!("Failed to get segments: {}", e)))?;

    let mut lines = Vec::with_capacity(num_segments.max(0) as usize);
    for i in 0..num_segments {
        let text = state
            .full_get_segment_text(i)
            .map_err(|e| WhisperError::Transcription(format!("Failed to get text: {}", e)))?;
        lines.push(text);
    }

    Ok(collapse_repeats(lines).join(" "))
}

/// Trim lines, drop empty ones and cut runs of identical lines down to
/// `MAX_REPEATS`
fn collapse_repeats(lines: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::with_capacity(lines.len());
    let mut run = 0;

    for line in lines {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if kept.last() == Some(&line) {
            run += 1;
            if run >= MAX_REPEATS {
                continue;
            }
        } else {
            run = 0;
        }
        kept.push(line);
    }

    kept
}

#[async_trait]
impl TranscriptionCapability for LocalWhisper {
    async fn transcribe(
        &self,
        segment: &AudioSegment,
        language: Option<&str>,
    ) -> Result<String, CapabilityError> {
        let path = segment.path().to_path_buf();
        let range = segment.range();
        let ctx = Arc::clone(&self.ctx);
        let language = language.map(str::to_string);
        let n_threads = self.n_threads;
        let started = Instant::now();

        let text = tokio::task::spawn_blocking(move || -> Result<String, WhisperError> {
            // segment files cover their own range, so decode them whole
            let mut samples = Vec::new();
            decode_window::<WhisperError, _>(&path, 0..u64::MAX, DEFAULT_SEGMENT_SAMPLE_RATE, |block| {
                samples.extend_from_slice(block);
                Ok(())
            })?;
            run_whisper(&ctx, &samples, language.as_deref(), n_threads)
        })
        .await
        .map_err(|e| CapabilityError::Local(e.to_string()))??;

        info!(
            "Transcribed {} locally in {:.1}s ({:.1}x realtime)",
            segment.file_name(),
            started.elapsed().as_secs_f32(),
            range.duration_secs() / started.elapsed().as_secs_f64().max(1e-3)
        );
        Ok(text)
    }

    fn model(&self) -> &str {
        &self.model_name
    }
}

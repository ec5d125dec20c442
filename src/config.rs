//! Settings read from the environment (and `.env`, loaded by the binary).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::history::HISTORY_FILE_NAME;
use crate::pipeline::PipelineConfig;
use crate::segment::{DEFAULT_MAX_SEGMENT_BYTES, DEFAULT_SEGMENT_SAMPLE_RATE};
use crate::transcribe::{DEFAULT_API_URL, DEFAULT_MODEL};

pub const OUTPUT_DIR_NAME: &str = "Whisper_Transcriptions";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No API key: set OPENAI_API_KEY (or WISPER)")]
    MissingApiKey,
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Could not determine the home directory; set TRANSCRIBE_OUTPUT_DIR")]
    NoHomeDir,
}

/// Which speech-to-text implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAi,
    Local,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "api" => Ok(Backend::OpenAi),
            "local" | "whisper" => Ok(Backend::Local),
            _ => Err(format!("Unknown backend: {}. Use openai or local", s)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::OpenAi => write!(f, "openai"),
            Backend::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    /// `None` lets the service detect the language
    pub language: Option<String>,
    pub max_segment_bytes: u64,
    /// Transcripts, history and working files live here
    pub output_dir: PathBuf,
    pub call_timeout: Duration,
    pub sample_rate: u32,
    pub concurrency: usize,
    pub backend: Backend,
    /// whisper.cpp model size for the local backend
    pub whisper_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let output_dir = match get("TRANSCRIBE_OUTPUT_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(OUTPUT_DIR_NAME),
        };

        let language = get("TRANSCRIBE_LANGUAGE").filter(|l| !l.eq_ignore_ascii_case("auto"));

        let max_segment_bytes = parse(&get, "MAX_SEGMENT_BYTES", DEFAULT_MAX_SEGMENT_BYTES)?;
        if max_segment_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_SEGMENT_BYTES",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            api_key: get("OPENAI_API_KEY").or_else(|| get("WISPER")),
            api_url: get("TRANSCRIBE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: get("TRANSCRIBE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            language,
            max_segment_bytes,
            output_dir,
            call_timeout: Duration::from_secs(parse(&get, "TRANSCRIBE_TIMEOUT_SECS", 300)?),
            sample_rate: parse(&get, "SEGMENT_SAMPLE_RATE", DEFAULT_SEGMENT_SAMPLE_RATE)?,
            concurrency: parse::<usize>(&get, "TRANSCRIBE_CONCURRENCY", 1)?.max(1),
            backend: parse(&get, "TRANSCRIBE_BACKEND", Backend::OpenAi)?,
            whisper_model: get("WHISPER_MODEL").unwrap_or_else(|| "base".to_string()),
        })
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }

    /// The key with all but its first and last four characters hidden
    pub fn masked_api_key(&self) -> String {
        match self.api_key.as_deref() {
            None => "(not set)".to_string(),
            Some(key) if key.chars().count() <= 12 => "*".repeat(key.chars().count()),
            Some(key) => {
                let chars: Vec<char> = key.chars().collect();
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{}...{}", head, tail)
            }
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.output_dir.join(HISTORY_FILE_NAME)
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.output_dir.join("segments")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.output_dir.join("models")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_segment_bytes: self.max_segment_bytes,
            segments_dir: self.segments_dir(),
            encoding: None,
            sample_rate: self.sample_rate,
            language: self.language.clone(),
            call_timeout: Some(self.call_timeout),
            concurrency: self.concurrency,
            keep_segments: false,
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

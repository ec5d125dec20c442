//! Assembled transcripts and their on-disk formats.
//!
//! Supports plain text, JSON and SRT output. SRT cues follow segment
//! boundaries, so they are only as fine-grained as the split.

use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::segment::TimeRange;

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Text returned for one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    /// 0-based segment index
    pub index: usize,
    pub range: TimeRange,
    /// Trimmed text, possibly empty for silent segments
    pub text: String,
}

impl TranscriptFragment {
    pub fn new(index: usize, range: TimeRange, text: impl AsRef<str>) -> Self {
        Self {
            index,
            range,
            text: text.as_ref().trim().to_string(),
        }
    }
}

/// One fragment per segment, in segment order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptResult {
    fragments: Vec<TranscriptFragment>,
}

impl TranscriptResult {
    /// Fragments may arrive in any order; they are stored by segment index.
    pub fn from_fragments(mut fragments: Vec<TranscriptFragment>) -> Self {
        fragments.sort_by_key(|f| f.index);
        Self { fragments }
    }

    pub fn fragments(&self) -> &[TranscriptFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Fragments joined by newlines, with surrounding whitespace removed
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    /// Transcript text only
    Text,
    /// Compact JSON document
    Json,
    /// Pretty-printed JSON document
    JsonPretty,
    /// SubRip subtitles, one cue per segment
    Srt,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Json | ExportFormat::JsonPretty => "json",
            ExportFormat::Srt => "srt",
        }
    }

    /// Parse a comma-separated list such as `txt,json`
    pub fn parse_list(s: &str) -> Result<Vec<Self>, String> {
        let mut formats = Vec::new();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let format = name.parse::<Self>()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "txt" | "text" => Ok(ExportFormat::Text),
            "json" => Ok(ExportFormat::Json),
            "json-pretty" | "json_pretty" => Ok(ExportFormat::JsonPretty),
            "srt" => Ok(ExportFormat::Srt),
            _ => Err(format!("Unknown format: {}. Use txt, json, json-pretty or srt", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Source file name
    pub name: String,
    /// Creation time (RFC 3339)
    pub created_at: String,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A transcript ready to be written out: the final (possibly edited) text
/// plus the per-segment fragments it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub metadata: DocumentMetadata,
    pub text: String,
    pub segments: Vec<TranscriptFragment>,
}

impl TranscriptDocument {
    pub fn new(name: impl Into<String>, duration_ms: u64, result: &TranscriptResult) -> Self {
        Self {
            metadata: DocumentMetadata {
                name: name.into(),
                created_at: Local::now().to_rfc3339(),
                duration_secs: duration_ms as f64 / 1000.0,
                model: None,
                language: None,
            },
            text: result.text(),
            segments: result.fragments().to_vec(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.metadata.language = language;
        self
    }

    /// Replace the text with a manually corrected version
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn render(&self, format: ExportFormat) -> Result<String, TranscriptError> {
        Ok(match format {
            ExportFormat::Text => format!("{}\n", self.text),
            ExportFormat::Json => serde_json::to_string(self)?,
            ExportFormat::JsonPretty => serde_json::to_string_pretty(self)?,
            ExportFormat::Srt => self.to_srt(),
        })
    }

    pub fn to_srt(&self) -> String {
        let mut output = String::new();

        for (i, fragment) in self.segments.iter().filter(|f| !f.text.is_empty()).enumerate() {
            let _ = writeln!(output, "{}", i + 1);
            let _ = writeln!(
                output,
                "{} --> {}",
                format_srt_time(fragment.range.start_ms),
                format_srt_time(fragment.range.end_ms)
            );
            let _ = writeln!(output, "{}", fragment.text);
            let _ = writeln!(output);
        }

        output
    }

    /// Write `<base_name>.<ext>` into `dir`
    pub fn save(
        &self,
        dir: &Path,
        base_name: &str,
        format: ExportFormat,
    ) -> Result<PathBuf, TranscriptError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", base_name, format.extension()));
        fs::write(&path, self.render(format)?)?;
        info!("Saved {:?} transcript to {:?}", format, path);
        Ok(path)
    }
}

/// `<stem>_<YYYYmmdd_HHMMSS>`, the base name shared by all exports of a run
pub fn output_base_name(stem: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", stem, at.format("%Y%m%d_%H%M%S"))
}

/// Non-empty trimmed lines, the unit a document layout works with
pub fn paragraphs(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Format milliseconds as an SRT timestamp (HH:MM:SS,mmm)
fn format_srt_time(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let secs = (ms % 60_000) / 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, ms % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fragment(index: usize, text: &str) -> TranscriptFragment {
        let start = index as u64 * 20_000;
        TranscriptFragment::new(index, TimeRange::new(start, start + 20_000), text)
    }

    #[test]
    fn test_fragments_joined_with_newline() {
        let result = TranscriptResult::from_fragments(vec![fragment(0, "Hello"), fragment(1, "world")]);
        assert_eq!(result.text(), "Hello\nworld");
    }

    #[test]
    fn test_fragments_and_result_trimmed() {
        let result = TranscriptResult::from_fragments(vec![
            fragment(0, "  \n"),
            fragment(1, " Bonjour à tous.\n"),
            fragment(2, "\tFin. "),
        ]);
        assert_eq!(result.len(), 3);
        assert_eq!(result.fragments()[0].text, "");
        assert_eq!(result.text(), "Bonjour à tous.\nFin.");
    }

    #[test]
    fn test_fragments_reordered_by_index() {
        let result = TranscriptResult::from_fragments(vec![
            fragment(2, "three"),
            fragment(0, "one"),
            fragment(1, "two"),
        ]);
        assert_eq!(result.text(), "one\ntwo\nthree");
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("TXT".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert_eq!("json-pretty".parse::<ExportFormat>().unwrap(), ExportFormat::JsonPretty);
        assert!("docx".parse::<ExportFormat>().is_err());
        assert_eq!(
            ExportFormat::parse_list("txt, json,txt").unwrap(),
            vec![ExportFormat::Text, ExportFormat::Json]
        );
        assert_eq!(ExportFormat::Srt.extension(), "srt");
    }

    #[test]
    fn test_output_base_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(output_base_name("interview", at), "interview_20240309_140507");
    }

    #[test]
    fn test_paragraphs_skip_blank_lines() {
        assert_eq!(paragraphs("  one \n\n two\n   \n"), vec!["one", "two"]);
    }

    #[test]
    fn test_srt_time_format() {
        assert_eq!(format_srt_time(0), "00:00:00,000");
        assert_eq!(format_srt_time(3_723_456), "01:02:03,456");
    }

    #[test]
    fn test_document_keeps_edited_text() {
        let result = TranscriptResult::from_fragments(vec![fragment(0, "Helo"), fragment(1, "world")]);
        let doc = TranscriptDocument::new("talk.mp3", 40_000, &result)
            .with_model("whisper-1")
            .with_text("Hello\nworld");

        assert_eq!(doc.render(ExportFormat::Text).unwrap(), "Hello\nworld\n");
        assert_eq!(doc.segments[0].text, "Helo");

        let srt = doc.to_srt();
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:20,000\nHelo\n"));
        assert!(srt.contains("2\n00:00:20,000 --> 00:00:40,000\nworld\n"));
    }

    #[test]
    fn test_save_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let result = TranscriptResult::from_fragments(vec![fragment(0, "Salut")]);
        let doc = TranscriptDocument::new("note.m4a", 20_000, &result)
            .with_language(Some("fr".to_string()));

        let path = doc.save(dir.path(), "note_20240101_000000", ExportFormat::JsonPretty).unwrap();
        assert_eq!(path.file_name().unwrap(), "note_20240101_000000.json");

        let loaded: TranscriptDocument =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.metadata.language.as_deref(), Some("fr"));
        assert!(loaded.metadata.model.is_none());
    }
}

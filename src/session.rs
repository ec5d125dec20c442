//! Lifecycle of one file, from upload through transcription to export.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::audio::AudioAsset;
use crate::transcript::TranscriptResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Uploaded,
    Transcribing,
    Transcribed,
    Exporting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Uploaded => "uploaded",
            SessionState::Transcribing => "transcribing",
            SessionState::Transcribed => "transcribed",
            SessionState::Exporting => "exporting",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    asset: Option<AudioAsset>,
    result: Option<TranscriptResult>,
    /// Transcript text including manual corrections
    text: String,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            asset: None,
            result: None,
            text: String::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn asset(&self) -> Option<&AudioAsset> {
        self.asset.as_ref()
    }

    pub fn result(&self) -> Option<&TranscriptResult> {
        self.result.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn require(&self, allowed: &[SessionState], action: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                state: self.state,
                action,
            })
        }
    }

    fn enter(&mut self, next: SessionState) {
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    /// Select a new file, discarding any previous transcript
    pub fn upload(&mut self, asset: AudioAsset) -> Result<(), SessionError> {
        self.require(
            &[SessionState::Idle, SessionState::Uploaded, SessionState::Transcribed],
            "upload a file",
        )?;
        self.asset = Some(asset);
        self.result = None;
        self.text.clear();
        self.enter(SessionState::Uploaded);
        Ok(())
    }

    /// Returns the asset to transcribe
    pub fn begin_transcription(&mut self) -> Result<AudioAsset, SessionError> {
        self.require(&[SessionState::Uploaded], "start transcription")?;
        let asset = self.asset.clone().ok_or(SessionError::InvalidTransition {
            state: self.state,
            action: "start transcription",
        })?;
        self.enter(SessionState::Transcribing);
        Ok(asset)
    }

    pub fn complete_transcription(&mut self, result: TranscriptResult) -> Result<(), SessionError> {
        self.require(&[SessionState::Transcribing], "complete transcription")?;
        self.text = result.text();
        self.result = Some(result);
        self.enter(SessionState::Transcribed);
        Ok(())
    }

    /// Back to `Uploaded` so the same file can be retried
    pub fn fail_transcription(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionState::Transcribing], "fail transcription")?;
        self.enter(SessionState::Uploaded);
        Ok(())
    }

    pub fn edit(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.require(&[SessionState::Transcribed], "edit the transcript")?;
        self.text = text.into();
        Ok(())
    }

    /// Returns the text to export
    pub fn begin_export(&mut self) -> Result<String, SessionError> {
        self.require(&[SessionState::Transcribed], "export")?;
        self.enter(SessionState::Exporting);
        Ok(self.text.clone())
    }

    pub fn finish_export(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionState::Exporting], "finish export")?;
        self.enter(SessionState::Transcribed);
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

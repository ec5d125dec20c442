use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

use super::capability::{CapabilityError, TranscriptionCapability};
use crate::segment::AudioSegment;

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "whisper-1";

/// OpenAI-compatible `/audio/transcriptions` client asking for plain text
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'))
    }

    fn form(&self, segment: &AudioSegment, bytes: Vec<u8>, language: Option<&str>) -> Result<Form, CapabilityError> {
        let part = Part::bytes(bytes)
            .file_name(segment.file_name())
            .mime_str(segment.format().mime_type())?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "text");
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl TranscriptionCapability for OpenAiTranscriber {
    async fn transcribe(
        &self,
        segment: &AudioSegment,
        language: Option<&str>,
    ) -> Result<String, CapabilityError> {
        let bytes = tokio::fs::read(segment.path()).await?;
        let size = bytes.len();
        let form = self.form(segment, bytes, language)?;
        let started = Instant::now();

        debug!("POST {} ({} bytes, model {})", self.endpoint(), size, self.model);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CapabilityError::Api {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        info!(
            "Transcribed {} in {:.1}s ({} chars)",
            segment.file_name(),
            started.elapsed().as_secs_f32(),
            body.len()
        );

        Ok(body)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = OpenAiTranscriber::new(
            "https://api.example.com/v1/",
            "sk-test",
            DEFAULT_MODEL,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "https://api.example.com/v1/audio/transcriptions");
        assert_eq!(client.model(), "whisper-1");
    }

    #[tokio::test]
    async fn test_missing_segment_file_is_io_error() {
        let client =
            OpenAiTranscriber::new(DEFAULT_API_URL, "sk-test", DEFAULT_MODEL, Duration::from_secs(5))
                .unwrap();
        let segment = AudioSegment::new(
            0,
            crate::segment::TimeRange::new(0, 1000),
            "/nonexistent/part1.mp3",
            10,
        );

        let err = client.transcribe(&segment, Some("fr")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Io(_)));
    }
}

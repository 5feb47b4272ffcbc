//! OpenAI-compatible Whisper transcription.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{Transcriber, Transcript, TranscriptionError, WordTiming};

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct VerboseTranscript {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<WordTiming>,
}

impl WhisperTranscriber {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_config(services: &hiveconf::ServicesConfig) -> Self {
        Self::new(&services.asr_url, &services.api_key, &services.asr_model)
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript, TranscriptionError> {
        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");

        let mut builder = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form)
            .timeout(TRANSCRIBE_TIMEOUT);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TranscriptionError::Request("transcription request timed out".to_string())
            } else {
                TranscriptionError::Request(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp.text().await.unwrap_or_default();
            return Err(TranscriptionError::Request(format!(
                "transcription API error {status}: {error_body}"
            )));
        }

        let body: VerboseTranscript = resp
            .json()
            .await
            .map_err(|e| TranscriptionError::Request(format!("invalid transcription response: {e}")))?;

        Ok(Transcript {
            text: body.text,
            words: body.words,
        })
    }
}

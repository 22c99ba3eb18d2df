//! HTTP speech-to-text provider

use async_trait::async_trait;

use super::AsrProvider;
use crate::error::Stage;
use crate::{audio, Error, Result};

/// Response from the Whisper-style transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes utterances through an `OpenAI`-compatible Whisper endpoint
pub struct HttpAsr {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl HttpAsr {
    /// Create a transcriber with the given credentials
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AsrProvider for HttpAsr {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String> {
        tracing::debug!(pcm_bytes = pcm.len(), "starting transcription");

        let wav = audio::pcm_to_wav(pcm, sample_rate)?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::provider(Stage::Asr, e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "transcription request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::provider(
                Stage::Asr,
                format!("transcription API error {status}: {body}"),
            ));
        }

        let result: TranscriptionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            e
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

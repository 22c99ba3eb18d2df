//! HTTP text-to-speech provider

use async_trait::async_trait;
use futures::StreamExt;

use super::{AudioStream, TtsProvider};
use crate::error::Stage;
use crate::{Error, Result};

/// Synthesizes speech through an `OpenAI`-compatible speech endpoint
///
/// Requests raw PCM so chunks can be forwarded to the device as they arrive,
/// without container parsing.
pub struct HttpTts {
    client: reqwest::Client,
    api_key: String,
    model: String,
    voice: String,
    speed: f64,
}

impl HttpTts {
    /// Create a synthesizer with the given credentials and voice
    #[must_use]
    pub fn new(api_key: String, model: String, voice: String, speed: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            voice,
            speed,
        }
    }
}

#[async_trait]
impl TtsProvider for HttpTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
            speed: f64,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "pcm",
            speed: self.speed,
        };

        tracing::debug!(chars = text.chars().count(), "starting synthesis");

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "synthesis request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "synthesis API error");
            return Err(Error::provider(
                Stage::Tts,
                format!("synthesis API error {status}: {body}"),
            ));
        }

        let chunks = response.bytes_stream().map(|part| {
            part.map(|b| b.to_vec())
                .map_err(|e| Error::provider(Stage::Tts, e.to_string()))
        });

        Ok(chunks.boxed())
    }
}

//! HTTP streaming LLM provider

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{LlmProvider, TextStream};
use crate::error::Stage;
use crate::prompt::ChatMessage;
use crate::{Error, Result};

/// Request body for the chat completions endpoint
#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

/// One server-sent chunk of a streamed completion
#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    delta: ChatDelta,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Generates replies through an `OpenAI`-compatible chat completions endpoint
pub struct HttpLlm {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl HttpLlm {
    /// Create a generator with the given credentials and model
    #[must_use]
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        temperature: f64,
        max_tokens: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<TextStream> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: true,
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "starting generation");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "generation request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "generation API error");
            return Err(Error::provider(
                Stage::Llm,
                format!("generation API error {status}: {body}"),
            ));
        }

        // Bridge the SSE byte stream to a fragment stream
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let mut bytes = response.bytes_stream();
        tokio::spawn(async move {
            let mut buf = String::new();
            while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(part) => part,
                    Err(e) => {
                        let _ = tx.send(Err(Error::provider(Stage::Llm, e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&part));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<ChatChunk>(data) {
                        Ok(chunk) => {
                            let fragment = chunk
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.clone());
                            if let Some(fragment) = fragment {
                                if tx.send(Ok(fragment)).await.is_err() {
                                    // Receiver dropped: generation was cancelled
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed stream chunk");
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

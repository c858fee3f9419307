use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use url::Url;

use crate::error::{Error, ErrorDetails};

/// A stream of text deltas from the model.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Boundary to the model backend. The gatekeeper has already charged for the
/// message by the time a provider is called; providers only produce tokens.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<String>,
    ) -> Result<ChatStream, Error>;
}

const OPENAI_COMPATIBLE: &str = "openai_compatible";

/// Streams completions from any OpenAI-compatible `/chat/completions`
/// endpoint over SSE.
pub struct OpenAiCompatProvider {
    http_client: reqwest::Client,
    base_url: Url,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatProvider {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        model: String,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            http_client,
            base_url,
            model,
            api_key,
        }
    }

    fn completions_url(&self) -> Result<Url, Error> {
        self.base_url.join("chat/completions").map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to build completions URL: {e}"),
            })
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<String>,
    ) -> Result<ChatStream, Error> {
        let model = model_override.unwrap_or_else(|| self.model.clone());
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let mut request = self.http_client.post(self.completions_url()?).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            Error::new(ErrorDetails::InferenceClient {
                message: format!("Error sending request: {e}"),
                status_code: e.status(),
                provider_type: OPENAI_COMPATIBLE.to_string(),
            })
        })?;

        if !response.status().is_success() {
            let status_code = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::InferenceClient {
                message,
                status_code: Some(status_code),
                provider_type: OPENAI_COMPATIBLE.to_string(),
            }));
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = async_stream::stream! {
            while let Some(event) = events.next().await {
                match event {
                    Err(e) => {
                        yield Err(Error::new(ErrorDetails::StreamError {
                            message: format!("Error in event stream: {e}"),
                        }));
                        break;
                    }
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                            Err(e) => {
                                yield Err(Error::new(ErrorDetails::Serialization {
                                    message: format!(
                                        "Error parsing chunk from model provider: {e}"
                                    ),
                                }));
                                break;
                            }
                            Ok(chunk) => {
                                let delta = chunk
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|choice| choice.delta.content);
                                if let Some(delta) = delta {
                                    if !delta.is_empty() {
                                        yield Ok(delta);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Echoes the last user message back word by word. Used in development and
/// in tests where no model backend is available.
pub struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<String>,
    ) -> Result<ChatStream, Error> {
        let last_user_message = messages
            .into_iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content)
            .ok_or_else(|| {
                Error::new(ErrorDetails::InvalidRequest {
                    message: "At least one user message is required".to_string(),
                })
            })?;

        let words: Vec<String> = last_user_message
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect();

        Ok(Box::pin(tokio_stream::iter(
            words.into_iter().map(Ok::<String, Error>),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_provider_streams_last_user_message() {
        let provider = EchoProvider;
        let stream = provider
            .stream_chat(
                vec![
                    ChatMessage {
                        role: Role::User,
                        content: "first question".to_string(),
                    },
                    ChatMessage {
                        role: Role::Assistant,
                        content: "an answer".to_string(),
                    },
                    ChatMessage {
                        role: Role::User,
                        content: "explain borrow checking".to_string(),
                    },
                ],
                None,
            )
            .await
            .unwrap();

        let deltas: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(deltas.join(""), "explain borrow checking ");
    }

    #[tokio::test]
    async fn test_echo_provider_requires_a_user_message() {
        let provider = EchoProvider;
        let result = provider
            .stream_chat(
                vec![ChatMessage {
                    role: Role::System,
                    content: "you are a mentor".to_string(),
                }],
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_chunk_parsing() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"index":0}],"model":"m"}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));

        // Final chunks carry an empty delta
        let chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.content, None);
    }
}

use super::{InferenceRequest, ModelError, ModelReply, TokenUsage, VisionModel};
use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct OpenAiVisionModel {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsageRaw>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageRaw {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiVisionModel {
    pub fn new(config: &InferenceConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent("scrapesight/0.1")
            .build()?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    /// Reads the API key from the environment variable named in the config.
    pub fn from_env(config: &InferenceConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| Error::Config(format!("{} not set", config.api_key_env)))?;
        Self::new(config, api_key)
    }

    fn body(&self, request: &InferenceRequest) -> serde_json::Value {
        let image = format!(
            "data:image/png;base64,{}",
            STANDARD.encode(&request.screenshot_png)
        );
        json!({
            "model": self.model,
            "temperature": 0.0,
            "max_tokens": self.max_output_tokens,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.system_prompt },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": request.user_prompt },
                        { "type": "image_url", "image_url": { "url": image, "detail": "high" } }
                    ]
                }
            ]
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiVisionModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &InferenceRequest) -> std::result::Result<ModelReply, ModelError> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            log::warn!("Inference API error {}: {}", status, error_text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                ModelError::Unavailable(format!("{}: {}", status, error_text))
            } else {
                ModelError::Refused(format!("{}: {}", status, error_text))
            });
        }

        let raw: ChatResponseRaw = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::InvalidBody(e.to_string())
            }
        })?;

        let usage = raw.usage.map(|u| TokenUsage {
            tokens_in: u.prompt_tokens,
            tokens_out: u.completion_tokens,
        });
        let message = raw.choices.into_iter().next().map(|c| c.message);

        log::debug!(
            "Inference call to {} took {}ms ({:?})",
            self.model,
            start.elapsed().as_millis(),
            usage
        );

        Ok(match message {
            Some(message) => ModelReply {
                content: message.content.unwrap_or_default(),
                refusal: message.refusal,
                usage,
            },
            None => ModelReply {
                content: String::new(),
                refusal: None,
                usage,
            },
        })
    }
}

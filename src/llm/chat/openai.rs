use async_trait::async_trait;
use log::{ debug, info, warn };
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{ create_chat_stream, ChatClient, ChatRequest, ChatStream, Completion, Usage };
use crate::llm::stream::{ drive_stream, StreamOutcome };
use crate::llm::{ check_status, LlmConfig, LlmError };
use crate::models::chat::{ ChatMessage, Role };

pub const CHAT_COMPLETIONS_ROUTE: &str = "/v1/chat/completions";

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAIChatClient {
    http: HttpClient,
    url: String,
    model: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAIChatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self {
            http: config.http_client()?,
            url: config.endpoint(CHAT_COMPLETIONS_ROUTE),
            model: config.model.clone(),
        })
    }

    fn with_default_model(&self, mut request: ChatRequest) -> ChatRequest {
        if request.model.is_none() {
            request.model = self.model.clone();
        }
        request
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> ChatStream {
        let mut request = self.with_default_model(request);
        request.stream = true;
        let client = self.http.clone();
        let url = self.url.clone();

        create_chat_stream(move |tx| async move {
            info!(
                "Opening chat stream: model={}, messages={}",
                request.model.as_deref().unwrap_or("server default"),
                request.messages.len()
            );

            let send = client.post(&url).json(&request).send();
            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StreamOutcome::Cancelled;
                }
                resp = send => resp,
            };

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return StreamOutcome::Cancelled;
                    }
                    warn!("Chat request failed: {}", e);
                    return StreamOutcome::Failed(LlmError::Transport(e));
                }
            };

            // Reading an error body can stall as long as the request did.
            let checked = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StreamOutcome::Cancelled;
                }
                checked = check_status(resp) => checked,
            };
            let resp = match checked {
                Ok(r) => r,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return StreamOutcome::Cancelled;
                    }
                    warn!("Chat request rejected: {}", e);
                    return StreamOutcome::Failed(e);
                }
            };

            let outcome = drive_stream(resp.bytes_stream(), &cancel, &tx).await;
            debug!("Chat stream ended: {:?}", outcome);
            outcome
        })
    }

    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        let request = self.with_default_model(request).non_streaming();

        let resp = self.http.post(&self.url).json(&request).send().await?;
        let body = check_status(resp).await?.text().await?;
        let resp: OpenAIResponse = serde_json::from_str(&body)?;

        let choice = resp.choices.into_iter().next().ok_or(LlmError::EmptyCompletion)?;

        Ok(Completion {
            message: ChatMessage::new(Role::Assistant, choice.message.content.unwrap_or_default()),
            finish_reason: choice.finish_reason,
            usage: resp.usage,
        })
    }
}

pub mod openai;

use async_trait::async_trait;
use futures::Future;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;
use tokio::sync::{ mpsc, oneshot };
use tokio_util::sync::CancellationToken;

use super::stream::StreamOutcome;
use super::{ LlmConfig, LlmError };
use crate::models::chat::ChatMessage;
use self::openai::OpenAIChatClient;

const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// Sampling options for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.8,
            top_p: 0.95,
            stop: None,
            seed: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

impl ChatRequest {
    pub fn new(model: Option<String>, messages: Vec<ChatMessage>, options: &SendOptions) -> Self {
        Self {
            model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            stream: true,
            stop: options.stop.clone().filter(|s| !s.is_empty()),
            seed: options.seed,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
        }
    }

    pub fn non_streaming(mut self) -> Self {
        self.stream = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

/// A running decoder session: content deltas in arrival order, then exactly
/// one outcome.
pub struct ChatStream {
    chunks: mpsc::Receiver<String>,
    outcome: oneshot::Receiver<StreamOutcome>,
}

impl ChatStream {
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Meant to be awaited once `next_chunk` has returned `None`; chunks
    /// still queued are dropped.
    pub async fn outcome(self) -> StreamOutcome {
        drop(self.chunks);
        self.outcome.await.unwrap_or(StreamOutcome::Failed(LlmError::SessionLost))
    }
}

/// Spawns `session` with the sending half of the chunk channel; its return
/// value becomes the stream's outcome once every chunk has been queued.
pub fn create_chat_stream<F, Fut>(session: F) -> ChatStream
    where
        F: FnOnce(mpsc::Sender<String>) -> Fut + Send + 'static,
        Fut: Future<Output = StreamOutcome> + Send + 'static
{
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    tokio::spawn(async move {
        let outcome = session(tx).await;
        let _ = outcome_tx.send(outcome);
    });

    ChatStream {
        chunks: rx,
        outcome: outcome_rx,
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streaming session. Transport failures surface as the
    /// session's `Failed` outcome, never as a chunk.
    async fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> ChatStream;

    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError>;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client = OpenAIChatClient::from_config(config)?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_unset_optionals() {
        let request = ChatRequest::new(None, vec![ChatMessage::user("hi")], &SendOptions::default());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "messages": [{ "role": "user", "content": "hi" }],
                "max_tokens": 2048,
                "temperature": 0.8,
                "top_p": 0.95,
                "stream": true
            })
        );
    }

    #[test]
    fn request_carries_model_stop_and_seed() {
        let options = SendOptions {
            stop: Some(vec!["</s>".into()]),
            seed: Some(42),
            ..Default::default()
        };
        let request = ChatRequest::new(Some("m1".into()), Vec::new(), &options).non_streaming();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "m1");
        assert_eq!(json["stop"], serde_json::json!(["</s>"]));
        assert_eq!(json["seed"], 42);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn empty_stop_list_is_omitted() {
        let options = SendOptions {
            stop: Some(Vec::new()),
            ..Default::default()
        };
        let json = serde_json::to_value(ChatRequest::new(None, Vec::new(), &options)).unwrap();
        assert!(json.get("stop").is_none());
    }

    #[tokio::test]
    async fn outcome_arrives_after_all_chunks() {
        let mut stream = create_chat_stream(|tx| async move {
            for part in ["a", "b", "c"] {
                if tx.send(part.to_string()).await.is_err() {
                    return StreamOutcome::Cancelled;
                }
            }
            StreamOutcome::Completed
        });
        let mut text = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            text.push_str(&chunk);
        }
        assert_eq!(text, "abc");
        assert!(stream.outcome().await.is_completed());
    }
}

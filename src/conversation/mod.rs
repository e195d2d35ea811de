//! Conversation state and the single in-flight generation.

use log::{ debug, info, warn };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::llm::chat::{ ChatClient, ChatRequest, SendOptions };
use crate::llm::stream::StreamOutcome;
use crate::llm::LlmError;
use crate::models::chat::{ ChatMessage, Conversation };

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("a generation is already in progress")]
    Busy,
    #[error("unknown conversation '{0}'")]
    UnknownConversation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// No active conversation, or nothing to send.
    Skipped,
    Completed(ChatMessage),
    /// The committed message describes the failure.
    Failed(ChatMessage),
    /// Ended by `stop` or by deleting the conversation.
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Started {
        conversation_id: String,
    },
    Chunk {
        conversation_id: String,
        text: String,
    },
    Finished {
        conversation_id: String,
        message: Option<ChatMessage>,
    },
}

// Ends the session if the `send` future that owns it is dropped early.
struct SessionGuard<'a> {
    controller: &'a ConversationController,
    session_id: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.controller.end_session(Some(self.session_id));
    }
}

struct Session {
    id: u64,
    conversation_id: String,
    buffer: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    conversations: Vec<Conversation>,
    active_id: Option<String>,
    session: Option<Session>,
    next_session_id: u64,
}

impl ControllerState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn is_current(&self, session_id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }
}

/// Owns every conversation, the active pointer and at most one open stream
/// session. A second `send` while generating is rejected with
/// [`ControllerError::Busy`].
pub struct ConversationController {
    client: Arc<dyn ChatClient>,
    defaults: SendOptions,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ConversationController {
    pub fn new(client: Arc<dyn ChatClient>, defaults: SendOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            defaults,
            state: Mutex::new(ControllerState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn create(&self, model: &str, system_prompt: Option<&str>) -> String {
        let conversation = Conversation::new(model, system_prompt);
        let id = conversation.id.clone();
        let mut state = self.state();
        state.conversations.insert(0, conversation);
        state.active_id = Some(id.clone());
        info!("Created conversation {} with model {}", id, model);
        id
    }

    /// Removes a conversation. Deleting the active one moves the pointer to
    /// the first remaining conversation, or clears it. A generation running
    /// for it is cancelled and its partial output discarded.
    pub fn delete(&self, id: &str) -> bool {
        let mut state = self.state();
        let Some(pos) = state.conversations.iter().position(|c| c.id == id) else {
            return false;
        };
        state.conversations.remove(pos);

        let owns_session = state.session.as_ref().is_some_and(|s| s.conversation_id == id);
        let aborted = if owns_session { state.session.take() } else { None };
        if state.active_id.as_deref() == Some(id) {
            state.active_id = state.conversations.first().map(|c| c.id.clone());
        }
        drop(state);

        if let Some(session) = aborted {
            session.cancel.cancel();
            debug!("Cancelled generation for deleted conversation {}", id);
            self.emit(ControllerEvent::Finished {
                conversation_id: session.conversation_id,
                message: None,
            });
        }
        info!("Deleted conversation {}", id);
        true
    }

    pub fn set_active(&self, id: &str) -> Result<(), ControllerError> {
        let mut state = self.state();
        if !state.conversations.iter().any(|c| c.id == id) {
            return Err(ControllerError::UnknownConversation(id.to_string()));
        }
        state.active_id = Some(id.to_string());
        Ok(())
    }

    /// Sends a user message to the active conversation and streams the
    /// reply into it. Resolves once the generation has ended.
    pub async fn send(
        &self,
        content: &str,
        options: Option<SendOptions>
    ) -> Result<SendOutcome, ControllerError> {
        let content = content.trim();
        let options = options.unwrap_or_else(|| self.defaults.clone());

        let (session_id, conversation_id, cancel, request) = {
            let mut state = self.state();
            let Some(active_id) = state.active_id.clone() else {
                return Ok(SendOutcome::Skipped);
            };
            if content.is_empty() {
                return Ok(SendOutcome::Skipped);
            }
            if state.session.is_some() {
                return Err(ControllerError::Busy);
            }

            let conversation = state
                .find_mut(&active_id)
                .ok_or_else(|| ControllerError::UnknownConversation(active_id.clone()))?;
            let first_user_message = !conversation.has_user_message();
            conversation.messages.push(ChatMessage::user(content));
            if first_user_message {
                conversation.derive_title(content);
            }
            let request = ChatRequest::new(
                Some(conversation.model.clone()),
                conversation.messages.clone(),
                &options
            );

            state.next_session_id += 1;
            let session_id = state.next_session_id;
            let cancel = CancellationToken::new();
            state.session = Some(Session {
                id: session_id,
                conversation_id: active_id.clone(),
                buffer: String::new(),
                cancel: cancel.clone(),
            });
            (session_id, active_id, cancel, request)
        };

        let _guard = SessionGuard {
            controller: self,
            session_id,
        };
        self.emit(ControllerEvent::Started {
            conversation_id: conversation_id.clone(),
        });

        let mut stream = self.client.stream_chat(request, cancel).await;
        while let Some(text) = stream.next_chunk().await {
            if !self.append_chunk(session_id, &conversation_id, text) {
                break;
            }
        }

        let outcome = match stream.outcome().await {
            StreamOutcome::Completed => {
                self.commit(session_id, None).map(SendOutcome::Completed)
            }
            StreamOutcome::Failed(e) => {
                warn!("Generation for {} failed: {}", conversation_id, e);
                self.commit(session_id, Some(&e)).map(SendOutcome::Failed)
            }
            StreamOutcome::Cancelled => None,
        };
        Ok(outcome.unwrap_or(SendOutcome::Stopped))
    }

    /// Cancels the open session. Whatever was streamed so far is kept as an
    /// assistant message.
    pub fn stop(&self) -> Option<ChatMessage> {
        self.end_session(None)
    }

    // With `only` set, nothing happens unless that session is still open.
    fn end_session(&self, only: Option<u64>) -> Option<ChatMessage> {
        let mut state = self.state();
        if only.is_some_and(|id| !state.is_current(id)) {
            return None;
        }
        let session = state.session.take()?;
        session.cancel.cancel();

        let message = if session.buffer.is_empty() {
            None
        } else {
            let message = ChatMessage::assistant(session.buffer);
            if let Some(conversation) = state.find_mut(&session.conversation_id) {
                conversation.messages.push(message.clone());
            }
            Some(message)
        };
        drop(state);

        info!("Stopped generation for {}", session.conversation_id);
        self.emit(ControllerEvent::Finished {
            conversation_id: session.conversation_id,
            message: message.clone(),
        });
        message
    }

    fn append_chunk(&self, session_id: u64, conversation_id: &str, text: String) -> bool {
        {
            let mut state = self.state();
            match state.session.as_mut() {
                Some(session) if session.id == session_id => session.buffer.push_str(&text),
                _ => {
                    return false;
                }
            }
        }
        self.emit(ControllerEvent::Chunk {
            conversation_id: conversation_id.to_string(),
            text,
        });
        true
    }

    // Returns None when the session was already ended by stop or delete.
    fn commit(&self, session_id: u64, failure: Option<&LlmError>) -> Option<ChatMessage> {
        let mut state = self.state();
        if !state.is_current(session_id) {
            return None;
        }
        let session = state.session.take()?;

        let content = match failure {
            None => session.buffer,
            Some(e) => failure_content(&session.buffer, e),
        };
        let message = ChatMessage::assistant(content);
        if let Some(conversation) = state.find_mut(&session.conversation_id) {
            conversation.messages.push(message.clone());
        }
        drop(state);

        self.emit(ControllerEvent::Finished {
            conversation_id: session.conversation_id,
            message: Some(message.clone()),
        });
        Some(message)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state().conversations.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state()
            .conversations.iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn active_id(&self) -> Option<String> {
        self.state().active_id.clone()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        let state = self.state();
        let id = state.active_id.as_deref()?;
        state.conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn generating(&self) -> bool {
        self.state().session.is_some()
    }

    /// Partial output of the open session, if any.
    pub fn streaming_content(&self) -> Option<String> {
        self.state()
            .session.as_ref()
            .map(|s| s.buffer.clone())
    }
}

fn failure_content(partial: &str, error: &LlmError) -> String {
    if partial.is_empty() {
        format!("[error] {}", error)
    } else {
        format!("{}\n\n[error] {}", partial, error)
    }
}

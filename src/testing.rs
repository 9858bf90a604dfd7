//! Test doubles for the streaming pipeline
//!
//! Scripted transports, a recording sink and an in-memory store so the
//! consumer, retry controller and orchestrator run without real I/O.

use crate::consumer::MessageSink;
use crate::conversation::{OutgoingMessage, Role};
use crate::db::{ChatRecord, MessageRecord};
use crate::store::{MessageStore, StoreError};
use crate::transport::{ByteStream, ChatRequest, ChatTransport, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn chat_request(text: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![OutgoingMessage {
            role: Role::User,
            content: text.to_string(),
        }],
        system: String::new(),
    }
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// What one `open` call produces
#[derive(Debug, Clone)]
pub enum Script {
    /// Non-success response status
    Status(u16),
    /// Body chunks, then a clean end of stream
    Chunks(Vec<String>),
    /// Body chunks, then a connection reset
    ChunksThenError(Vec<String>),
    /// Body chunks, then a stream that never yields again
    ChunksThenPending(Vec<String>),
    /// Cancels `token` while producing chunk number `after` (1-based), which
    /// is still yielded; the stream then stays open
    CancelAfter {
        chunks: Vec<String>,
        after: usize,
        token: CancellationToken,
    },
}

impl Script {
    pub fn chunks(chunks: &[&str]) -> Self {
        Script::Chunks(chunks.iter().map(ToString::to_string).collect())
    }

    fn into_stream(self) -> Result<ByteStream, StreamError> {
        fn ok(chunks: Vec<String>) -> impl futures::Stream<Item = Result<Bytes, StreamError>> {
            stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
        }

        match self {
            Script::Status(status) => Err(StreamError::from_status(status, "")),
            Script::Chunks(chunks) => Ok(ok(chunks).boxed()),
            Script::ChunksThenError(chunks) => Ok(ok(chunks)
                .chain(stream::once(async {
                    Err(StreamError::network("connection reset by peer"))
                }))
                .boxed()),
            Script::ChunksThenPending(chunks) => Ok(ok(chunks).chain(stream::pending()).boxed()),
            Script::CancelAfter {
                chunks,
                after,
                token,
            } => Ok(stream::iter(chunks.into_iter().enumerate())
                .map(move |(i, chunk)| {
                    if i + 1 == after {
                        token.cancel();
                    }
                    Ok(Bytes::from(chunk))
                })
                .chain(stream::pending())
                .boxed()),
        }
    }
}

/// Transport that plays queued scripts, one per `open`
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    /// Record of every opened request
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(script) => script.into_stream(),
            None => Err(StreamError::protocol("No scripted response queued")),
        }
    }
}

// ============================================================================
// Recording Sink
// ============================================================================

/// Sink that records every snapshot and retry notice
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(String, String)>>,
    retries: Mutex<Vec<(u32, u32)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents_for(&self, message_id: &str) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub fn last_for(&self, message_id: &str) -> Option<String> {
        self.contents_for(message_id).pop()
    }

    pub fn retry_notices(&self) -> Vec<(u32, u32)> {
        self.retries.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.lock().unwrap().is_empty()
    }
}

impl MessageSink for RecordingSink {
    fn apply(&self, message_id: &str, content: &str) {
        self.applied
            .lock()
            .unwrap()
            .push((message_id.to_string(), content.to_string()));
    }

    fn retrying(&self, _message_id: &str, attempt: u32, max_attempts: u32) {
        self.retries.lock().unwrap().push((attempt, max_attempts));
    }
}

// ============================================================================
// In-memory Store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    chats: Vec<ChatRecord>,
    messages: Vec<MessageRecord>,
}

/// `MessageStore` backed by vectors, with switchable failures
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// Make `create_message` fail with `Transient`
    pub fail_messages: AtomicBool,
    /// Make `create_chat` fail with `Transient`
    pub fail_chats: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_chats(&self, fail: bool) {
        self.fail_chats.store(fail, Ordering::SeqCst);
    }

    /// Every stored message across all chats
    pub fn all_messages(&self) -> Vec<MessageRecord> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn all_chats(&self) -> Vec<ChatRecord> {
        self.state.lock().unwrap().chats.clone()
    }

    fn check_owner(state: &MemoryState, chat_id: &str, user_id: &str) -> Result<usize, StoreError> {
        let index = state
            .chats
            .iter()
            .position(|c| c.id == chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        if state.chats[index].user_id == user_id {
            Ok(index)
        } else {
            Err(StoreError::Forbidden(chat_id.to_string()))
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatRecord, StoreError> {
        if self.fail_chats.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("injected chat failure".to_string()));
        }
        let now = Utc::now();
        let chat = ChatRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            pinned: false,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().chats.push(chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatRecord, StoreError> {
        let state = self.state.lock().unwrap();
        let index = Self::check_owner(&state, chat_id, user_id)?;
        Ok(state.chats[index].clone())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut chats: Vec<_> = state
            .chats
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by_key(|c| !c.pinned);
        Ok(chats)
    }

    async fn update_chat_title(
        &self,
        chat_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let index = Self::check_owner(&state, chat_id, user_id)?;
        title.clone_into(&mut state.chats[index].title);
        Ok(())
    }

    async fn set_chat_pinned(
        &self,
        chat_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let index = Self::check_owner(&state, chat_id, user_id)?;
        state.chats[index].pinned = pinned;
        Ok(())
    }

    async fn delete_all_chats(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        let (mine, rest): (Vec<_>, Vec<_>) =
            state.chats.drain(..).partition(|c| c.user_id == user_id);
        state.chats = rest;
        state
            .messages
            .retain(|m| !mine.iter().any(|c| c.id == m.chat_id));
        Ok(mine.len())
    }

    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let index = Self::check_owner(&state, chat_id, user_id)?;
        state.chats.remove(index);
        state.messages.retain(|m| m.chat_id != chat_id);
        Ok(())
    }

    async fn create_message(
        &self,
        chat_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("injected message failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        Self::check_owner(&state, chat_id, user_id)?;

        if let Some(existing) = message_id
            .and_then(|id| state.messages.iter().find(|m| m.id == id && m.chat_id == chat_id))
        {
            return Ok(existing.clone());
        }

        let record = MessageRecord {
            id: message_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state.messages.push(record.clone());
        Ok(record)
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_owner(&state, chat_id, user_id)?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }
}

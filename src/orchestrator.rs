//! Send orchestrator
//!
//! Entry point for user actions on one conversation. A send appends the user
//! message and an assistant placeholder, runs the retry controller against
//! the placeholder and persists the result. Every change to the message list
//! is broadcast as a `ChatEvent`.

use crate::consumer::MessageSink;
use crate::conversation::{
    generate_chat_title, Conversation, ConversationMessage, Role, DEFAULT_CHAT_TITLES,
};
use crate::db::ChatRecord;
use crate::retry::{RetryController, RetryOutcome, RetryPolicy};
use crate::store::{DatabaseStore, MessageStore, StoreError};
use crate::transport::{ChatRequest, ChatTransport, StreamError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Conversation changes for the rendering layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageAppended {
        message: ConversationMessage,
    },
    MessageUpdated {
        id: String,
        content: String,
    },
    MessageRemoved {
        index: usize,
    },
    Truncated {
        len: usize,
    },
    Retrying {
        id: String,
        attempt: u32,
        max_attempts: u32,
    },
    Error {
        message: String,
    },
    ErrorDismissed,
    Done {
        id: String,
        status: SendStatus,
    },
    ChatSelected {
        chat_id: String,
        title: String,
    },
    /// The whole list was replaced
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Why a send did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    EmptyInput,
    /// Another send is still in flight
    Busy,
    NothingToRegenerate,
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Completed { message_id: String, content: String },
    Cancelled { message_id: String },
    Failed { message_id: String, error: StreamError },
    Rejected(Rejected),
}

/// The message list plus its change feed; handed to the retry controller
/// as the sink for snapshots.
#[derive(Clone)]
struct SharedConversation {
    conversation: Arc<Mutex<Conversation>>,
    events: broadcast::Sender<ChatEvent>,
}

impl SharedConversation {
    fn new(conversation: Conversation) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conversation: Arc::new(Mutex::new(conversation)),
            events,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        f(&mut lock(&self.conversation))
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn append(&self, message: ConversationMessage) {
        self.with(|c| c.append(message.clone()));
        self.emit(ChatEvent::MessageAppended { message });
    }

    fn replace(&self, conversation: Conversation) {
        self.with(|c| *c = conversation);
        self.emit(ChatEvent::Reset);
    }

    fn set_saved(&self, id: &str, saved: bool) {
        self.with(|c| c.set_saved(id, saved));
    }
}

impl MessageSink for SharedConversation {
    fn apply(&self, message_id: &str, content: &str) {
        if self.with(|c| c.apply_snapshot(message_id, content)) {
            self.emit(ChatEvent::MessageUpdated {
                id: message_id.to_string(),
                content: content.to_string(),
            });
        }
    }

    fn retrying(&self, message_id: &str, attempt: u32, max_attempts: u32) {
        self.emit(ChatEvent::Retrying {
            id: message_id.to_string(),
            attempt,
            max_attempts,
        });
    }
}

struct SendControl {
    token: CancellationToken,
    in_flight: bool,
    /// Bumped by every send so a superseded send cannot clear the flag of
    /// its successor
    generation: u64,
}

/// Drives sends for one conversation
pub struct SendOrchestrator<T, S = DatabaseStore> {
    transport: Arc<T>,
    store: Option<Arc<S>>,
    user_id: String,
    policy: RetryPolicy,
    system_prompt: Mutex<String>,
    shared: SharedConversation,
    control: Mutex<SendControl>,
    active_chat: Mutex<Option<String>>,
    error_banner: Mutex<Option<String>>,
    /// Assistant messages that ended cancelled or failed; never persisted
    skipped: Mutex<HashSet<String>>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, S> SendOrchestrator<T, S>
where
    T: ChatTransport + 'static,
    S: MessageStore + 'static,
{
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            store: None,
            user_id: String::new(),
            policy,
            system_prompt: Mutex::new(String::new()),
            shared: SharedConversation::new(Conversation::with_welcome()),
            control: Mutex::new(SendControl {
                token: CancellationToken::new(),
                in_flight: false,
                generation: 0,
            }),
            active_chat: Mutex::new(None),
            error_banner: Mutex::new(None),
            skipped: Mutex::new(HashSet::new()),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    /// Persist chats and messages for `user_id`
    pub fn with_store(mut self, store: Arc<S>, user_id: impl Into<String>) -> Self {
        self.store = Some(store);
        self.user_id = user_id.into();
        self
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        *lock(&self.system_prompt) = prompt.into();
        self
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        *lock(&self.system_prompt) = prompt.into();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the current message list
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.shared.with(|c| c.messages().to_vec())
    }

    pub fn active_chat_id(&self) -> Option<String> {
        lock(&self.active_chat).clone()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.control).in_flight
    }

    pub fn error_banner(&self) -> Option<String> {
        lock(&self.error_banner).clone()
    }

    pub fn dismiss_error(&self) {
        if lock(&self.error_banner).take().is_some() {
            self.shared.emit(ChatEvent::ErrorDismissed);
        }
    }

    // ==================== Send ====================

    pub async fn send(&self, input: &str) -> SendOutcome {
        let text = input.trim();
        if text.is_empty() {
            return SendOutcome::Rejected(Rejected::EmptyInput);
        }

        let Some((token, generation)) = self.begin() else {
            tracing::debug!("Send rejected: another response is streaming");
            return SendOutcome::Rejected(Rejected::Busy);
        };

        let chat_id = self.ensure_chat(text).await;

        let user = ConversationMessage::user(text);
        let user_id = user.id.clone();
        self.shared.append(user);
        if let Some(chat_id) = &chat_id {
            self.persist(chat_id, &user_id, Role::User, text);
        }

        self.stream_reply(chat_id, token, generation).await
    }

    /// Stream a fresh reply to the conversation as it stands. The last
    /// message is the user turn being answered.
    async fn stream_reply(
        &self,
        chat_id: Option<String>,
        token: CancellationToken,
        generation: u64,
    ) -> SendOutcome {
        let request = ChatRequest {
            messages: self.shared.with(|c| c.outgoing()),
            system: lock(&self.system_prompt).clone(),
        };
        let placeholder = ConversationMessage::assistant_placeholder();
        let target_id = placeholder.id.clone();
        self.shared.append(placeholder);

        tracing::info!(
            message_id = %target_id,
            history = request.messages.len(),
            "Sending chat request"
        );

        let report = RetryController::new(self.transport.as_ref(), &self.shared, self.policy)
            .run(&request, &target_id, &token)
            .await;
        if report.session.attempt_count > 1 {
            tracing::debug!(
                message_id = %target_id,
                attempts = report.session.attempt_count,
                "Send needed retries"
            );
        }

        let outcome = match report.outcome {
            RetryOutcome::Success(content) => {
                if let Some(chat_id) = &chat_id {
                    self.persist(chat_id, &target_id, Role::Assistant, &content);
                }
                self.finish(&target_id, SendStatus::Completed);
                SendOutcome::Completed {
                    message_id: target_id,
                    content,
                }
            }
            RetryOutcome::Cancelled => {
                lock(&self.skipped).insert(target_id.clone());
                self.finish(&target_id, SendStatus::Cancelled);
                SendOutcome::Cancelled {
                    message_id: target_id,
                }
            }
            RetryOutcome::Failed { error, message } => {
                lock(&self.skipped).insert(target_id.clone());
                *lock(&self.error_banner) = Some(message.clone());
                self.shared.emit(ChatEvent::Error { message });
                self.finish(&target_id, SendStatus::Failed);
                SendOutcome::Failed {
                    message_id: target_id,
                    error,
                }
            }
        };

        self.release(generation);
        outcome
    }

    /// Claim the in-flight slot with a fresh token
    fn begin(&self) -> Option<(CancellationToken, u64)> {
        let mut control = lock(&self.control);
        if control.in_flight {
            return None;
        }
        control.token.cancel();
        control.token = CancellationToken::new();
        control.generation += 1;
        control.in_flight = true;
        Some((control.token.clone(), control.generation))
    }

    /// Give up the in-flight slot unless a newer send already owns it
    fn release(&self, generation: u64) {
        let mut control = lock(&self.control);
        if control.generation == generation {
            control.in_flight = false;
        }
    }

    fn finish(&self, message_id: &str, status: SendStatus) {
        self.shared.emit(ChatEvent::Done {
            id: message_id.to_string(),
            status,
        });
    }

    /// Active chat id, creating the chat on the first send. Failures are
    /// logged and the exchange simply goes unpersisted.
    async fn ensure_chat(&self, first_message: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        let title = generate_chat_title(first_message);

        if let Some(chat_id) = self.active_chat_id() {
            self.rename_if_default(store, &chat_id, &title).await;
            return Some(chat_id);
        }

        match store.create_chat(&self.user_id, &title).await {
            Ok(chat) => {
                tracing::info!(chat_id = %chat.id, title = %chat.title, "Created chat");
                self.select_chat(&chat);
                Some(chat.id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create chat; continuing without persistence");
                None
            }
        }
    }

    async fn rename_if_default(&self, store: &Arc<S>, chat_id: &str, title: &str) {
        let chat = match store.get_chat(chat_id, &self.user_id).await {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to look up chat");
                return;
            }
        };
        if !DEFAULT_CHAT_TITLES.contains(&chat.title.as_str()) || title == chat.title {
            return;
        }

        let store = Arc::clone(store);
        let chat_id = chat_id.to_string();
        let user_id = self.user_id.clone();
        let title = title.to_string();
        let handle = tokio::spawn(async move {
            match store.update_chat_title(&chat_id, &user_id, &title).await {
                Ok(()) => tracing::debug!(chat_id = %chat_id, title = %title, "Renamed chat"),
                Err(e) => tracing::warn!(chat_id = %chat_id, error = %e, "Failed to rename chat"),
            }
        });
        self.track(handle);
    }

    fn select_chat(&self, chat: &ChatRecord) {
        *lock(&self.active_chat) = Some(chat.id.clone());
        self.shared.emit(ChatEvent::ChatSelected {
            chat_id: chat.id.clone(),
            title: chat.title.clone(),
        });
    }

    /// Save a message in the background. It is marked saved up front and
    /// un-marked if the write fails.
    fn persist(&self, chat_id: &str, message_id: &str, role: Role, content: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        self.shared.set_saved(message_id, true);

        let shared = self.shared.clone();
        let chat_id = chat_id.to_string();
        let user_id = self.user_id.clone();
        let message_id = message_id.to_string();
        let content = content.to_string();
        let handle = tokio::spawn(async move {
            match store
                .create_message(&chat_id, &user_id, role, &content, Some(&message_id))
                .await
            {
                Ok(_) => tracing::debug!(message_id = %message_id, "Message saved"),
                Err(e) => {
                    tracing::warn!(message_id = %message_id, error = %e, "Failed to save message");
                    shared.set_saved(&message_id, false);
                }
            }
        });
        self.track(handle);
    }

    /// Keep a write handle for `flush_writes`, dropping finished ones
    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = lock(&self.pending_writes);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for background writes started so far
    pub async fn flush_writes(&self) {
        let handles: Vec<_> = lock(&self.pending_writes).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background write panicked");
            }
        }
    }

    // ==================== Other actions ====================

    /// Cancel the active send. Idempotent.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        if control.in_flight {
            tracing::info!(generation = control.generation, "Stopping active send");
        }
        control.token.cancel();
        control.in_flight = false;
    }

    /// Drop everything after the last user message and answer it again.
    /// The user message keeps its id, so it is stored only once.
    pub async fn regenerate(&self) -> SendOutcome {
        let Some((token, generation)) = self.begin() else {
            return SendOutcome::Rejected(Rejected::Busy);
        };
        let Some(user) = self.shared.with(|c| {
            let index = c.last_user_index()?;
            c.truncate(index + 1);
            Some(c.messages()[index].clone())
        }) else {
            self.release(generation);
            return SendOutcome::Rejected(Rejected::NothingToRegenerate);
        };
        let len = self.shared.with(|c| c.messages().len());
        self.shared.emit(ChatEvent::Truncated { len });

        let chat_id = self.store.as_ref().and_then(|_| self.active_chat_id());
        if let Some(chat_id) = &chat_id {
            if !user.saved {
                self.persist(chat_id, &user.id, Role::User, &user.content);
            }
        }

        self.stream_reply(chat_id, token, generation).await
    }

    /// Remove a message from the local list only
    pub fn delete_message(&self, index: usize) -> Option<ConversationMessage> {
        let removed = self.shared.with(|c| c.remove_at(index));
        if removed.is_some() {
            self.shared.emit(ChatEvent::MessageRemoved { index });
        }
        removed
    }

    /// Start over with only the welcome message and no active chat
    pub fn reset(&self) {
        self.stop();
        *lock(&self.active_chat) = None;
        lock(&self.skipped).clear();
        self.shared.replace(Conversation::with_welcome());
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>, StoreError> {
        match &self.store {
            Some(store) => store.list_chats(&self.user_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Replace the list with a stored chat. A chat that is gone or not ours
    /// resets to the welcome state.
    pub async fn load_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Err(StoreError::NotFound(chat_id.to_string()));
        };
        self.stop();

        let loaded = async {
            let chat = store.get_chat(chat_id, &self.user_id).await?;
            let records = store.list_messages(chat_id, &self.user_id).await?;
            Ok::<_, StoreError>((chat, records))
        }
        .await;

        match loaded {
            Ok((chat, records)) => {
                let conversation = if records.is_empty() {
                    Conversation::with_welcome()
                } else {
                    Conversation::from_messages(
                        records
                            .into_iter()
                            .map(|r| ConversationMessage {
                                id: r.id,
                                role: r.role,
                                content: r.content,
                                saved: true,
                            })
                            .collect(),
                    )
                };
                lock(&self.skipped).clear();
                self.shared.replace(conversation);
                self.select_chat(&chat);
                tracing::info!(chat_id = %chat_id, "Loaded chat");
                Ok(())
            }
            Err(e @ (StoreError::NotFound(_) | StoreError::Forbidden(_))) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Chat unavailable; starting fresh");
                self.reset();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a stored chat; the active one also resets the view
    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Err(StoreError::NotFound(chat_id.to_string()));
        };
        store.delete_chat(chat_id, &self.user_id).await?;
        if self.active_chat_id().as_deref() == Some(chat_id) {
            self.reset();
        }
        Ok(())
    }

    /// Remove every stored chat of the user and start over
    pub async fn delete_all_chats(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let deleted = store.delete_all_chats(&self.user_id).await?;
        tracing::info!(deleted, "Deleted all chats");
        if self.active_chat_id().is_some() {
            self.reset();
        }
        Ok(deleted)
    }

    pub async fn pin_chat(&self, chat_id: &str, pinned: bool) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Err(StoreError::NotFound(chat_id.to_string()));
        };
        store.set_chat_pinned(chat_id, &self.user_id, pinned).await
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Err(StoreError::NotFound(chat_id.to_string()));
        };
        let title = title.trim();
        store.update_chat_title(chat_id, &self.user_id, title).await?;
        if self.active_chat_id().as_deref() == Some(chat_id) {
            self.shared.emit(ChatEvent::ChatSelected {
                chat_id: chat_id.to_string(),
                title: title.to_string(),
            });
        }
        Ok(())
    }

    /// Chats whose title contains `query`, ignoring case
    pub async fn search_chats(&self, query: &str) -> Result<Vec<ChatRecord>, StoreError> {
        let query = query.trim().to_lowercase();
        let chats = self.list_chats().await?;
        Ok(chats
            .into_iter()
            .filter(|c| c.title.to_lowercase().contains(&query))
            .collect())
    }

    /// Persist completed assistant messages whose save failed earlier.
    /// Returns how many were written. Does nothing while a send is in flight.
    pub async fn reconcile(&self) -> usize {
        let (Some(store), Some(chat_id)) = (&self.store, self.active_chat_id()) else {
            return 0;
        };
        if self.is_in_flight() {
            return 0;
        }

        let candidates: Vec<(String, String)> = {
            let mut skipped = lock(&self.skipped);
            self.shared.with(|c| {
                skipped.retain(|id| c.messages().iter().any(|m| m.id == *id));
                c.messages()
                    .iter()
                    .filter(|m| {
                        m.role == Role::Assistant
                            && !m.saved
                            && !m.is_welcome()
                            && !m.content.is_empty()
                            && !skipped.contains(&m.id)
                    })
                    .map(|m| (m.id.clone(), m.content.clone()))
                    .collect()
            })
        };

        let mut saved = 0;
        for (id, content) in candidates {
            match store
                .create_message(&chat_id, &self.user_id, Role::Assistant, &content, Some(&id))
                .await
            {
                Ok(_) => {
                    self.shared.set_saved(&id, true);
                    saved += 1;
                }
                Err(e) => tracing::warn!(message_id = %id, error = %e, "Reconcile save failed"),
            }
        }
        if saved > 0 {
            tracing::info!(chat_id = %chat_id, saved, "Reconciled unsaved messages");
        }
        saved
    }
}

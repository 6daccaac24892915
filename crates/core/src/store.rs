//! The authoritative in-memory conversation, persisted per user with a
//! debounced save.

use crate::{
    error::StorageError,
    events::ChatEvent,
    localization::Language,
    message::{Message, MessageId, MessageStatus, Sender},
    persistence::{HistoryRepository, UserKey},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_SAVE_QUIET_PERIOD: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 256;

struct StoreState {
    user: UserKey,
    language: Language,
    messages: Vec<Message>,
    /// Incremented every time a save is (re)armed.
    save_seq: u64,
    pending_save: Option<JoinHandle<()>>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    repository: Arc<dyn HistoryRepository>,
    events: broadcast::Sender<ChatEvent>,
    quiet_period: Duration,
}

/// Cheaply cloneable handle to the conversation of the current user.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    /// Creates an empty store for the guest. Call [`load_for_user`] before use.
    ///
    /// [`load_for_user`]: Self::load_for_user
    pub fn new(repository: Arc<dyn HistoryRepository>, language: Language) -> Self {
        Self::with_quiet_period(repository, language, DEFAULT_SAVE_QUIET_PERIOD)
    }

    pub fn with_quiet_period(
        repository: Arc<dyn HistoryRepository>,
        language: Language,
        quiet_period: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    user: UserKey::Guest,
                    language,
                    messages: Vec::new(),
                    save_seq: 0,
                    pending_save: None,
                }),
                repository,
                events,
                quiet_period,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        // No subscriber is not an error.
        let _ = self.inner.events.send(event);
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.state.lock().await.messages.clone()
    }

    pub async fn get(&self, id: MessageId) -> Option<Message> {
        let state = self.inner.state.lock().await;
        state.messages.iter().find(|m| m.id == id).cloned()
    }

    /// Every message that precedes `id`, or `None` if `id` is unknown.
    pub async fn context_before(&self, id: MessageId) -> Option<Vec<Message>> {
        let state = self.inner.state.lock().await;
        let index = state.messages.iter().position(|m| m.id == id)?;
        Some(state.messages[..index].to_vec())
    }

    pub async fn current_user(&self) -> UserKey {
        self.inner.state.lock().await.user.clone()
    }

    pub async fn language(&self) -> Language {
        self.inner.state.lock().await.language
    }

    /// Changes the language used for strings the store writes itself.
    pub async fn set_language(&self, language: Language) {
        self.inner.state.lock().await.language = language;
    }

    pub async fn append(&self, message: Message) {
        let mut state = self.inner.state.lock().await;
        state.messages.push(message.clone());
        self.schedule_save(&mut state);
        drop(state);
        self.emit(ChatEvent::MessageAppended(message));
    }

    /// Applies `change` to the message with `id`.
    ///
    /// Returns the message after the change, or `None` if it is no longer in
    /// the conversation. An unchanged message is neither saved nor broadcast.
    pub async fn modify(&self, id: MessageId, change: impl FnOnce(&mut Message)) -> Option<Message> {
        let mut state = self.inner.state.lock().await;
        let message = state.messages.iter_mut().find(|m| m.id == id)?;
        let before = message.clone();
        change(message);
        let after = message.clone();
        if after.same_revision(&before) {
            return Some(after);
        }
        self.schedule_save(&mut state);
        drop(state);
        self.emit(ChatEvent::MessageUpdated(after.clone()));
        Some(after)
    }

    pub async fn update_content(&self, id: MessageId, content: impl Into<String>) -> bool {
        let content = content.into();
        self.modify(id, |m| m.content = content).await.is_some()
    }

    pub async fn set_status(&self, id: MessageId, status: MessageStatus) -> bool {
        self.modify(id, |m| m.status = status).await.is_some()
    }

    /// Ends streaming for `id`.
    pub async fn finalize(&self, id: MessageId) -> bool {
        self.modify(id, |m| m.is_streaming = false).await.is_some()
    }

    /// Makes `key` the current user and restores their history.
    ///
    /// A pending save of the outgoing user is written first. Returns what was
    /// persisted; when nothing was (or it could not be read) the conversation
    /// starts over from the greeting.
    pub async fn load_for_user(&self, key: UserKey) -> Option<Vec<Message>> {
        let mut state = self.inner.state.lock().await;
        self.save_pending(&mut state).await;

        let loaded = match self.inner.repository.load(&key).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(user = %key, error = %e, "Failed to load chat history, starting fresh");
                None
            }
        };

        let language = state.language;
        state.messages = match &loaded {
            Some(messages) if !messages.is_empty() => recover_interrupted(messages.clone(), language),
            _ => vec![Message::ai_text(language.greeting())],
        };
        info!(user = %key, count = state.messages.len(), "Conversation loaded");
        state.user = key;
        let messages = state.messages.clone();
        drop(state);

        self.emit(ChatEvent::HistoryReplaced(messages));
        loaded
    }

    /// Switches to another user and returns their conversation.
    pub async fn switch_user(&self, key: UserKey) -> Vec<Message> {
        self.load_for_user(key).await;
        self.snapshot().await
    }

    /// Deletes the persisted history of `key`.
    ///
    /// If `key` is the current user the conversation is reset to the greeting.
    pub async fn clear(&self, key: &UserKey) -> Result<(), StorageError> {
        let mut state = self.inner.state.lock().await;
        // The pending save needs this lock, so it cannot run before the
        // delete finishes. On failure it stays armed.
        self.inner.repository.clear(key).await?;
        info!(user = %key, "Chat history cleared");

        if state.user == *key {
            if let Some(pending) = state.pending_save.take() {
                pending.abort();
            }
            state.save_seq += 1;
            state.messages = vec![Message::ai_text(state.language.greeting())];
            let messages = state.messages.clone();
            drop(state);
            self.emit(ChatEvent::HistoryReplaced(messages));
        }
        Ok(())
    }

    /// Writes a pending save now instead of waiting for the quiet period.
    pub async fn flush(&self) {
        let mut state = self.inner.state.lock().await;
        self.save_pending(&mut state).await;
    }

    /// Re-arms the single pending save.
    fn schedule_save(&self, state: &mut StoreState) {
        if let Some(pending) = state.pending_save.take() {
            pending.abort();
        }
        state.save_seq += 1;
        let seq = state.save_seq;
        let store = self.clone();
        state.pending_save = Some(tokio::spawn(async move {
            tokio::time::sleep(store.inner.quiet_period).await;
            let mut state = store.inner.state.lock().await;
            if state.save_seq != seq {
                return;
            }
            state.pending_save = None;
            store.write(&state).await;
        }));
    }

    async fn save_pending(&self, state: &mut StoreState) {
        if let Some(pending) = state.pending_save.take() {
            pending.abort();
            state.save_seq += 1;
            self.write(state).await;
        }
    }

    async fn write(&self, state: &StoreState) {
        match self.inner.repository.save(&state.user, &state.messages).await {
            Ok(()) => debug!(user = %state.user, count = state.messages.len(), "Chat history saved"),
            Err(e) => error!(user = %state.user, error = %e, "Failed to save chat history"),
        }
    }
}

/// Repairs messages that were in flight when the previous process stopped.
///
/// Nothing restored may stay streaming or sending; interrupted AI replies and
/// transcriptions become failed so they can be retried.
fn recover_interrupted(mut messages: Vec<Message>, language: Language) -> Vec<Message> {
    for message in &mut messages {
        let interrupted = message.is_streaming || message.status == MessageStatus::Sending;
        if !interrupted {
            continue;
        }
        message.is_streaming = false;
        message.status = MessageStatus::Failed;
        match message.sender {
            Sender::Ai if message.content.trim().is_empty() => {
                message.content = language.chat_unavailable().to_string();
            }
            Sender::User if message.is_user_audio() => {
                message.content = language.transcription_failed().to_string();
            }
            _ => {}
        }
    }
    messages
}

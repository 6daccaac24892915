//! Fakes shared by the unit tests of several modules.

use crate::{
    error::{ChatError, StorageError},
    llm_client::{ChatClient, ChatMessage, CompletionStream},
    message::Message,
    persistence::{HistoryRepository, UserKey},
    playback::{AudioSink, RenderMode},
};
use async_trait::async_trait;
use futures::stream;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

/// History repository backed by a map, recording every save.
#[derive(Default)]
pub struct MemoryHistoryRepository {
    stored: Mutex<HashMap<UserKey, Vec<Message>>>,
    saves: Mutex<Vec<(UserKey, Vec<Message>)>>,
    fail_saves: bool,
    fail_loads: bool,
    fail_clears: bool,
}

impl MemoryHistoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_history(key: UserKey, messages: Vec<Message>) -> Arc<Self> {
        let repo = Self::default();
        repo.stored.lock().unwrap().insert(key, messages);
        Arc::new(repo)
    }

    pub fn failing_loads() -> Arc<Self> {
        Arc::new(Self {
            fail_loads: true,
            ..Self::default()
        })
    }

    pub fn failing_saves() -> Arc<Self> {
        Arc::new(Self {
            fail_saves: true,
            ..Self::default()
        })
    }

    /// Stores `messages` for `key` but refuses to delete anything.
    pub fn failing_clears(key: UserKey, messages: Vec<Message>) -> Arc<Self> {
        let repo = Self {
            fail_clears: true,
            ..Self::default()
        };
        repo.stored.lock().unwrap().insert(key, messages);
        Arc::new(repo)
    }

    pub fn stored(&self, key: &UserKey) -> Option<Vec<Message>> {
        self.stored.lock().unwrap().get(key).cloned()
    }

    pub fn saves(&self) -> Vec<(UserKey, Vec<Message>)> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryRepository for MemoryHistoryRepository {
    async fn load(&self, key: &UserKey) -> Result<Option<Vec<Message>>, StorageError> {
        if self.fail_loads {
            return Err(StorageError::Io(std::io::Error::other("disk unavailable")));
        }
        Ok(self.stored(key))
    }

    async fn save(&self, key: &UserKey, messages: &[Message]) -> Result<(), StorageError> {
        if self.fail_saves {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.saves.lock().unwrap().push((key.clone(), messages.to_vec()));
        self.stored.lock().unwrap().insert(key.clone(), messages.to_vec());
        Ok(())
    }

    async fn clear(&self, key: &UserKey) -> Result<(), StorageError> {
        if self.fail_clears {
            return Err(StorageError::Io(std::io::Error::other("permission denied")));
        }
        self.stored.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A completion stream fed by the test through a channel.
pub fn channel_stream() -> (mpsc::UnboundedSender<Result<String, ChatError>>, CompletionStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (tx, Box::pin(stream))
}

/// Chat client that answers every request with the next scripted reply.
///
/// Each reply is either a finished list of fragments or a channel the test
/// drives by hand.
pub enum ScriptedReply {
    Fragments(Vec<Result<String, ChatError>>),
    Fails(ChatError),
    Channel(CompletionStream),
}

#[derive(Default)]
pub struct ScriptedChatClient {
    replies: Mutex<Vec<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedChatClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// The history each `stream_completion` call received.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<CompletionStream, ChatError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(ChatError::RequestFailed {
                status: None,
                message: "no scripted reply".into(),
            });
        }
        match replies.remove(0) {
            ScriptedReply::Fragments(items) => Ok(Box::pin(stream::iter(items))),
            ScriptedReply::Fails(err) => Err(err),
            ScriptedReply::Channel(stream) => Ok(stream),
        }
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream_completion(
        &self,
        history: Vec<Message>,
        _system_prompt: Option<String>,
    ) -> Result<CompletionStream, ChatError> {
        self.requests.lock().unwrap().push(history);
        self.next_reply()
    }

    async fn stream_messages(&self, _messages: Vec<ChatMessage>) -> Result<CompletionStream, ChatError> {
        self.next_reply()
    }
}

pub fn fragments(parts: &[&str]) -> ScriptedReply {
    ScriptedReply::Fragments(parts.iter().map(|p| Ok(p.to_string())).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Play(PathBuf, String),
    Stop,
    Render(RenderMode),
}

/// Audio sink that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn plays(&self) -> Vec<(PathBuf, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Play(path, key) => Some((path, key)),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.calls().iter().filter(|c| **c == SinkCall::Stop).count()
    }

    pub fn render_modes(&self) -> Vec<RenderMode> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Render(mode) => Some(mode),
                _ => None,
            })
            .collect()
    }
}

impl AudioSink for RecordingSink {
    fn play_audio(&self, path: &Path, key: &str) -> Result<(), ChatError> {
        self.calls.lock().unwrap().push(SinkCall::Play(path.to_path_buf(), key.to_string()));
        Ok(())
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push(SinkCall::Stop);
    }

    fn set_render_mode(&self, mode: RenderMode) {
        self.calls.lock().unwrap().push(SinkCall::Render(mode));
    }
}

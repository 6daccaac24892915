use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use uuid::Uuid;

/// Stable identifier of a message; the join key between store mutations,
/// streamed deltas and playback targeting.
pub type MessageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

/// A single turn in the conversation.
///
/// `sender`, `kind` and `timestamp` are fixed at construction. Everything
/// else is mutated in place by the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<PathBuf>,
    #[serde(default)]
    pub is_streaming: bool,
    pub status: MessageStatus,
}

impl Message {
    fn new(content: String, sender: Sender, kind: MessageKind, status: MessageStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            sender,
            timestamp: Utc::now(),
            kind,
            audio_duration: None,
            audio_ref: None,
            is_streaming: false,
            status,
        }
    }

    /// A typed user message. It is `sent` as soon as it exists locally.
    pub fn user_text(content: impl Into<String>) -> Self {
        Self::new(content.into(), Sender::User, MessageKind::Text, MessageStatus::Sent)
    }

    /// A recorded user message awaiting transcription.
    pub fn user_audio(placeholder: impl Into<String>, audio_ref: PathBuf, duration: f64) -> Self {
        let mut message = Self::new(
            placeholder.into(),
            Sender::User,
            MessageKind::Audio,
            MessageStatus::Sending,
        );
        message.audio_ref = Some(audio_ref);
        message.audio_duration = Some(duration);
        message
    }

    /// The empty AI message a turn streams into.
    pub fn ai_placeholder() -> Self {
        let mut message = Self::new(String::new(), Sender::Ai, MessageKind::Text, MessageStatus::Sending);
        message.is_streaming = true;
        message
    }

    /// A complete AI message, e.g. the seeded greeting.
    pub fn ai_text(content: impl Into<String>) -> Self {
        Self::new(content.into(), Sender::Ai, MessageKind::Text, MessageStatus::Sent)
    }

    pub fn is_user_audio(&self) -> bool {
        self.sender == Sender::User && self.kind == MessageKind::Audio
    }

    /// Whether this message should be part of the context sent to the LLM.
    pub fn is_context_eligible(&self) -> bool {
        self.status != MessageStatus::Failed && !self.is_streaming && !self.content.trim().is_empty()
    }

    /// Change detection: true if both values describe the same revision of
    /// the same message.
    pub fn same_revision(&self, other: &Message) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.status == other.status
            && self.is_streaming == other.is_streaming
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

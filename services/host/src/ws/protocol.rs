//! Defines the WebSocket message protocol between the chat client and the host.

use mojitalk_core::{
    Message, MessageId,
    events::{ChatEvent, PlaybackSession, TurnPhase},
    playback::RenderMode,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Messages sent from the client to the host.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the conversation. This must be the first message.
    Init {
        /// Signed-in account, or none for the guest conversation.
        #[serde(default)]
        user_id: Option<String>,
        /// App language code such as `zh-Hans` or `en`.
        #[serde(default)]
        language: Option<String>,
    },
    SendText { text: String },
    /// A finished recording, already written to a path the host can read.
    SendAudio { path: PathBuf, duration_secs: f64 },
    Resend { message_id: MessageId },
    Play { message_id: MessageId },
    StopAll,
    SetAutoPlay { enabled: bool },
    SetLanguage { language: String },
    /// The avatar finished playing the clip it was handed under `key`.
    PlaybackFinished { key: String },
    SwitchUser { user_id: Option<String> },
    Logout,
    DeleteLocalData,
    ExplainGrammar { message_id: MessageId },
    Translate { message_id: MessageId, language: String },
}

/// Messages sent from the host to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms initialization and carries the loaded history.
    Initialized { history: Vec<Message> },
    MessageAppended { message: Message },
    MessageUpdated { message: Message },
    HistoryReplaced { history: Vec<Message> },
    TurnPhase { message_id: MessageId, phase: TurnPhase },
    PlaybackState { session: PlaybackSession },
    /// Instructs the avatar to lip-sync the clip at `path`.
    AvatarPlay { path: PathBuf, key: String },
    AvatarStop,
    AvatarRenderMode { mode: RenderMode },
    StudyAid { message_id: MessageId, text: String },
    /// Reports an error to the client. The connection stays open.
    Error { message: String },
}

impl From<ChatEvent> for ServerMessage {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::MessageAppended(message) => Self::MessageAppended { message },
            ChatEvent::MessageUpdated(message) => Self::MessageUpdated { message },
            ChatEvent::HistoryReplaced(history) => Self::HistoryReplaced { history },
            ChatEvent::TurnPhaseChanged { message_id, phase } => Self::TurnPhase { message_id, phase },
        }
    }
}

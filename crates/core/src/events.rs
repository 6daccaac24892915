use crate::message::{Message, MessageId};
use serde::Serialize;

/// Progress of the AI turn currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Placeholder appended, no fragment received yet.
    AwaitingFirstToken,
    Streaming,
    Finalized,
    Failed,
}

/// Changes to the conversation that the UI layer renders.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageAppended(Message),
    MessageUpdated(Message),
    /// The whole list changed, after a user switch or a local data wipe.
    HistoryReplaced(Vec<Message>),
    TurnPhaseChanged { message_id: MessageId, phase: TurnPhase },
}

/// The single audio playback session. At most one message is targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PlaybackSession {
    pub target_message_id: Option<MessageId>,
    pub is_loading: bool,
    pub is_playing: bool,
}

impl PlaybackSession {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn loading(target: MessageId) -> Self {
        Self {
            target_message_id: Some(target),
            is_loading: true,
            is_playing: false,
        }
    }

    pub fn playing(target: MessageId) -> Self {
        Self {
            target_message_id: Some(target),
            is_loading: false,
            is_playing: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.target_message_id.is_none() && !self.is_loading && !self.is_playing
    }

    pub fn targets(&self, message_id: MessageId) -> bool {
        self.target_message_id == Some(message_id)
    }
}

//! Conversation core of the MojiTalk Japanese tutor.
//!
//! The [`session::ChatSession`] ties together the conversation store, the
//! streaming chat client, speech services and the playback slot. Nothing in
//! this crate knows how the UI is reached.

pub mod audio_utils;
pub mod error;
pub mod events;
pub mod llm_client;
pub mod localization;
pub mod message;
pub mod persistence;
pub mod playback;
pub mod session;
pub mod speech;
pub mod sse;
pub mod store;
pub mod study_aids;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ChatError, SessionError, StorageError};
pub use message::{Message, MessageId, MessageKind, MessageStatus, Sender};

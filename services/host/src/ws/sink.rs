//! Forwards avatar commands to the client over the connection's outbound queue.

use super::protocol::ServerMessage;
use mojitalk_core::{
    error::ChatError,
    playback::{AudioSink, RenderMode},
};
use std::path::Path;
use tokio::sync::mpsc;

pub struct ClientAudioSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientAudioSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { tx }
    }
}

impl AudioSink for ClientAudioSink {
    fn play_audio(&self, path: &Path, key: &str) -> Result<(), ChatError> {
        self.tx
            .send(ServerMessage::AvatarPlay {
                path: path.to_path_buf(),
                key: key.to_string(),
            })
            .map_err(|_| ChatError::PlaybackFailed("client disconnected".to_string()))
    }

    fn stop(&self) {
        let _ = self.tx.send(ServerMessage::AvatarStop);
    }

    fn set_render_mode(&self, mode: RenderMode) {
        let _ = self.tx.send(ServerMessage::AvatarRenderMode { mode });
    }
}

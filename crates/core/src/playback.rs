//! Single-slot audio playback for chat messages.
//!
//! At most one message is loading or playing. Starting another target, or
//! stopping, bumps the slot's generation; any async work that resumes with a
//! stale generation discards its result instead of touching the session.

use crate::{
    audio_utils::{AudioFormat, clip_duration, decode_duration},
    error::ChatError,
    events::PlaybackSession,
    message::{Message, MessageId, Sender},
    speech::SpeechSynthesizer,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How busily the avatar should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Active,
    Idle,
}

/// The component that actually outputs audio, e.g. a Live2D avatar that
/// lip-syncs to the file it is given.
pub trait AudioSink: Send + Sync {
    /// Starts playing the file at `path`. `key` identifies the session in a
    /// later completion callback.
    fn play_audio(&self, path: &Path, key: &str) -> Result<(), ChatError>;
    fn stop(&self);
    fn set_render_mode(&self, mode: RenderMode);
}

/// Directory holding synthesized speech as `tts_<message id>.<ext>`.
#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
}

impl AudioCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: MessageId, format: AudioFormat) -> PathBuf {
        self.dir.join(format!("tts_{id}.{}", format.extension()))
    }

    pub async fn store(&self, id: MessageId, bytes: &[u8], format: AudioFormat) -> Result<PathBuf, ChatError> {
        let path = self.path_for(id, format);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ChatError::PlaybackFailed(format!("cannot create audio cache: {e}")))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ChatError::PlaybackFailed(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// A new session is loading the message.
    Started,
    /// The message was already loading or playing and has been stopped.
    Stopped,
}

struct Slot {
    generation: u64,
    session: PlaybackSession,
    work: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

struct PlaybackInner {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    cache: AudioCache,
    slot: Mutex<Slot>,
    session_tx: watch::Sender<PlaybackSession>,
}

#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<PlaybackInner>,
}

impl PlaybackCoordinator {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, sink: Arc<dyn AudioSink>, cache: AudioCache) -> Self {
        let (session_tx, _) = watch::channel(PlaybackSession::idle());
        Self {
            inner: Arc::new(PlaybackInner {
                synthesizer,
                sink,
                cache,
                slot: Mutex::new(Slot {
                    generation: 0,
                    session: PlaybackSession::idle(),
                    work: None,
                    timer: None,
                }),
                session_tx,
            }),
        }
    }

    pub fn session(&self) -> PlaybackSession {
        *self.inner.session_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSession> {
        self.inner.session_tx.subscribe()
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.inner.sink
    }

    /// Plays `message`, or stops it if it is already the active target.
    pub async fn play(&self, message: &Message) -> PlayOutcome {
        let mut slot = self.inner.slot.lock().await;
        let active = slot.session.is_loading || slot.session.is_playing;
        if active && slot.session.targets(message.id) {
            info!(message_id = %message.id, "Playback toggled off");
            self.stop_locked(&mut slot);
            return PlayOutcome::Stopped;
        }

        self.stop_locked(&mut slot);
        let generation = slot.generation;
        self.publish(&mut slot, PlaybackSession::loading(message.id));
        debug!(message_id = %message.id, generation, "Playback loading");

        let coordinator = self.clone();
        let message = message.clone();
        slot.work = Some(tokio::spawn(async move {
            match coordinator.prepare(&message, generation).await {
                Ok(Some((path, duration))) => coordinator.start_playing(message.id, generation, path, duration).await,
                Ok(None) => debug!(message_id = %message.id, generation, "Superseded audio discarded"),
                Err(e) => coordinator.fail(message.id, generation, e).await,
            }
        }));
        PlayOutcome::Started
    }

    /// Halts any audio and returns to idle, whatever the current state.
    pub async fn stop_all(&self) {
        let mut slot = self.inner.slot.lock().await;
        self.stop_locked(&mut slot);
    }

    /// Completion reported by the sink for the session `key`.
    ///
    /// Takes precedence over the duration timer. Returns whether it ended the
    /// active session.
    pub async fn on_playback_finished(&self, key: &str) -> bool {
        let Ok(id) = Uuid::parse_str(key) else {
            warn!(key, "Playback completion with unknown key");
            return false;
        };
        let mut slot = self.inner.slot.lock().await;
        if !(slot.session.is_playing && slot.session.targets(id)) {
            return false;
        }
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation += 1;
        self.publish(&mut slot, PlaybackSession::idle());
        debug!(message_id = %id, "Playback finished by sink");
        true
    }

    fn stop_locked(&self, slot: &mut Slot) {
        for handle in [slot.work.take(), slot.timer.take()].into_iter().flatten() {
            handle.abort();
        }
        slot.generation += 1;
        self.inner.sink.stop();
        self.publish(slot, PlaybackSession::idle());
    }

    fn publish(&self, slot: &mut Slot, session: PlaybackSession) {
        slot.session = session;
        self.inner.session_tx.send_replace(session);
    }

    async fn is_current(&self, id: MessageId, generation: u64) -> bool {
        let slot = self.inner.slot.lock().await;
        slot.generation == generation && slot.session.targets(id)
    }

    /// Produces a playable file and its duration, or `None` once superseded.
    async fn prepare(&self, message: &Message, generation: u64) -> Result<Option<(PathBuf, Duration)>, ChatError> {
        if message.is_user_audio() {
            let path = message
                .audio_ref
                .clone()
                .ok_or_else(|| ChatError::PlaybackFailed("voice message has no recording".into()))?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ChatError::PlaybackFailed(format!("cannot read {}: {e}", path.display())))?;
            let format = match AudioFormat::sniff(&bytes) {
                AudioFormat::Unknown => path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(AudioFormat::from_extension)
                    .unwrap_or(AudioFormat::Unknown),
                known => known,
            };
            let duration = match decode_duration(&bytes, format) {
                Ok(duration) => duration,
                Err(e) => match message.audio_duration {
                    Some(secs) => clip_duration(secs)?,
                    None => return Err(e),
                },
            };
            return Ok(Some((path, duration)));
        }

        if message.sender != Sender::Ai || message.is_streaming || message.content.trim().is_empty() {
            return Err(ChatError::PlaybackFailed("message has nothing to play".into()));
        }

        let bytes = self.inner.synthesizer.synthesize(message.content.clone()).await?;
        if !self.is_current(message.id, generation).await {
            return Ok(None);
        }

        let format = AudioFormat::sniff(&bytes);
        let duration = decode_duration(&bytes, format)?;
        let path = self.inner.cache.store(message.id, &bytes, format).await?;
        Ok(Some((path, duration)))
    }

    async fn start_playing(&self, id: MessageId, generation: u64, path: PathBuf, duration: Duration) {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation || !slot.session.targets(id) {
            debug!(message_id = %id, generation, "Superseded audio discarded");
            return;
        }
        slot.work = None;

        if let Err(e) = self.inner.sink.play_audio(&path, &id.to_string()) {
            warn!(message_id = %id, error = %e, "Audio sink refused playback");
            self.publish(&mut slot, PlaybackSession::idle());
            return;
        }
        self.publish(&mut slot, PlaybackSession::playing(id));
        info!(message_id = %id, duration_ms = duration.as_millis() as u64, "Playback started");

        let coordinator = self.clone();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            coordinator.finish_by_timer(id, generation).await;
        }));
    }

    async fn finish_by_timer(&self, id: MessageId, generation: u64) {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation == generation && slot.session.targets(id) && slot.session.is_playing {
            slot.timer = None;
            self.publish(&mut slot, PlaybackSession::idle());
            debug!(message_id = %id, "Playback finished by timer");
        }
    }

    async fn fail(&self, id: MessageId, generation: u64, error: ChatError) {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation {
            return;
        }
        warn!(message_id = %id, error = %error, "Playback failed");
        slot.work = None;
        self.publish(&mut slot, PlaybackSession::idle());
    }
}

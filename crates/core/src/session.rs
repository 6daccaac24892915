//! Turn orchestration: user input in, streamed AI reply out.
//!
//! A turn moves `Idle → AwaitingFirstToken → Streaming → Finalized`, or ends
//! in `Failed`. One turn runs at a time; a send while a turn (or the
//! transcription feeding it) is in flight is rejected before anything is
//! appended.

use crate::{
    audio_utils::{MAX_CLIP_SECS, is_recording_long_enough},
    error::{ChatError, SessionError, StorageError},
    events::{ChatEvent, TurnPhase},
    llm_client::ChatClient,
    localization::Language,
    message::{Message, MessageId, MessageStatus, Sender},
    persistence::UserKey,
    playback::{PlaybackCoordinator, RenderMode},
    speech::Transcriber,
    store::ConversationStore,
};
use futures::StreamExt;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

/// Minimum time between two visible writes of a streaming reply.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves with the phase the turn ended in.
pub type TurnHandle = JoinHandle<TurnPhase>;

/// Time-based coalescing of streaming writes.
#[derive(Debug)]
pub struct UpdateThrottle {
    interval: Duration,
    last_flush: Option<Instant>,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
        }
    }

    /// Whether a write is due now. Records the write when it is.
    pub fn should_flush(&mut self) -> bool {
        let now = Instant::now();
        match self.last_flush {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_flush = Some(now);
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    pub auto_play: bool,
    pub throttle_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            auto_play: false,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }
}

struct SessionInner {
    store: ConversationStore,
    client: Arc<dyn ChatClient>,
    transcriber: Arc<dyn Transcriber>,
    playback: PlaybackCoordinator,
    system_prompt: Option<String>,
    throttle_interval: Duration,
    auto_play: AtomicBool,
    turn_gate: Arc<Semaphore>,
}

/// One conversation: the store, the services it talks to and the playback
/// slot, wired together.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        store: ConversationStore,
        client: Arc<dyn ChatClient>,
        transcriber: Arc<dyn Transcriber>,
        playback: PlaybackCoordinator,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                client,
                transcriber,
                playback,
                system_prompt: config.system_prompt,
                throttle_interval: config.throttle_interval,
                auto_play: AtomicBool::new(config.auto_play),
                turn_gate: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    pub fn playback(&self) -> &PlaybackCoordinator {
        &self.inner.playback
    }

    pub fn auto_play(&self) -> bool {
        self.inner.auto_play.load(Ordering::Relaxed)
    }

    pub fn set_auto_play(&self, enabled: bool) {
        self.inner.auto_play.store(enabled, Ordering::Relaxed);
    }

    pub async fn set_language(&self, language: Language) {
        self.inner.store.set_language(language).await;
    }

    /// Whether a turn or a transcription is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.turn_gate.available_permits() == 0
    }

    fn try_begin(&self) -> Result<OwnedSemaphorePermit, SessionError> {
        self.inner
            .turn_gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| SessionError::TurnInProgress)
    }

    fn emit_phase(&self, message_id: MessageId, phase: TurnPhase) {
        self.inner
            .store
            .emit(ChatEvent::TurnPhaseChanged { message_id, phase });
    }

    /// Sends typed text. Blank input is ignored and yields `Ok(None)`.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn send_user_text(&self, text: &str) -> Result<Option<TurnHandle>, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let permit = self.try_begin()?;
        self.inner.playback.stop_all().await;
        self.inner.store.append(Message::user_text(text)).await;

        let (id, context) = self.open_placeholder().await;
        let session = self.clone();
        Ok(Some(tokio::spawn(async move {
            session.run_turn(permit, id, context, false).await
        })))
    }

    /// Sends a finished recording. Recordings shorter than the minimum are
    /// dropped and yield `Ok(None)`.
    #[instrument(skip(self, audio_ref), fields(path = %audio_ref.display()))]
    pub async fn send_user_audio(
        &self,
        audio_ref: PathBuf,
        duration_secs: f64,
    ) -> Result<Option<TurnHandle>, SessionError> {
        if !is_recording_long_enough(duration_secs) {
            info!(duration_secs, "Recording too short, discarded");
            return Ok(None);
        }
        if !duration_secs.is_finite() || duration_secs > MAX_CLIP_SECS {
            return Err(SessionError::InvalidRecording(format!(
                "duration {duration_secs}s exceeds {MAX_CLIP_SECS}s"
            )));
        }
        let permit = self.try_begin()?;
        self.inner.playback.stop_all().await;

        let language = self.inner.store.language().await;
        let message = Message::user_audio(language.transcribing(), audio_ref.clone(), duration_secs);
        let id = message.id;
        self.inner.store.append(message).await;

        let session = self.clone();
        Ok(Some(tokio::spawn(async move {
            session.transcribe_then_turn(permit, id, audio_ref).await
        })))
    }

    /// Runs a turn over the conversation as it stands.
    #[instrument(skip(self))]
    pub async fn start_turn(&self) -> Result<TurnHandle, SessionError> {
        let permit = self.try_begin()?;
        let voice = self
            .inner
            .store
            .snapshot()
            .await
            .last()
            .is_some_and(Message::is_user_audio);
        let (id, context) = self.open_placeholder().await;
        let session = self.clone();
        Ok(tokio::spawn(async move {
            session.run_turn(permit, id, context, voice).await
        }))
    }

    /// Retries a failed message.
    ///
    /// A failed AI reply is reset in place and regenerated from the messages
    /// before it; a failed voice message is transcribed again.
    #[instrument(skip(self))]
    pub async fn resend(&self, message_id: MessageId) -> Result<TurnHandle, SessionError> {
        let message = self
            .inner
            .store
            .get(message_id)
            .await
            .ok_or(SessionError::MessageNotFound(message_id))?;
        if message.status != MessageStatus::Failed {
            return Err(SessionError::NotRetryable(message_id));
        }

        match message.sender {
            Sender::Ai => {
                let context = self
                    .inner
                    .store
                    .context_before(message_id)
                    .await
                    .ok_or(SessionError::MessageNotFound(message_id))?;
                let permit = self.try_begin()?;
                self.inner.playback.stop_all().await;
                self.inner
                    .store
                    .modify(message_id, |m| {
                        m.content.clear();
                        m.is_streaming = true;
                        m.status = MessageStatus::Sending;
                    })
                    .await
                    .ok_or(SessionError::MessageNotFound(message_id))?;
                self.emit_phase(message_id, TurnPhase::AwaitingFirstToken);

                let voice = context.last().is_some_and(Message::is_user_audio);
                let session = self.clone();
                Ok(tokio::spawn(async move {
                    session.run_turn(permit, message_id, context, voice).await
                }))
            }
            Sender::User => {
                let audio_ref = message
                    .audio_ref
                    .clone()
                    .filter(|_| message.is_user_audio())
                    .ok_or(SessionError::NotRetryable(message_id))?;
                let permit = self.try_begin()?;
                self.inner.playback.stop_all().await;
                let language = self.inner.store.language().await;
                self.inner
                    .store
                    .modify(message_id, |m| {
                        m.content = language.transcribing().to_string();
                        m.status = MessageStatus::Sending;
                    })
                    .await
                    .ok_or(SessionError::MessageNotFound(message_id))?;

                let session = self.clone();
                Ok(tokio::spawn(async move {
                    session.transcribe_then_turn(permit, message_id, audio_ref).await
                }))
            }
        }
    }

    /// Switches to another account's conversation.
    #[instrument(skip(self))]
    pub async fn switch_user(&self, key: UserKey) -> Vec<Message> {
        self.inner.playback.stop_all().await;
        self.inner.store.switch_user(key).await
    }

    /// Returns to the guest conversation.
    pub async fn logout(&self) -> Vec<Message> {
        self.switch_user(UserKey::Guest).await
    }

    /// Deletes the current user's saved history and starts over.
    #[instrument(skip(self))]
    pub async fn delete_local_data(&self) -> Result<(), StorageError> {
        self.inner.playback.stop_all().await;
        let key = self.inner.store.current_user().await;
        self.inner.store.clear(&key).await
    }

    /// Appends the empty AI message a turn streams into and returns it along
    /// with the context that precedes it.
    async fn open_placeholder(&self) -> (MessageId, Vec<Message>) {
        let context = self.inner.store.snapshot().await;
        let placeholder = Message::ai_placeholder();
        let id = placeholder.id;
        self.inner.store.append(placeholder).await;
        self.emit_phase(id, TurnPhase::AwaitingFirstToken);
        (id, context)
    }

    async fn transcribe_then_turn(&self, permit: OwnedSemaphorePermit, id: MessageId, audio_ref: PathBuf) -> TurnPhase {
        let language = self.inner.store.language().await;
        match self.inner.transcriber.transcribe(audio_ref).await {
            Ok(transcript) => {
                let updated = self
                    .inner
                    .store
                    .modify(id, |m| {
                        m.content = transcript;
                        m.status = MessageStatus::Sent;
                    })
                    .await;
                if updated.is_none() {
                    debug!(message_id = %id, "Voice message removed before transcription finished");
                    return TurnPhase::Idle;
                }
                let (reply_id, context) = self.open_placeholder().await;
                self.run_turn(permit, reply_id, context, true).await
            }
            Err(e) => {
                warn!(message_id = %id, error = %e, "Transcription failed");
                self.inner
                    .store
                    .modify(id, |m| {
                        m.content = language.transcription_failed().to_string();
                        m.status = MessageStatus::Failed;
                    })
                    .await;
                TurnPhase::Failed
            }
        }
    }

    /// Streams the reply into message `id`. The permit is held until the
    /// reply is finalized or failed.
    async fn run_turn(
        &self,
        permit: OwnedSemaphorePermit,
        id: MessageId,
        context: Vec<Message>,
        voice_triggered: bool,
    ) -> TurnPhase {
        let outcome = self.stream_reply(id, context).await;
        let store = &self.inner.store;

        let (phase, message) = match outcome {
            Ok(reply) => {
                let message = store
                    .modify(id, |m| {
                        m.content = reply;
                        m.is_streaming = false;
                        m.status = MessageStatus::Sent;
                    })
                    .await;
                (TurnPhase::Finalized, message)
            }
            Err(e) => {
                warn!(message_id = %id, error = %e, "Turn failed");
                let apology = store.language().await.chat_unavailable();
                let message = store
                    .modify(id, |m| {
                        m.content = apology.to_string();
                        m.is_streaming = false;
                        m.status = MessageStatus::Failed;
                    })
                    .await;
                (TurnPhase::Failed, message)
            }
        };
        drop(permit);
        self.emit_phase(id, phase);

        match message {
            Some(message) if phase == TurnPhase::Finalized => self.after_turn(&message, voice_triggered).await,
            Some(_) => self.inner.playback.sink().set_render_mode(RenderMode::Idle),
            None => debug!(message_id = %id, "Reply removed before the turn ended"),
        }
        info!(message_id = %id, ?phase, "Turn ended");
        phase
    }

    async fn stream_reply(&self, id: MessageId, context: Vec<Message>) -> Result<String, ChatError> {
        let mut stream = self
            .inner
            .client
            .stream_completion(context, self.inner.system_prompt.clone())
            .await?;
        let mut throttle = UpdateThrottle::new(self.inner.throttle_interval);
        let mut reply = String::new();

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            if reply.is_empty() {
                self.emit_phase(id, TurnPhase::Streaming);
            }
            reply.push_str(&fragment);
            if throttle.should_flush() && !self.inner.store.update_content(id, reply.clone()).await {
                return Err(ChatError::StreamError("reply message no longer exists".into()));
            }
        }

        if reply.is_empty() {
            return Err(ChatError::StreamError("completion ended without content".into()));
        }
        Ok(reply)
    }

    async fn after_turn(&self, message: &Message, voice_triggered: bool) {
        let playback = &self.inner.playback;
        if self.auto_play() || voice_triggered {
            playback.sink().set_render_mode(RenderMode::Active);
            playback.play(message).await;
        } else {
            playback.sink().set_render_mode(RenderMode::Idle);
        }
    }
}

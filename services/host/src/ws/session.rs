//! Manages the WebSocket connection lifecycle for one chat client.

use super::{
    protocol::{ClientMessage, ServerMessage},
    sink::ClientAudioSink,
};
use crate::state::AppState;
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use mojitalk_core::{
    MessageId,
    localization::Language,
    persistence::UserKey,
    playback::{AudioCache, PlaybackCoordinator},
    session::{ChatSession, SessionConfig},
    store::ConversationStore,
};
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Runs one connection from the `init` handshake until the socket closes.
#[instrument(name = "ws_session", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));
    info!("New WebSocket connection. Awaiting initialization...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(WsMessage::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (user, language) = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(&mut socket_tx, ServerMessage::Error { message: e.to_string() }).await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection = Connection::open(state, connection_id, out_tx.clone(), language);
    let history = connection.session.switch_user(user).await;
    connection.register().await;
    let forwarders = connection.spawn_forwarders();

    if send_msg(&mut socket_tx, ServerMessage::Initialized { history }).await.is_err() {
        error!("Failed to send Initialized message to client.");
        connection.close(forwarders).await;
        return;
    }

    let mut writer = tokio::spawn(
        async move {
            while let Some(msg) = out_rx.recv().await {
                if send_msg(&mut socket_tx, msg).await.is_err() {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    loop {
        tokio::select! {
            _ = &mut writer => {
                warn!("Outbound channel closed.");
                break;
            }
            incoming = socket_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let outcome = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => connection.dispatch(msg).await,
                        Err(e) => Err(anyhow!("Malformed client message: {e}")),
                    };
                    if let Err(e) = outcome {
                        warn!(error = %e, "Client request failed");
                        let _ = out_tx.send(ServerMessage::Error { message: e.to_string() });
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => debug!("Ignoring non-text frame"),
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    connection.close(forwarders).await;
    writer.abort();
    info!("WebSocket connection closed.");
}

/// Parses the `init` message into the starting user and language.
fn parse_init(text: &str) -> Result<(UserKey, Option<Language>)> {
    let msg: ClientMessage = serde_json::from_str(text).context("Malformed `init` message")?;
    match msg {
        ClientMessage::Init { user_id, language } => Ok((
            UserKey::from_user_id(user_id.as_deref()),
            language.as_deref().map(Language::from_code),
        )),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// One client's conversation and the queue its updates are pushed through.
struct Connection {
    id: Uuid,
    state: Arc<AppState>,
    session: ChatSession,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Connection {
    fn open(
        state: Arc<AppState>,
        id: Uuid,
        out_tx: mpsc::UnboundedSender<ServerMessage>,
        language: Option<Language>,
    ) -> Self {
        let language = language.unwrap_or(state.config.language);
        let store = ConversationStore::new(state.history.clone(), language);
        let playback = PlaybackCoordinator::new(
            state.synthesizer.clone(),
            Arc::new(ClientAudioSink::new(out_tx.clone())),
            AudioCache::new(state.config.audio_cache_dir()),
        );
        let config = SessionConfig {
            system_prompt: Some(state.system_prompt.as_str().to_string()),
            auto_play: state.config.auto_play,
            ..SessionConfig::default()
        };
        let session = ChatSession::new(
            store,
            state.chat_client.clone(),
            state.transcriber.clone(),
            playback,
            config,
        );
        Self { id, state, session, out_tx }
    }

    /// Makes the conversation reachable by history deletion over HTTP.
    async fn register(&self) {
        self.state.live.register(self.id, self.session.store().clone()).await;
    }

    /// Pushes store events and playback state to the client until closed.
    fn spawn_forwarders(&self) -> [JoinHandle<()>; 2] {
        let mut events = self.session.store().subscribe();
        let store = self.session.store().clone();
        let tx = self.out_tx.clone();
        let chat_events = tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if tx.send(ServerMessage::from(event)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Client fell behind, resending history");
                            let history = store.snapshot().await;
                            if tx.send(ServerMessage::HistoryReplaced { history }).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .in_current_span(),
        );

        let mut playback = self.session.playback().subscribe();
        let tx = self.out_tx.clone();
        let playback_state = tokio::spawn(
            async move {
                while playback.changed().await.is_ok() {
                    let session = *playback.borrow_and_update();
                    if tx.send(ServerMessage::PlaybackState { session }).is_err() {
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        [chat_events, playback_state]
    }

    /// Handles one client request. Long-running work is spawned so that a
    /// later `stop_all` is never stuck behind it.
    async fn dispatch(&self, msg: ClientMessage) -> Result<()> {
        let session = &self.session;
        match msg {
            ClientMessage::Init { .. } => return Err(anyhow!("Session is already initialized")),
            ClientMessage::SendText { text } => {
                session.send_user_text(&text).await?;
            }
            ClientMessage::SendAudio { path, duration_secs } => {
                session.send_user_audio(path, duration_secs).await?;
            }
            ClientMessage::Resend { message_id } => {
                session.resend(message_id).await?;
            }
            ClientMessage::Play { message_id } => {
                let message = self.message(message_id).await?;
                let session = session.clone();
                tokio::spawn(
                    async move {
                        session.playback().play(&message).await;
                    }
                    .in_current_span(),
                );
            }
            ClientMessage::StopAll => session.playback().stop_all().await,
            ClientMessage::SetAutoPlay { enabled } => session.set_auto_play(enabled),
            ClientMessage::SetLanguage { language } => {
                session.set_language(Language::from_code(&language)).await;
            }
            ClientMessage::PlaybackFinished { key } => {
                if !session.playback().on_playback_finished(&key).await {
                    debug!(%key, "Ignoring completion of a superseded clip");
                }
            }
            ClientMessage::SwitchUser { user_id } => {
                session.switch_user(UserKey::from_user_id(user_id.as_deref())).await;
            }
            ClientMessage::Logout => {
                session.logout().await;
            }
            ClientMessage::DeleteLocalData => session.delete_local_data().await?,
            ClientMessage::ExplainGrammar { message_id } => {
                let message = self.message(message_id).await?;
                let language = session.store().language().await;
                let study_aids = self.state.study_aids.clone();
                self.spawn_study_aid(message_id, async move {
                    study_aids.explain_grammar(message.content, language).await
                });
            }
            ClientMessage::Translate { message_id, language } => {
                let message = self.message(message_id).await?;
                let target = Language::from_code(&language);
                let study_aids = self.state.study_aids.clone();
                self.spawn_study_aid(message_id, async move {
                    study_aids.translate(message.content, target).await
                });
            }
        }
        Ok(())
    }

    async fn message(&self, id: MessageId) -> Result<mojitalk_core::Message> {
        self.session
            .store()
            .get(id)
            .await
            .with_context(|| format!("Message {id} not found"))
    }

    fn spawn_study_aid<F>(&self, message_id: MessageId, work: F)
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let tx = self.out_tx.clone();
        tokio::spawn(
            async move {
                let reply = match work.await {
                    Ok(text) => ServerMessage::StudyAid { message_id, text },
                    Err(e) => {
                        warn!(%message_id, error = %e, "Study aid failed");
                        ServerMessage::Error { message: e.to_string() }
                    }
                };
                let _ = tx.send(reply);
            }
            .in_current_span(),
        );
    }

    /// Silences playback and writes any pending history before the
    /// conversation is dropped.
    async fn close(&self, forwarders: [JoinHandle<()>; 2]) {
        self.state.live.unregister(self.id).await;
        self.session.playback().stop_all().await;
        self.session.store().flush().await;
        for forwarder in forwarders {
            forwarder.abort();
        }
    }
}

/// A helper to serialize and send a `ServerMessage` to the client.
async fn send_msg(sink: &mut SplitSink<WebSocket, WsMessage>, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    sink.send(WsMessage::Text(serialized.into())).await?;
    Ok(())
}

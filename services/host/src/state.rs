//! Shared Application State
//!
//! The process-wide services, constructed once at startup and shared by
//! every connection. Each connection builds its own conversation on top.

use crate::config::Config;
use anyhow::{Context, Result};
use mojitalk_core::{
    StorageError,
    llm_client::{ChatClient, ChatClientConfig, OpenAICompatibleClient},
    persistence::{HistoryRepository, JsonFileHistoryRepository, UserKey},
    speech::{DashScopeSpeechClient, RemoteTranscriber, SpeechConfig, SpeechSynthesizer, Transcriber},
    store::ConversationStore,
    study_aids::{LlmStudyAidService, StudyAidService},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// The conversations of the currently open connections, by connection id.
#[derive(Clone, Default)]
pub struct LiveConversations {
    stores: Arc<Mutex<HashMap<Uuid, ConversationStore>>>,
}

impl LiveConversations {
    pub async fn register(&self, connection_id: Uuid, store: ConversationStore) {
        self.stores.lock().await.insert(connection_id, store);
    }

    pub async fn unregister(&self, connection_id: Uuid) {
        self.stores.lock().await.remove(&connection_id);
    }

    /// Deletes the history of `key` and resets every open conversation
    /// showing it, so no pending save can write it back.
    ///
    /// Returns how many open conversations were reset.
    pub async fn clear_user(&self, key: &UserKey, history: &dyn HistoryRepository) -> Result<usize, StorageError> {
        let stores: Vec<ConversationStore> = self.stores.lock().await.values().cloned().collect();
        let mut reset = 0;
        for store in stores {
            if store.current_user().await == *key {
                store.clear(key).await?;
                reset += 1;
            }
        }
        history.clear(key).await?;
        Ok(reset)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat_client: Arc<dyn ChatClient>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub history: Arc<dyn HistoryRepository>,
    pub study_aids: Arc<dyn StudyAidService>,
    pub system_prompt: Arc<String>,
    pub config: Arc<Config>,
    pub live: LiveConversations,
}

impl AppState {
    /// Wires the production services from configuration and loaded prompts.
    pub fn from_config(config: Config, prompts: HashMap<String, String>) -> Result<Self> {
        let system_prompt = prompts
            .get("system_prompt")
            .context("system_prompt.md not found in prompts directory")?
            .clone();

        let mut chat_config = ChatClientConfig::new(&config.chat_endpoint, &config.api_key, &config.chat_model);
        chat_config.max_tokens = Some(config.max_tokens);
        chat_config.history_window = config.history_window;
        let chat_client: Arc<dyn ChatClient> =
            Arc::new(OpenAICompatibleClient::new(chat_config).context("Invalid CHAT_ENDPOINT")?);

        let mut speech_config = SpeechConfig::new(&config.tts_endpoint, &config.api_key, &config.tts_model);
        speech_config.voice = config.tts_voice.clone();
        let synthesizer = Arc::new(DashScopeSpeechClient::new(speech_config).context("Invalid TTS_ENDPOINT")?);

        let transcriber = Arc::new(
            RemoteTranscriber::new(&config.asr_endpoint, &config.api_key, &config.asr_model)
                .context("Invalid ASR_ENDPOINT")?,
        );

        let history = Arc::new(JsonFileHistoryRepository::new(config.history_dir()));
        let study_aids = Arc::new(LlmStudyAidService::new(chat_client.clone(), prompts));

        Ok(Self {
            chat_client,
            synthesizer,
            transcriber,
            history,
            study_aids,
            system_prompt: Arc::new(system_prompt),
            config: Arc::new(config),
            live: LiveConversations::default(),
        })
    }
}

//! Streaming chat-completion client.
//!
//! Turns the conversation history into an OpenAI-compatible request and
//! exposes the reply as a stream of text fragments parsed from SSE frames.

use crate::{
    error::ChatError,
    message::{Message, Sender},
    sse::SseLineParser,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, pin::Pin};
use tracing::{debug, error, info, warn};

pub const DASHSCOPE_CHAT_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";
pub const DEFAULT_CHAT_MODEL: &str = "qwen-plus";
pub const DEFAULT_HISTORY_WINDOW: usize = 10;
pub const DEFAULT_MAX_TOKENS: u32 = 800;

/// A finite, non-restartable stream of reply fragments. A transport failure
/// is delivered as the final item. Dropping it closes the connection.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the provider-formatted `messages` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

/// A client able to stream a chat completion for a conversation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streaming completion over `history`, trimmed to the client's
    /// context window, with `system_prompt` prepended when given.
    ///
    /// A non-2xx answer fails here, before anything is yielded.
    async fn stream_completion(
        &self,
        history: Vec<Message>,
        system_prompt: Option<String>,
    ) -> Result<CompletionStream, ChatError>;

    /// Opens a streaming completion over pre-built provider messages.
    async fn stream_messages(&self, messages: Vec<ChatMessage>) -> Result<CompletionStream, ChatError>;
}

/// Collects a whole completion into one string.
pub async fn collect_completion(
    client: &dyn ChatClient,
    messages: Vec<ChatMessage>,
) -> Result<String, ChatError> {
    let mut stream = client.stream_messages(messages).await?;
    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

/// Converts the last `window` eligible messages of `history` into provider
/// messages, prefixed by the system prompt.
pub fn build_chat_messages(
    history: &[Message],
    system_prompt: Option<&str>,
    window: usize,
) -> Vec<ChatMessage> {
    let eligible: Vec<&Message> = history.iter().filter(|m| m.is_context_eligible()).collect();
    let start = eligible.len().saturating_sub(window);

    let mut messages = Vec::with_capacity(eligible.len() - start + 1);
    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(eligible[start..].iter().map(|m| ChatMessage {
        role: match m.sender {
            Sender::User => ChatRole::User,
            Sender::Ai => ChatRole::Assistant,
        },
        content: m.content.clone(),
    }));
    messages
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub history_window: usize,
}

impl ChatClientConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extracts `choices[0].delta.content` from one SSE payload. Anything that
/// does not have that shape is skipped rather than treated as an error.
fn parse_delta(data: &str) -> Option<String> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "Skipping malformed SSE payload");
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty())
}

/// An implementation of `ChatClient` for any OpenAI-compatible endpoint.
pub struct OpenAICompatibleClient {
    http: reqwest::Client,
    config: ChatClientConfig,
}

impl OpenAICompatibleClient {
    /// Creates a new client; fails with `InvalidUrl` if the endpoint does not parse.
    pub fn new(config: ChatClientConfig) -> Result<Self, ChatError> {
        reqwest::Url::parse(&config.endpoint)
            .map_err(|e| ChatError::InvalidUrl(format!("{}: {e}", config.endpoint)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    pub fn config(&self) -> &ChatClientConfig {
        &self.config
    }
}

#[async_trait]
impl ChatClient for OpenAICompatibleClient {
    async fn stream_completion(
        &self,
        history: Vec<Message>,
        system_prompt: Option<String>,
    ) -> Result<CompletionStream, ChatError> {
        let messages = build_chat_messages(&history, system_prompt.as_deref(), self.config.history_window);
        self.stream_messages(messages).await
    }

    async fn stream_messages(&self, messages: Vec<ChatMessage>) -> Result<CompletionStream, ChatError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages: &messages,
            stream: true,
            max_tokens: self.config.max_tokens,
        };

        debug!(model = %self.config.model, messages = messages.len(), "Opening chat completion stream");
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Chat completion request failed");
                ChatError::connection(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Chat completion endpoint returned an error");
            return Err(ChatError::status(status, &body));
        }

        info!("Chat completion stream opened");
        let state = (
            Box::pin(response.bytes_stream()),
            SseLineParser::new(),
            VecDeque::<String>::new(),
            false,
        );
        let stream = futures::stream::unfold(state, |(mut body, mut parser, mut pending, mut done)| async move {
            loop {
                if let Some(fragment) = pending.pop_front() {
                    return Some((Ok(fragment), (body, parser, pending, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for event in parser.push(&chunk) {
                            if event.is_done() {
                                done = true;
                                break;
                            }
                            pending.extend(parse_delta(&event.data));
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Chat completion stream broke");
                        return Some((Err(ChatError::StreamError(e.to_string())), (body, parser, pending, true)));
                    }
                    None => {
                        if let Some(event) = parser.flush().filter(|event| !event.is_done()) {
                            pending.extend(parse_delta(&event.data));
                        }
                        done = true;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

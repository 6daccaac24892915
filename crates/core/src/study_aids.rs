//! Translation and grammar explanations for individual messages.
//!
//! Both tools render a Markdown prompt template and collect one completion
//! from the configured chat model.

use crate::{
    llm_client::{ChatClient, ChatMessage, collect_completion},
    localization::Language,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

pub const GRAMMAR_TEMPLATE: &str = "grammar_analysis";
pub const TRANSLATE_TEMPLATE: &str = "translate";

/// Defines the contract for the study tools offered on a message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StudyAidService: Send + Sync {
    /// Breaks down the vocabulary and grammar of a Japanese sentence,
    /// explained in `language`.
    async fn explain_grammar(&self, text: String, language: Language) -> Result<String>;

    /// Translates `text` into `target`.
    async fn translate(&self, text: String, target: Language) -> Result<String>;
}

/// A `StudyAidService` backed by the chat model.
pub struct LlmStudyAidService {
    client: Arc<dyn ChatClient>,
    prompts: HashMap<String, String>,
}

impl LlmStudyAidService {
    /// `prompts` must contain the `grammar_analysis` and `translate`
    /// templates. `{text}` and `{language}` are substituted.
    pub fn new(client: Arc<dyn ChatClient>, prompts: HashMap<String, String>) -> Self {
        Self { client, prompts }
    }

    fn render(&self, template: &str, text: &str, language: Language) -> Result<String> {
        let prompt = self
            .prompts
            .get(template)
            .with_context(|| format!("Missing prompt template: '{template}'"))?;
        // `{text}` goes last so placeholders inside the message survive.
        Ok(prompt
            .replace("{language}", language.english_name())
            .replace("{text}", text))
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        let messages = vec![
            ChatMessage::system("You are a patient Japanese teacher."),
            ChatMessage::user(prompt),
        ];
        let answer = collect_completion(self.client.as_ref(), messages)
            .await
            .context("Study aid completion failed")?;
        let answer = answer.trim();
        anyhow::ensure!(!answer.is_empty(), "Study aid completion was empty");
        Ok(answer.to_string())
    }
}

#[async_trait]
impl StudyAidService for LlmStudyAidService {
    async fn explain_grammar(&self, text: String, language: Language) -> Result<String> {
        let prompt = self.render(GRAMMAR_TEMPLATE, &text, language)?;
        self.ask(prompt).await
    }

    async fn translate(&self, text: String, target: Language) -> Result<String> {
        let prompt = self.render(TRANSLATE_TEMPLATE, &text, target)?;
        self.ask(prompt).await
    }
}

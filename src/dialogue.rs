//! Dialogue generation

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::OpenAiConfig;
use crate::{Error, Result};

/// One completed (user, assistant) exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Produces the assistant's reply for a turn
#[async_trait]
pub trait DialogueModel: Send + Sync {
    /// Generate a reply to `user_text`
    ///
    /// `memory` is recalled long-term memory that applies to this turn only.
    ///
    /// # Errors
    ///
    /// Returns error if generation fails
    async fn generate(
        &self,
        history: &[Exchange],
        memory: Option<&str>,
        user_text: &str,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// `OpenAI` chat completions client
pub struct OpenAiDialogue {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiDialogue {
    /// Create a dialogue client speaking with `system_prompt`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        client: reqwest::Client,
        config: &OpenAiConfig,
        system_prompt: impl Into<String>,
    ) -> Result<Self> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for dialogue".to_string(),
            ));
        }

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.llm_model.clone(),
            system_prompt: system_prompt.into(),
            max_tokens: 500,
            temperature: 0.7,
        })
    }

    fn system_message(&self, memory: Option<&str>) -> String {
        match memory {
            Some(memory) if !memory.trim().is_empty() => format!(
                "{}\n\nThings you remember about the user:\n{memory}",
                self.system_prompt
            ),
            _ => self.system_prompt.clone(),
        }
    }
}

#[async_trait]
impl DialogueModel for OpenAiDialogue {
    async fn generate(
        &self,
        history: &[Exchange],
        memory: Option<&str>,
        user_text: &str,
    ) -> Result<String> {
        let system = self.system_message(memory);

        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage {
            role: "system",
            content: &system,
        });
        for exchange in history {
            messages.push(ChatMessage {
                role: "user",
                content: &exchange.user,
            });
            // a user turn whose reply failed is kept without an answer
            if !exchange.assistant.is_empty() {
                messages.push(ChatMessage {
                    role: "assistant",
                    content: &exchange.assistant,
                });
            }
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_text,
        });

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(
            model = %self.model,
            history = history.len(),
            with_memory = memory.is_some(),
            "requesting chat completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Dialogue(format!("OpenAI API error {status}: {body}")));
        }

        let result: ChatCompletionResponse = response.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| Error::Dialogue("empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialogue() -> OpenAiDialogue {
        let config = OpenAiConfig {
            api_key: SecretString::from("sk-test".to_string()),
            base_url: "http://localhost".to_string(),
            asr_model: "whisper-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            language: "ja".to_string(),
        };
        OpenAiDialogue::new(reqwest::Client::new(), &config, "Be brief.").unwrap()
    }

    #[test]
    fn test_memory_appended_to_system_prompt() {
        let d = dialogue();
        assert_eq!(d.system_message(None), "Be brief.");
        assert_eq!(d.system_message(Some("  ")), "Be brief.");
        let with_memory = d.system_message(Some("likes strawberries"));
        assert!(with_memory.starts_with("Be brief."));
        assert!(with_memory.ends_with("likes strawberries"));
    }
}

//! Speech-to-text (STT) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::OpenAiConfig;
use crate::{Error, Result};

/// Converts recorded speech to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV-encoded utterance
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Response from `OpenAI` Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes speech with `OpenAI` Whisper
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    language: String,
}

impl WhisperTranscriber {
    /// Create a new Whisper client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, config: &OpenAiConfig) -> Result<Self> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.asr_model.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if !self.language.is_empty() {
            form = form.text("language", self.language.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        let transcript = result.text.trim().to_string();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let config = OpenAiConfig {
            api_key: SecretString::from(String::new()),
            base_url: "http://localhost".to_string(),
            asr_model: "whisper-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            language: "ja".to_string(),
        };
        assert!(WhisperTranscriber::new(reqwest::Client::new(), &config).is_err());
    }
}

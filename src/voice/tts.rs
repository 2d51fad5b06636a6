//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};

use crate::config::OpenAiConfig;
use crate::{Error, Result};

/// Encoded audio delivered incrementally by a synthesizer
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Turns reply text into speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// The returned stream yields encoded audio as it becomes available.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis cannot be started
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// Synthesizes speech with the `OpenAI` speech endpoint
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    voice: String,
}

impl OpenAiSynthesizer {
    /// Create a new `OpenAI` TTS client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, config: &OpenAiConfig) -> Result<Self> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: crate::protocol::AUDIO_FORMAT,
        };

        tracing::debug!(chars = text.chars().count(), "starting speech synthesis");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));
        Ok(stream.boxed())
    }
}

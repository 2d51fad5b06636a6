//! Configuration management for the voicelink gateway
//!
//! Required settings come from environment variables. Tunables for sessions,
//! segmentation, streaming and trigger phrases can be overridden from a TOML
//! file named by `VOICELINK_CONFIG` (or `--config`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::memory::trigger::{DEFAULT_RECALL_PATTERNS, DEFAULT_SAVE_PATTERNS};
use crate::{Error, Result};

/// Default WebSocket path devices connect to
pub const DEFAULT_WS_PATH: &str = "/xiaozhi/v1/";

const DEFAULT_CHARACTER_PROMPT: &str = "You are a warm, playful voice companion living inside a small \
device. Keep replies short enough to speak aloud in a few seconds, and answer in the language \
the user speaks.";

/// Voicelink gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listener settings
    pub server: ServerConfig,

    /// `OpenAI` speech and dialogue settings
    pub openai: OpenAiConfig,

    /// Memory manager service, when configured
    pub memory_api: Option<MemoryApiConfig>,

    /// HS256 secret used to verify device tokens
    pub jwt_secret: SecretString,

    /// System prompt for the dialogue model
    pub character_prompt: String,

    /// Per-session limits and timeouts
    pub session: SessionConfig,

    /// Utterance segmentation policy
    pub segmentation: SegmentationConfig,

    /// Outbound audio streaming
    pub streaming: StreamingConfig,

    /// Memory trigger phrases
    pub triggers: TriggerConfig,

    /// Log filter directive (`LOG_LEVEL`)
    pub log_level: Option<String>,

    /// Directory for rotated log files (`LOG_DIR`)
    pub log_dir: Option<PathBuf>,
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            ws_path: DEFAULT_WS_PATH.to_string(),
        }
    }
}

/// `OpenAI` API configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub base_url: String,
    /// Transcription model (e.g. "whisper-1")
    pub asr_model: String,
    /// Chat completion model
    pub llm_model: String,
    /// Speech model (e.g. "tts-1")
    pub tts_model: String,
    /// Voice identifier
    pub tts_voice: String,
    /// Language hint passed to transcription
    pub language: String,
}

/// Memory manager API configuration
#[derive(Debug, Clone)]
pub struct MemoryApiConfig {
    pub base_url: String,
    pub secret: Option<SecretString>,
}

/// Session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a client has to send `hello`
    pub handshake_timeout_secs: u64,
    /// Seconds without frames while idle before the session closes
    pub idle_timeout_secs: u64,
    /// Upper bound on any single collaborator call
    pub collaborator_timeout_secs: u64,
    /// Seconds shutdown waits for sessions to close
    pub drain_timeout_secs: u64,
    /// Inbound frame queue capacity
    pub queue_capacity: usize,
    /// Protocol violations tolerated before the connection is closed
    pub protocol_tolerance: u32,
    /// Conversation exchanges kept per session
    pub context_capacity: usize,
    /// Discard audio captured while the gateway was busy with a turn
    pub echo_guard: bool,
    /// Banner sent in the `welcome` frame
    pub welcome_message: String,
    /// Reply spoken after a memory save
    pub save_confirmation: String,
    /// Reply spoken when a memory save fails
    pub save_apology: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
            collaborator_timeout_secs: 30,
            drain_timeout_secs: 10,
            queue_capacity: 64,
            protocol_tolerance: 5,
            context_capacity: 10,
            echo_guard: true,
            welcome_message: "connected to voicelink".to_string(),
            save_confirmation: "はい、覚えました。".to_string(),
            save_apology: "すみません、記憶できませんでした。".to_string(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Utterance segmentation policy for 16-bit mono PCM input
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub sample_rate: u32,
    /// RMS level (0.0 to 1.0) above which a chunk counts as voiced
    pub energy_threshold: f32,
    /// Trailing silence that ends an utterance
    pub silence_ms: u64,
    /// Hard cap on a single utterance
    pub max_utterance_ms: u64,
    /// Voiced audio required for an utterance to become a turn
    pub min_speech_ms: u64,
    /// Flush buffered speech when audio stops arriving for this long
    pub stall_ms: u64,
    /// Binary frames at or below this size are keepalives
    pub dtx_threshold: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            energy_threshold: 0.02,
            silence_ms: 1_000,
            max_utterance_ms: 20_000,
            min_speech_ms: 300,
            stall_ms: 2_000,
            dtx_threshold: 12,
        }
    }
}

impl SegmentationConfig {
    #[must_use]
    pub const fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    #[must_use]
    pub const fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }

    #[must_use]
    pub const fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }
}

/// Outbound audio streaming
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bytes per outbound binary frame
    pub chunk_bytes: usize,
    /// Maximum wait for the transport to accept one frame
    pub write_timeout_ms: u64,
    /// Optional cap on outbound frames per second
    pub max_chunks_per_second: Option<u32>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 16 * 1024,
            write_timeout_ms: 5_000,
            max_chunks_per_second: None,
        }
    }
}

impl StreamingConfig {
    /// Frames must stay below this size
    pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Memory trigger phrases, as regular expressions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Recall patterns, checked first
    pub recall: Vec<String>,
    /// Save patterns
    pub save: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            recall: DEFAULT_RECALL_PATTERNS.iter().map(ToString::to_string).collect(),
            save: DEFAULT_SAVE_PATTERNS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Tunables accepted from the TOML file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    ws_path: Option<String>,
    character_prompt: Option<String>,
    session: Option<SessionConfig>,
    segmentation: Option<SegmentationConfig>,
    streaming: Option<StreamingConfig>,
    triggers: Option<TriggerConfig>,
}

impl GatewayConfig {
    /// Load configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if required variables are missing or a value is invalid
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup
    ///
    /// All missing required variables are reported in a single error.
    ///
    /// # Errors
    ///
    /// Returns error if required variables are missing, a value does not
    /// parse, or the TOML override file cannot be read
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();

        let api_key = get("OPENAI_API_KEY");
        if api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        let jwt_secret = get("JWT_SECRET_KEY");
        if jwt_secret.is_none() {
            missing.push("JWT_SECRET_KEY");
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {raw}")))?,
            None => 8000,
        };

        let mut session = SessionConfig::default();
        if let Some(raw) = get("WEBSOCKET_TIMEOUT_SECONDS") {
            session.idle_timeout_secs = raw.parse().map_err(|_| {
                Error::Config(format!("WEBSOCKET_TIMEOUT_SECONDS is not a number: {raw}"))
            })?;
        }

        let memory_api = get("MANAGER_API_URL")
            .or_else(|| get("NEKOTA_API_URL"))
            .map(|base_url| MemoryApiConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                secret: get("MANAGER_API_SECRET")
                    .or_else(|| get("NEKOTA_API_SECRET"))
                    .map(SecretString::from),
            });

        let mut config = Self {
            server: ServerConfig {
                host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port,
                ws_path: DEFAULT_WS_PATH.to_string(),
            },
            openai: OpenAiConfig {
                api_key: SecretString::from(api_key.unwrap_or_default()),
                base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                asr_model: get("OPENAI_ASR_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
                llm_model: get("OPENAI_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                tts_model: get("OPENAI_TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
                tts_voice: get("OPENAI_TTS_VOICE").unwrap_or_else(|| "alloy".to_string()),
                language: get("ASR_LANGUAGE").unwrap_or_else(|| "ja".to_string()),
            },
            memory_api,
            jwt_secret: SecretString::from(jwt_secret.unwrap_or_default()),
            character_prompt: get("CHARACTER_PROMPT")
                .unwrap_or_else(|| DEFAULT_CHARACTER_PROMPT.to_string()),
            session,
            segmentation: SegmentationConfig::default(),
            streaming: StreamingConfig::default(),
            triggers: TriggerConfig::default(),
            log_level: get("LOG_LEVEL"),
            log_dir: get("LOG_DIR").map(PathBuf::from),
        };

        if let Some(path) = get("VOICELINK_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply tunable overrides from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        self.apply_toml(&raw)?;
        tracing::debug!(path = %path.display(), "applied config overrides");
        Ok(())
    }

    /// Apply tunable overrides from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid TOML for the override schema
    pub fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw)?;

        if let Some(ws_path) = file.ws_path {
            self.server.ws_path = ws_path;
        }
        if let Some(prompt) = file.character_prompt {
            self.character_prompt = prompt;
        }
        if let Some(session) = file.session {
            self.session = session;
        }
        if let Some(segmentation) = file.segmentation {
            self.segmentation = segmentation;
        }
        if let Some(streaming) = file.streaming {
            self.streaming = streaming;
        }
        if let Some(triggers) = file.triggers {
            self.triggers = triggers;
        }
        Ok(())
    }

    /// Check tunables for values the gateway cannot run with
    ///
    /// # Errors
    ///
    /// Returns error listing every invalid setting
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !self.server.ws_path.starts_with('/') {
            problems.push(format!("ws_path must start with '/': {}", self.server.ws_path));
        }
        if self.session.queue_capacity == 0 {
            problems.push("session.queue_capacity must be positive".to_string());
        }
        if self.session.context_capacity == 0 {
            problems.push("session.context_capacity must be positive".to_string());
        }
        if self.session.collaborator_timeout_secs == 0 {
            problems.push("session.collaborator_timeout_secs must be positive".to_string());
        }
        if self.segmentation.sample_rate == 0 {
            problems.push("segmentation.sample_rate must be positive".to_string());
        }
        if self.segmentation.max_utterance_ms == 0 {
            problems.push("segmentation.max_utterance_ms must be positive".to_string());
        }
        if self.segmentation.min_speech_ms > self.segmentation.max_utterance_ms {
            problems.push("segmentation.min_speech_ms exceeds max_utterance_ms".to_string());
        }
        if self.streaming.chunk_bytes == 0
            || self.streaming.chunk_bytes >= StreamingConfig::MAX_CHUNK_BYTES
        {
            problems.push(format!(
                "streaming.chunk_bytes must be between 1 and {}",
                StreamingConfig::MAX_CHUNK_BYTES - 1
            ));
        }
        if self.streaming.max_chunks_per_second == Some(0) {
            problems.push("streaming.max_chunks_per_second must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_required_reported_together() {
        let err = GatewayConfig::from_lookup(lookup(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("OPENAI_API_KEY"));
        assert!(msg.contains("JWT_SECRET_KEY"));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.ws_path, DEFAULT_WS_PATH);
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.segmentation.silence_threshold(), Duration::from_secs(1));
        assert!(config.memory_api.is_none());
        assert_eq!(config.openai.api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn test_memory_api_fallback_names() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET_KEY", "secret"),
            ("NEKOTA_API_URL", "http://memory.local/"),
            ("NEKOTA_API_SECRET", "s3"),
            ("WEBSOCKET_TIMEOUT_SECONDS", "42"),
        ]))
        .unwrap();

        let memory = config.memory_api.unwrap();
        assert_eq!(memory.base_url, "http://memory.local");
        assert_eq!(memory.secret.unwrap().expose_secret(), "s3");
        assert_eq!(config.session.idle_timeout_secs, 42);
    }

    #[test]
    fn test_invalid_port() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET_KEY", "secret"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_toml_overrides() {
        let mut config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET_KEY", "secret"),
        ]))
        .unwrap();

        config
            .apply_toml(
                r#"
                ws_path = "/voice"

                [segmentation]
                silence_ms = 600

                [triggers]
                save = ["note that"]
                "#,
            )
            .unwrap();

        assert_eq!(config.server.ws_path, "/voice");
        assert_eq!(config.segmentation.silence_ms, 600);
        assert_eq!(config.segmentation.max_utterance_ms, 20_000);
        assert_eq!(config.triggers.save, vec!["note that".to_string()]);
        assert_eq!(config.triggers.recall.len(), DEFAULT_RECALL_PATTERNS.len());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_oversized_chunks() {
        let mut config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET_KEY", "secret"),
        ]))
        .unwrap();
        config.streaming.chunk_bytes = 64 * 1024;
        assert!(config.validate().is_err());
    }
}

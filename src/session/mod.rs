//! Per-connection session orchestration
//!
//! A session is created by the connection gate once the device has
//! authenticated. From then on one task owns all of its state: a reader task
//! feeds classified frames through a bounded queue and the session task runs
//! turns strictly one at a time.

mod context;
mod pipeline;
mod runner;
mod streamer;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use context::ConversationContext;
pub use streamer::{ResponseStreamer, StreamOutcome};

use crate::auth::{CredentialVerifier, JwtVerifier};
use crate::config::{GatewayConfig, SegmentationConfig, SessionConfig, StreamingConfig};
use crate::dialogue::{DialogueModel, OpenAiDialogue};
use crate::memory::{ManagerMemoryClient, MemoryStore, TriggerClassifier};
use crate::protocol::ProtocolVersion;
use crate::registry::SessionRegistry;
use crate::transport::{FrameSink, FrameSource};
use crate::voice::{OpenAiSynthesizer, Synthesizer, Transcriber, WhisperTranscriber};
use crate::Result;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingHello,
    Idle,
    Listening,
    Processing,
    Responding,
    Closing,
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingHello => "awaiting_hello",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External services a session calls during turns
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub dialogue: Arc<dyn DialogueModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Absent when no memory service is configured
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub verifier: Arc<dyn CredentialVerifier>,
}

impl Collaborators {
    /// Build the HTTP-backed collaborators described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if a client cannot be constructed
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("voicelink-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let memory = config.memory_api.as_ref().map(|api| {
            Arc::new(ManagerMemoryClient::new(client.clone(), api)) as Arc<dyn MemoryStore>
        });
        if memory.is_none() {
            tracing::warn!("no memory API configured, save and recall requests will degrade");
        }

        Ok(Self {
            transcriber: Arc::new(WhisperTranscriber::new(client.clone(), &config.openai)?),
            dialogue: Arc::new(OpenAiDialogue::new(
                client.clone(),
                &config.openai,
                config.character_prompt.clone(),
            )?),
            synthesizer: Arc::new(OpenAiSynthesizer::new(client, &config.openai)?),
            memory,
            verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        })
    }
}

/// Shared state behind every session on this server
pub struct Gateway {
    pub collaborators: Collaborators,
    pub classifier: TriggerClassifier,
    pub registry: Arc<SessionRegistry>,
    pub session: SessionConfig,
    pub segmentation: SegmentationConfig,
    pub streaming: StreamingConfig,
}

impl Gateway {
    /// Create a gateway from configuration and collaborators
    ///
    /// # Errors
    ///
    /// Returns error if the trigger patterns do not compile
    pub fn new(config: &GatewayConfig, collaborators: Collaborators) -> Result<Self> {
        Ok(Self {
            collaborators,
            classifier: TriggerClassifier::from_config(&config.triggers)?,
            registry: Arc::new(SessionRegistry::new()),
            session: config.session.clone(),
            segmentation: config.segmentation.clone(),
            streaming: config.streaming.clone(),
        })
    }

    /// Run one connection from handshake to close
    ///
    /// Rejected handshakes return once the rejection has been sent.
    pub async fn serve(
        self: Arc<Self>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) {
        match crate::gate::accept(&self, sink, source).await {
            Ok(session) => session.run().await,
            Err(e) => tracing::debug!(kind = e.kind(), "handshake ended without a session"),
        }
    }
}

/// Identity fixed at handshake time
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: Uuid,
    pub device_id: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
    pub protocol: ProtocolVersion,
}

/// An authenticated, registered session ready to run
pub struct Session {
    pub(crate) info: SessionInfo,
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) sink: Box<dyn FrameSink>,
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<SessionState>,
}

impl Session {
    #[must_use]
    pub const fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Subscribe to state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

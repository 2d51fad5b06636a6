//! Voicelink Gateway - real-time voice assistant gateway for embedded devices
//!
//! Devices connect over a WebSocket, authenticate with a bearer token in
//! their `hello`, then stream microphone audio or send text. Each turn is
//! transcribed, checked for long-term memory requests, answered by a
//! dialogue model and streamed back as text plus synthesized audio.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Device (WebSocket: JSON control + audio)       │
//! └─────────────────────────┬────────────────────────────┘
//!                           │
//! ┌─────────────────────────▼────────────────────────────┐
//! │  Gate  │  Demux  │  Intake  │  Turn Pipeline  │  Streamer │
//! │              Session Registry (one task each)         │
//! └─────────────────────────┬────────────────────────────┘
//!                           │
//! ┌─────────────────────────▼────────────────────────────┐
//! │   STT   │   Dialogue LLM   │   TTS   │   Memory API    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod demux;
pub mod dialogue;
pub mod error;
pub mod gate;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod voice;

pub use api::{ApiServer, ApiState};
pub use auth::{CredentialVerifier, JwtVerifier, VerifiedCredential};
pub use config::GatewayConfig;
pub use dialogue::{DialogueModel, Exchange, OpenAiDialogue};
pub use error::{AuthError, CollaboratorFailure, CollaboratorKind, Error, Result};
pub use memory::{ManagerMemoryClient, MemoryStore, MemoryTrigger, TriggerClassifier};
pub use protocol::{ClientMessage, ProtocolVersion, ServerMessage};
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{Collaborators, Gateway, Session, SessionState};
pub use transport::{FrameSink, FrameSource, InboundUnit, OutboundUnit};

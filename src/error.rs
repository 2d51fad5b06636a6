//! Error types for the voicelink gateway

use std::fmt;

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// External collaborator a turn depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollaboratorKind {
    /// Speech-to-text
    Transcription,
    /// Dialogue generation (LLM)
    Dialogue,
    /// Text-to-speech
    Synthesis,
    /// Long-term memory service
    Memory,
}

impl CollaboratorKind {
    /// Stable name used in logs and error frames
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Dialogue => "dialogue",
            Self::Synthesis => "synthesis",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a collaborator call did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The call exceeded the configured collaborator timeout
    TimedOut,
    /// The collaborator returned an error
    Failed(String),
}

/// A failed or timed-out call to an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} call failed: {reason}")]
pub struct CollaboratorFailure {
    pub kind: CollaboratorKind,
    pub reason: FailureReason,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::Failed(msg) => f.write_str(msg),
        }
    }
}

impl CollaboratorFailure {
    #[must_use]
    pub const fn timed_out(kind: CollaboratorKind) -> Self {
        Self {
            kind,
            reason: FailureReason::TimedOut,
        }
    }

    pub fn failed(kind: CollaboratorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: FailureReason::Failed(message.into()),
        }
    }
}

/// Handshake and credential failures
///
/// Each variant maps to its own error-frame kind and WebSocket close code so
/// clients can tell rejections apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// First frame was not a well-formed `hello`
    #[error("malformed hello: {0}")]
    MalformedHello(String),

    /// `hello` carried no bearer credential
    #[error("missing credential")]
    MissingCredential,

    /// Credential failed verification
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Credential is past its expiry
    #[error("credential expired")]
    Expired,

    /// Client never sent `hello`
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Transport closed before the handshake completed
    #[error("connection closed during handshake")]
    ConnectionClosed,
}

impl AuthError {
    /// Stable error-frame kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedHello(_) => "malformed_hello",
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::Expired => "credential_expired",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::ConnectionClosed => "connection_closed",
        }
    }

    /// WebSocket close code sent with the rejection
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::MalformedHello(_) => 4400,
            Self::MissingCredential => 4401,
            Self::InvalidCredential(_) => 4403,
            Self::Expired => 4419,
            Self::HandshakeTimeout => 4408,
            Self::ConnectionClosed => 1000,
        }
    }
}

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-sequence frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Overlapping input modalities within one turn
    #[error("conflicting input: {0}")]
    ConflictingInput(String),

    /// External collaborator failure
    #[error(transparent)]
    Collaborator(#[from] CollaboratorFailure),

    /// Transport read/write failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded resource hit its limit
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Dialogue model error
    #[error("dialogue error: {0}")]
    Dialogue(String),

    /// Memory service error
    #[error("memory error: {0}")]
    Memory(String),

    /// Audio encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable snake_case kind for error frames
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Protocol(_) | Self::Serialization(_) => "protocol_error",
            Self::Auth(e) => e.kind(),
            Self::ConflictingInput(_) => "conflicting_input",
            Self::Collaborator(f) => match f.kind {
                CollaboratorKind::Transcription => "transcription_failed",
                CollaboratorKind::Dialogue => "dialogue_failed",
                CollaboratorKind::Synthesis => "synthesis_failed",
                CollaboratorKind::Memory => "memory_failed",
            },
            Self::Transport(_) => "transport_error",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Stt(_) => "stt_error",
            Self::Tts(_) => "tts_error",
            Self::Dialogue(_) => "dialogue_error",
            Self::Memory(_) => "memory_error",
            Self::Audio(_) => "audio_error",
            Self::Io(_) => "io_error",
            Self::Http(_) => "http_error",
            Self::Toml(_) => "config_error",
        }
    }

    /// Whether the error ends the connection
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejections_are_distinguishable() {
        let all = [
            AuthError::MalformedHello("x".to_string()),
            AuthError::MissingCredential,
            AuthError::InvalidCredential("bad".to_string()),
            AuthError::Expired,
            AuthError::HandshakeTimeout,
        ];
        let mut kinds: Vec<_> = all.iter().map(AuthError::kind).collect();
        let mut codes: Vec<_> = all.iter().map(AuthError::close_code).collect();
        kinds.dedup();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(kinds.len(), all.len());
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn collaborator_failure_kind() {
        let err = Error::from(CollaboratorFailure::timed_out(CollaboratorKind::Dialogue));
        assert_eq!(err.kind(), "dialogue_failed");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "dialogue call failed: timed out");
    }

    #[test]
    fn transport_errors_are_fatal() {
        assert!(Error::Transport("reset".to_string()).is_fatal());
        assert!(!Error::Protocol("bad".to_string()).is_fatal());
    }
}

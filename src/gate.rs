//! Connection gate: handshake and authentication
//!
//! The first frame on a connection must be a `hello` carrying a bearer
//! credential. A session is only created and registered once that
//! credential verifies; every rejection is reported with a distinct error
//! kind and close code before the transport is closed.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::auth::extract_bearer;
use crate::demux::parse_control;
use crate::error::AuthError;
use crate::protocol::{ClientMessage, Hello, ProtocolVersion, ServerMessage};
use crate::session::{Gateway, Session, SessionInfo, SessionState};
use crate::transport::{FrameSink, FrameSource, InboundUnit, OutboundUnit};

const UNKNOWN_DEVICE: &str = "unknown";

/// Authenticate a new connection
///
/// The session is registered in `AWAITING_HELLO` while the `welcome` frame
/// is written and moves to `IDLE` once it has been sent.
///
/// # Errors
///
/// Returns the rejection reason; the connection has already been closed
pub async fn accept(
    gateway: &Arc<Gateway>,
    mut sink: Box<dyn FrameSink>,
    mut source: Box<dyn FrameSource>,
) -> Result<Session, AuthError> {
    let hello = match read_hello(gateway, source.as_mut()).await {
        Ok(hello) => hello,
        Err(e) => {
            reject(sink.as_mut(), &e).await;
            return Err(e);
        }
    };

    let (info, audio_params) = match authenticate(gateway, hello).await {
        Ok(accepted) => accepted,
        Err(e) => {
            reject(sink.as_mut(), &e).await;
            return Err(e);
        }
    };

    let (state_tx, state_rx) = watch::channel(SessionState::AwaitingHello);
    let cancel = gateway
        .registry
        .register(info.connection_id, &info.device_id, &info.subject, state_rx)
        .await;

    let welcome = ServerMessage::Welcome {
        message: gateway.session.welcome_message.clone(),
        device_id: info.device_id.clone(),
        session_id: info.connection_id.to_string(),
        transport: "websocket",
        audio_params,
    };
    let sent = match welcome.to_json() {
        Ok(json) => sink.send(OutboundUnit::Text(json)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::warn!(error = %e, "failed to send welcome");
        gateway.registry.unregister(info.connection_id).await;
        return Err(AuthError::ConnectionClosed);
    }
    state_tx.send_replace(SessionState::Idle);

    tracing::info!(
        connection_id = %info.connection_id,
        device_id = %info.device_id,
        subject = %info.subject,
        protocol = info.protocol.number(),
        "session accepted"
    );

    Ok(Session {
        info,
        gateway: Arc::clone(gateway),
        sink,
        source,
        cancel,
        state: state_tx,
    })
}

async fn read_hello(gateway: &Gateway, source: &mut dyn FrameSource) -> Result<Hello, AuthError> {
    let first = tokio::time::timeout(gateway.session.handshake_timeout(), source.recv())
        .await
        .map_err(|_| AuthError::HandshakeTimeout)?;

    let text = match first {
        None | Some(Err(_)) => return Err(AuthError::ConnectionClosed),
        Some(Ok(InboundUnit::Binary(_))) => {
            return Err(AuthError::MalformedHello(
                "expected hello, got binary frame".to_string(),
            ));
        }
        Some(Ok(InboundUnit::Text(text))) => text,
    };

    match parse_control(&text) {
        Ok(ClientMessage::Hello(hello)) => Ok(hello),
        Ok(other) => Err(AuthError::MalformedHello(format!(
            "expected hello, got {}",
            other.type_name()
        ))),
        Err(e) => Err(AuthError::MalformedHello(e.to_string())),
    }
}

async fn authenticate(
    gateway: &Gateway,
    hello: Hello,
) -> Result<(SessionInfo, Option<serde_json::Value>), AuthError> {
    let protocol = ProtocolVersion::from_header(hello.header("protocol-version").as_deref())
        .map_err(|e| AuthError::MalformedHello(e.to_string()))?;

    let header = hello
        .header("authorization")
        .ok_or(AuthError::MissingCredential)?;
    let token = extract_bearer(&header).ok_or_else(|| {
        AuthError::InvalidCredential("authorization is not a bearer token".to_string())
    })?;

    let verify = gateway.collaborators.verifier.verify(token);
    let credential = tokio::time::timeout(gateway.session.collaborator_timeout(), verify)
        .await
        .map_err(|_| AuthError::InvalidCredential("verification timed out".to_string()))??;

    let device_id = hello
        .device_id()
        .or_else(|| credential.device_id.clone())
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

    let info = SessionInfo {
        connection_id: Uuid::new_v4(),
        device_id,
        subject: credential.subject,
        expires_at: credential.expires_at,
        protocol,
    };
    Ok((info, hello.audio_params))
}

/// Report a rejection and close the transport, ignoring write failures
async fn reject(sink: &mut dyn FrameSink, error: &AuthError) {
    tracing::warn!(kind = error.kind(), error = %error, "handshake rejected");

    if matches!(error, AuthError::ConnectionClosed) {
        return;
    }

    if let Ok(json) = ServerMessage::error(error.kind(), error.to_string()).to_json() {
        let _ = sink.send(OutboundUnit::Text(json)).await;
    }
    let _ = sink
        .send(OutboundUnit::Close {
            code: error.close_code(),
            reason: error.kind().to_string(),
        })
        .await;
}

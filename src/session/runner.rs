//! Session task: input queue, state machine and teardown

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::Instrument;

use super::context::ConversationContext;
use super::streamer::ResponseStreamer;
use super::{Gateway, Session, SessionInfo, SessionState};
use crate::demux::Demux;
use crate::error::{AuthError, Error};
use crate::protocol::{ClientMessage, Frame, FramePayload, ListenState, ServerMessage};
use crate::transport::{FrameSink, FrameSource, OutboundUnit};
use crate::voice::{EndReason, IntakeBuffer, Utterance};

/// Item in a session's input queue
#[derive(Debug)]
enum InputEvent {
    Frame(Frame),
    /// A unit the demultiplexer rejected
    Violation(Error),
}

/// Why the transport reader stopped
#[derive(Debug)]
enum ReaderExit {
    PeerClosed,
    TransportError(String),
    SessionGone,
}

/// Why the state machine stopped on its own
#[derive(Debug)]
enum DriveExit {
    InputClosed,
    IdleTimeout,
    ToleranceExceeded,
    TransportFailed(Error),
}

/// Why a session is closing
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    TransportFailed(String),
    IdleTimeout,
    AuthExpired,
    ToleranceExceeded,
    Evicted,
    Shutdown,
}

impl CloseReason {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportFailed(_) => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::AuthExpired => "credential_expired",
            Self::ToleranceExceeded => "protocol_error",
            Self::Evicted => "evicted",
            Self::Shutdown => "server_shutdown",
        }
    }

    /// Error frame and close code to send, if the peer can still hear us
    fn farewell(&self) -> Option<(Option<&'static str>, u16)> {
        match self {
            Self::PeerClosed | Self::TransportFailed(_) => None,
            Self::IdleTimeout => Some((Some("session idle for too long"), 1000)),
            Self::AuthExpired => Some((
                Some("credential expired"),
                AuthError::Expired.close_code(),
            )),
            Self::ToleranceExceeded => Some((Some("too many malformed frames"), 1008)),
            Self::Evicted => Some((None, 1008)),
            Self::Shutdown => Some((None, 1001)),
        }
    }
}

/// What the next turn is built from
#[derive(Debug)]
pub(super) enum TurnInput {
    Text(String),
    Audio(Utterance),
}

/// Result of one turn for the state machine
#[derive(Debug)]
pub(super) enum TurnOutcome {
    Completed,
    TransportFailed(Error),
}

/// State owned by the session task
pub(super) struct SessionCore {
    pub(super) info: SessionInfo,
    pub(super) gateway: Arc<Gateway>,
    pub(super) sink: Box<dyn FrameSink>,
    pub(super) streamer: ResponseStreamer,
    pub(super) context: ConversationContext,
    queue: mpsc::Receiver<InputEvent>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    intake: IntakeBuffer,
    violations: u32,
    last_frame_at: Instant,
    last_audio_at: Instant,
    turn_ended_at: Option<Instant>,
}

impl Session {
    /// Drive the session until it closes, then unregister it
    pub async fn run(self) {
        let span = tracing::info_span!(
            "session",
            connection_id = %self.info.connection_id,
            device_id = %self.info.device_id,
        );
        self.run_inner().instrument(span).await;
    }

    async fn run_inner(self) {
        let Self {
            info,
            gateway,
            sink,
            source,
            cancel,
            state,
        } = self;

        let (queue_tx, queue_rx) = mpsc::channel(gateway.session.queue_capacity.max(1));
        let (abort_tx, abort_rx) = watch::channel(0u64);
        let demux = Demux::new(info.protocol, gateway.segmentation.dtx_threshold);
        let mut reader: JoinHandle<ReaderExit> = tokio::spawn(
            read_loop(source, demux, queue_tx, abort_tx).in_current_span(),
        );

        let registry = Arc::clone(&gateway.registry);
        let auth_deadline = instant_for(info.expires_at);
        let now = Instant::now();
        let mut core = SessionCore {
            streamer: ResponseStreamer::new(
                info.device_id.clone(),
                info.protocol,
                &gateway.streaming,
                gateway.session.collaborator_timeout(),
                abort_rx,
            ),
            context: ConversationContext::new(gateway.session.context_capacity),
            intake: IntakeBuffer::new(&gateway.segmentation),
            queue: queue_rx,
            state: SessionState::Idle,
            state_tx: state,
            violations: 0,
            last_frame_at: now,
            last_audio_at: now,
            turn_ended_at: None,
            info,
            gateway,
            sink,
        };

        let reason = {
            let drive = core.drive();
            tokio::pin!(drive);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    if registry.is_draining() {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::Evicted
                    }
                }
                () = sleep_until(auth_deadline) => CloseReason::AuthExpired,
                exit = &mut reader => match exit {
                    Ok(ReaderExit::TransportError(e)) => CloseReason::TransportFailed(e),
                    Ok(ReaderExit::PeerClosed | ReaderExit::SessionGone) | Err(_) => {
                        CloseReason::PeerClosed
                    }
                },
                exit = &mut drive => match exit {
                    DriveExit::InputClosed => CloseReason::PeerClosed,
                    DriveExit::IdleTimeout => CloseReason::IdleTimeout,
                    DriveExit::ToleranceExceeded => CloseReason::ToleranceExceeded,
                    DriveExit::TransportFailed(e) => CloseReason::TransportFailed(e.to_string()),
                },
            }
        };

        reader.abort();
        core.close(reason).await;
    }
}

/// Credentials further out than this are treated as expiring at this horizon
const MAX_CREDENTIAL_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn instant_for(expires_at: chrono::DateTime<Utc>) -> Instant {
    let remaining = (expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_CREDENTIAL_WAIT);
    Instant::now() + remaining
}

async fn read_loop(
    mut source: Box<dyn FrameSource>,
    demux: Demux,
    queue: mpsc::Sender<InputEvent>,
    abort: watch::Sender<u64>,
) -> ReaderExit {
    while let Some(unit) = source.recv().await {
        let unit = match unit {
            Ok(unit) => unit,
            Err(e) => {
                tracing::warn!(error = %e, "transport read failed");
                return ReaderExit::TransportError(e.to_string());
            }
        };

        let event = match demux.classify(unit) {
            Ok(None) => continue,
            Ok(Some(frame)) => {
                if let FramePayload::Control(ClientMessage::Abort { reason }) = &frame.payload {
                    tracing::info!(reason = reason.as_deref().unwrap_or(""), "abort requested");
                    abort.send_modify(|generation| *generation = generation.wrapping_add(1));
                    continue;
                }
                InputEvent::Frame(frame)
            }
            Err(e) => InputEvent::Violation(e),
        };

        // a full queue blocks here, which stops reading from the transport
        if queue.send(event).await.is_err() {
            return ReaderExit::SessionGone;
        }
    }
    tracing::debug!("peer closed transport");
    ReaderExit::PeerClosed
}

impl SessionCore {
    pub(super) fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// Process queued frames until the session must close
    async fn drive(&mut self) -> DriveExit {
        loop {
            let deadline = match self.state {
                SessionState::Idle => Some(self.last_frame_at + self.gateway.session.idle_timeout()),
                SessionState::Listening => {
                    Some(self.last_audio_at + self.gateway.segmentation.stall_timeout())
                }
                _ => None,
            };

            let event = match deadline {
                Some(deadline) => tokio::select! {
                    event = self.queue.recv() => event,
                    () = sleep_until(deadline) => {
                        if let Some(exit) = self.on_timer().await {
                            return exit;
                        }
                        continue;
                    }
                },
                None => self.queue.recv().await,
            };

            let Some(event) = event else {
                return DriveExit::InputClosed;
            };
            self.last_frame_at = Instant::now();

            let step = match event {
                InputEvent::Violation(error) => self.on_violation(error).await,
                InputEvent::Frame(frame) => self.on_frame(frame).await,
            };
            if let Some(exit) = step {
                return exit;
            }
        }
    }

    async fn on_timer(&mut self) -> Option<DriveExit> {
        match self.state {
            SessionState::Idle => {
                tracing::info!(
                    idle_secs = self.gateway.session.idle_timeout_secs,
                    "idle timeout"
                );
                Some(DriveExit::IdleTimeout)
            }
            SessionState::Listening => {
                tracing::debug!("audio stalled, flushing utterance");
                let utterance = self.intake.finish(EndReason::Stalled);
                self.after_audio(utterance).await
            }
            _ => None,
        }
    }

    async fn on_violation(&mut self, error: Error) -> Option<DriveExit> {
        self.violations += 1;
        tracing::warn!(
            error = %error,
            violations = self.violations,
            tolerance = self.gateway.session.protocol_tolerance,
            "protocol violation"
        );

        if let Err(e) = self.send_error(&error).await {
            return Some(DriveExit::TransportFailed(e));
        }
        (self.violations > self.gateway.session.protocol_tolerance)
            .then_some(DriveExit::ToleranceExceeded)
    }

    async fn on_frame(&mut self, frame: Frame) -> Option<DriveExit> {
        match frame.payload {
            FramePayload::Audio(pcm) => self.on_audio(&pcm, frame.arrived_at).await,
            FramePayload::Control(ClientMessage::Text { text, device_id }) => {
                if let Some(claimed) = device_id.filter(|id| *id != self.info.device_id) {
                    tracing::debug!(claimed = %claimed, "text frame names another device");
                }
                self.on_text(text).await
            }
            FramePayload::Control(ClientMessage::Listen { state, mode }) => {
                tracing::debug!(?state, mode = mode.as_deref().unwrap_or(""), "listen");
                if state == ListenState::Stop && self.state == SessionState::Listening {
                    let utterance = self.intake.finish(EndReason::EndMarker);
                    return self.after_audio(utterance).await;
                }
                None
            }
            FramePayload::Control(ClientMessage::Ping) => {
                let pong = self
                    .streamer
                    .send_message(self.sink.as_mut(), &ServerMessage::Pong)
                    .await;
                pong.err().map(DriveExit::TransportFailed)
            }
            FramePayload::Control(ClientMessage::Hello(_)) => {
                self.on_violation(Error::Protocol("duplicate hello".to_string()))
                    .await
            }
            // handled by the reader; never queued
            FramePayload::Control(ClientMessage::Abort { .. }) => None,
        }
    }

    async fn on_audio(&mut self, pcm: &[u8], arrived_at: Instant) -> Option<DriveExit> {
        if self.gateway.session.echo_guard
            && self.turn_ended_at.is_some_and(|ended| arrived_at < ended)
        {
            tracing::trace!(bytes = pcm.len(), "dropping audio captured during turn");
            return None;
        }

        let utterance = self.intake.append(pcm);
        self.last_audio_at = Instant::now();
        if self.state == SessionState::Idle && (utterance.is_some() || !self.intake.is_empty()) {
            self.set_state(SessionState::Listening);
        }
        self.after_audio(utterance).await
    }

    /// Run a turn for a completed utterance, or settle back to idle
    async fn after_audio(&mut self, utterance: Option<Utterance>) -> Option<DriveExit> {
        match utterance {
            Some(utterance) => {
                tracing::info!(
                    duration_ms = utterance.duration.as_millis(),
                    reason = utterance.end_reason.as_str(),
                    "utterance complete"
                );
                self.turn(TurnInput::Audio(utterance)).await
            }
            None => {
                if self.state == SessionState::Listening && self.intake.is_empty() {
                    self.set_state(SessionState::Idle);
                }
                None
            }
        }
    }

    async fn on_text(&mut self, text: String) -> Option<DriveExit> {
        if self.state == SessionState::Listening && !self.intake.is_empty() {
            let error = Error::ConflictingInput(
                "text received while an utterance is being recorded".to_string(),
            );
            tracing::info!("text frame rejected during listening");
            return self
                .send_error(&error)
                .await
                .err()
                .map(DriveExit::TransportFailed);
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return self
                .on_violation(Error::Protocol("empty text frame".to_string()))
                .await;
        }
        // text opens a turn like audio does; with nothing buffered it is
        // processed at once
        self.set_state(SessionState::Listening);
        self.turn(TurnInput::Text(text)).await
    }

    async fn turn(&mut self, input: TurnInput) -> Option<DriveExit> {
        self.streamer.arm();
        let outcome = self.run_turn(input).await;
        self.turn_ended_at = Some(Instant::now());

        match outcome {
            TurnOutcome::Completed => {
                let now = Instant::now();
                self.last_audio_at = now;
                self.last_frame_at = now;
                let next = if self.intake.is_empty() {
                    SessionState::Idle
                } else {
                    SessionState::Listening
                };
                self.set_state(next);
                None
            }
            TurnOutcome::TransportFailed(e) => Some(DriveExit::TransportFailed(e)),
        }
    }

    /// Send an error frame for a turn-level or protocol failure
    pub(super) async fn send_error(&mut self, error: &Error) -> crate::Result<()> {
        self.streamer
            .send_message(self.sink.as_mut(), &ServerMessage::from_error(error))
            .await
    }

    /// Tear down: notify the peer if possible, release buffers, unregister
    async fn close(mut self, reason: CloseReason) {
        self.set_state(SessionState::Closing);
        tracing::info!(reason = reason.as_str(), "closing session");

        if let Some((message, code)) = reason.farewell() {
            if let Some(message) = message {
                let _ = self
                    .streamer
                    .send_message(
                        self.sink.as_mut(),
                        &ServerMessage::error(reason.as_str(), message),
                    )
                    .await;
            }
            let close = OutboundUnit::Close {
                code,
                reason: reason.as_str().to_string(),
            };
            let write_timeout = self.gateway.streaming.write_timeout();
            let _ = tokio::time::timeout(write_timeout, self.sink.send(close)).await;
        }

        self.intake.clear();
        self.context.clear();
        self.queue.close();
        self.set_state(SessionState::Closed);
        self.gateway.registry.unregister(self.info.connection_id).await;
        tracing::info!("session closed");
    }
}

//! Response streamer: writes replies back with outbound backpressure

use std::num::NonZeroU32;
use std::time::Duration;

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::watch;

use crate::config::StreamingConfig;
use crate::protocol::{AUDIO_FORMAT, ProtocolVersion, ServerMessage};
use crate::transport::{FrameSink, OutboundUnit};
use crate::voice::AudioStream;
use crate::{Error, Result};

type Pacer = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How an audio response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every synthesized chunk was delivered
    Completed { chunks: usize },
    /// The client sent `abort`
    Aborted { chunks: usize },
    /// Synthesis failed or stalled before any audio was produced
    NoAudio,
}

/// Writes text and chunked audio to one session's transport
pub struct ResponseStreamer {
    device_id: String,
    protocol: ProtocolVersion,
    chunk_bytes: usize,
    write_timeout: Duration,
    stall_timeout: Duration,
    pacer: Option<Pacer>,
    abort: watch::Receiver<u64>,
}

impl ResponseStreamer {
    /// `stall_timeout` bounds the wait for each piece of synthesized audio
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        protocol: ProtocolVersion,
        config: &StreamingConfig,
        stall_timeout: Duration,
        abort: watch::Receiver<u64>,
    ) -> Self {
        let pacer = config
            .max_chunks_per_second
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Self {
            device_id: device_id.into(),
            protocol,
            chunk_bytes: config
                .chunk_bytes
                .clamp(1, StreamingConfig::MAX_CHUNK_BYTES - 1),
            write_timeout: config.write_timeout(),
            stall_timeout,
            pacer,
            abort,
        }
    }

    /// Forget aborts received before the current turn
    pub fn arm(&mut self) {
        self.abort.mark_unchanged();
    }

    /// Write one control message
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails or exceeds the write
    /// timeout
    pub async fn send_message(
        &self,
        sink: &mut dyn FrameSink,
        message: &ServerMessage,
    ) -> Result<()> {
        let json = message.to_json()?;
        self.write(sink, OutboundUnit::Text(json)).await
    }

    /// Write a text reply
    ///
    /// # Errors
    ///
    /// Returns a transport error if the write fails
    pub async fn send_text(&self, sink: &mut dyn FrameSink, text: &str) -> Result<()> {
        let message = ServerMessage::Text {
            text: text.to_string(),
            device_id: self.device_id.clone(),
        };
        self.send_message(sink, &message).await
    }

    /// Stream synthesized audio as an `audio` announcement plus binary chunks
    ///
    /// Audio is forwarded as soon as the synthesizer yields it; only pieces
    /// larger than `chunk_bytes` are split. The announcement is sent with the
    /// first audio bytes, so a synthesizer that fails up front yields
    /// [`StreamOutcome::NoAudio`] and nothing on the wire. A mid-stream
    /// synthesis error, or no audio within the stall timeout, ends the
    /// response after the audio already delivered.
    ///
    /// # Errors
    ///
    /// Returns a transport error if a write fails; remaining audio is
    /// discarded
    pub async fn stream_audio(
        &mut self,
        sink: &mut dyn FrameSink,
        mut audio: AudioStream,
    ) -> Result<StreamOutcome> {
        let mut announced = false;
        let mut chunks = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.changed() => {
                    tracing::info!(chunks, "audio response aborted by client");
                    return Ok(StreamOutcome::Aborted { chunks });
                }
                next = tokio::time::timeout(self.stall_timeout, audio.next()) => next,
            };

            let bytes = match next {
                Ok(None) => break,
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, chunks, "synthesis stream failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        chunks,
                        stall_ms = self.stall_timeout.as_millis(),
                        "synthesis stream stalled"
                    );
                    break;
                }
            };

            for chunk in bytes.chunks(self.chunk_bytes) {
                self.send_chunk(sink, chunk, &mut announced).await?;
                chunks += 1;
            }
        }

        if announced {
            tracing::debug!(chunks, "audio response delivered");
            Ok(StreamOutcome::Completed { chunks })
        } else {
            Ok(StreamOutcome::NoAudio)
        }
    }

    async fn send_chunk(
        &self,
        sink: &mut dyn FrameSink,
        chunk: &[u8],
        announced: &mut bool,
    ) -> Result<()> {
        if !*announced {
            let announce = ServerMessage::Audio {
                format: AUDIO_FORMAT,
                device_id: self.device_id.clone(),
            };
            self.send_message(sink, &announce).await?;
            *announced = true;
        }

        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        let frame = self.protocol.wrap_audio(chunk)?;
        self.write(sink, OutboundUnit::Binary(frame)).await
    }

    async fn write(&self, sink: &mut dyn FrameSink, unit: OutboundUnit) -> Result<()> {
        match tokio::time::timeout(self.write_timeout, sink.send(unit)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "write timed out after {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }
}

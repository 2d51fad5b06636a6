//! Turn pipeline: transcription, memory triggers, dialogue and response

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::SessionState;
use super::runner::{SessionCore, TurnInput, TurnOutcome};
use super::streamer::StreamOutcome;
use crate::error::{CollaboratorFailure, CollaboratorKind};
use crate::memory::MemoryTrigger;
use crate::protocol::ServerMessage;
use crate::voice::{Utterance, pcm};
use crate::{Error, Result};

/// Await a collaborator call under `timeout`
async fn call<T, F>(
    kind: CollaboratorKind,
    timeout: Duration,
    fut: F,
) -> std::result::Result<T, CollaboratorFailure>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CollaboratorFailure::failed(kind, e.to_string())),
        Err(_) => Err(CollaboratorFailure::timed_out(kind)),
    }
}

impl SessionCore {
    /// Run one turn to completion
    pub(super) async fn run_turn(&mut self, input: TurnInput) -> TurnOutcome {
        self.set_state(SessionState::Processing);

        let text = match input {
            TurnInput::Text(text) => text,
            TurnInput::Audio(utterance) => match self.transcribe(&utterance).await {
                Ok(text) if text.is_empty() => {
                    tracing::info!("transcription produced no speech");
                    let message = ServerMessage::error("no_speech", "no speech recognized");
                    return self.report(&message).await;
                }
                Ok(text) => text,
                Err(failure) => {
                    tracing::warn!(error = %failure, "transcription failed");
                    let message = ServerMessage::from_error(&Error::from(failure));
                    return self.report(&message).await;
                }
            },
        };

        match self.gateway.classifier.classify(&text) {
            MemoryTrigger::Save(content) => self.save_memory(text, &content).await,
            MemoryTrigger::Recall(query) => {
                let (memory, recalled) = self.recall_memory(&query).await;
                self.converse(text, memory.as_deref(), recalled).await
            }
            MemoryTrigger::None => self.converse(text, None, false).await,
        }
    }

    async fn transcribe(
        &mut self,
        utterance: &Utterance,
    ) -> std::result::Result<String, CollaboratorFailure> {
        let kind = CollaboratorKind::Transcription;
        let wav = pcm::pcm16_to_wav(&utterance.pcm, self.gateway.segmentation.sample_rate)
            .map_err(|e| CollaboratorFailure::failed(kind, e.to_string()))?;
        let transcriber = Arc::clone(&self.gateway.collaborators.transcriber);

        let text = call(
            kind,
            self.gateway.session.collaborator_timeout(),
            transcriber.transcribe(&wav),
        )
        .await?;
        tracing::info!(chars = text.chars().count(), "transcribed utterance");
        Ok(text.trim().to_string())
    }

    async fn save_memory(&mut self, text: String, content: &str) -> TurnOutcome {
        let saved = match self.gateway.collaborators.memory.clone() {
            Some(store) => {
                let result = call(
                    CollaboratorKind::Memory,
                    self.gateway.session.collaborator_timeout(),
                    store.save(&self.info.device_id, content),
                )
                .await;
                if let Err(failure) = &result {
                    tracing::warn!(error = %failure, "memory save failed");
                }
                result.is_ok()
            }
            None => false,
        };

        let reply = if saved {
            tracing::info!(chars = content.chars().count(), "memory saved");
            self.gateway.session.save_confirmation.clone()
        } else {
            self.gateway.session.save_apology.clone()
        };

        self.context.push(text, reply.clone());
        self.respond(&reply).await
    }

    /// Look up memory for this turn; failures degrade to no memory
    async fn recall_memory(&mut self, query: &str) -> (Option<String>, bool) {
        let Some(store) = self.gateway.collaborators.memory.clone() else {
            return (None, false);
        };

        match call(
            CollaboratorKind::Memory,
            self.gateway.session.collaborator_timeout(),
            store.recall(&self.info.device_id, query),
        )
        .await
        {
            Ok(memory) => {
                tracing::debug!(found = memory.is_some(), "memory recalled");
                (memory, true)
            }
            Err(failure) => {
                tracing::warn!(error = %failure, "memory recall failed, continuing without");
                (None, false)
            }
        }
    }

    async fn converse(
        &mut self,
        text: String,
        memory: Option<&str>,
        after_memory: bool,
    ) -> TurnOutcome {
        let dialogue = Arc::clone(&self.gateway.collaborators.dialogue);
        let timeout = self.gateway.session.collaborator_timeout();

        let result = call(
            CollaboratorKind::Dialogue,
            timeout,
            dialogue.generate(self.context.history(), memory, &text),
        )
        .await;

        match result {
            Ok(reply) => {
                self.context.push(text, reply.clone());
                self.respond(&reply).await
            }
            Err(failure) => {
                tracing::warn!(error = %failure, "dialogue failed");
                if after_memory {
                    self.context.push(text, String::new());
                }
                let message = ServerMessage::from_error(&Error::from(failure));
                self.report(&message).await
            }
        }
    }

    /// Deliver the reply as text followed by synthesized audio
    async fn respond(&mut self, reply: &str) -> TurnOutcome {
        self.set_state(SessionState::Responding);

        if let Err(e) = self.streamer.send_text(self.sink.as_mut(), reply).await {
            return TurnOutcome::TransportFailed(e);
        }

        let synthesizer = Arc::clone(&self.gateway.collaborators.synthesizer);
        let audio = match call(
            CollaboratorKind::Synthesis,
            self.gateway.session.collaborator_timeout(),
            synthesizer.synthesize(reply),
        )
        .await
        {
            Ok(audio) => audio,
            Err(failure) => {
                tracing::warn!(error = %failure, "synthesis failed, reply delivered as text");
                return TurnOutcome::Completed;
            }
        };

        match self.streamer.stream_audio(self.sink.as_mut(), audio).await {
            Ok(StreamOutcome::NoAudio) => {
                tracing::warn!("synthesis produced no audio, reply delivered as text");
                TurnOutcome::Completed
            }
            Ok(outcome) => {
                tracing::debug!(?outcome, "response finished");
                TurnOutcome::Completed
            }
            Err(e) => TurnOutcome::TransportFailed(e),
        }
    }

    /// Send a turn-level error frame
    async fn report(&mut self, message: &ServerMessage) -> TurnOutcome {
        match self.streamer.send_message(self.sink.as_mut(), message).await {
            Ok(()) => TurnOutcome::Completed,
            Err(e) => TurnOutcome::TransportFailed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_maps_errors_and_timeouts() {
        let timeout = Duration::from_millis(50);

        let ok = call(CollaboratorKind::Dialogue, timeout, async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let failed: std::result::Result<(), _> = call(CollaboratorKind::Memory, timeout, async {
            Err(Error::Memory("down".to_string()))
        })
        .await;
        let failure = failed.unwrap_err();
        assert_eq!(failure.kind, CollaboratorKind::Memory);
        assert!(failure.to_string().contains("down"));

        let slow: std::result::Result<(), _> = call(CollaboratorKind::Synthesis, timeout, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            slow.unwrap_err(),
            CollaboratorFailure::timed_out(CollaboratorKind::Synthesis)
        );
    }
}

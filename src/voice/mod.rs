//! Voice processing module
//!
//! PCM helpers, utterance segmentation, and the speech collaborators.

pub mod intake;
pub mod pcm;
mod stt;
mod tts;

pub use intake::{EndReason, IntakeBuffer, Utterance};
pub use stt::{Transcriber, WhisperTranscriber};
pub use tts::{AudioStream, OpenAiSynthesizer, Synthesizer};

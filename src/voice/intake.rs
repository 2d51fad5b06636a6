//! Audio intake buffer: segments streamed PCM16 into utterances

use std::time::Duration;

use super::pcm;
use crate::config::SegmentationConfig;

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Trailing silence reached the threshold
    Silence,
    /// Buffer reached the maximum utterance length
    MaxDuration,
    /// Client sent an explicit end marker
    EndMarker,
    /// Audio stopped arriving mid-utterance
    Stalled,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::MaxDuration => "max_duration",
            Self::EndMarker => "end_marker",
            Self::Stalled => "stalled",
        }
    }
}

/// Contiguous speech handed to one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub pcm: Vec<u8>,
    pub duration: Duration,
    pub end_reason: EndReason,
}

/// Accumulates audio chunks and cuts them into utterances
///
/// Leading silence is never buffered. The buffer never holds more than the
/// max-duration byte bound: a chunk that would cross it is split, the head
/// completes a forced utterance and the remainder starts the next one.
#[derive(Debug)]
pub struct IntakeBuffer {
    sample_rate: u32,
    energy_threshold: f32,
    silence_threshold: Duration,
    min_speech: Duration,
    max_bytes: usize,
    buffer: Vec<u8>,
    trailing_silence: Duration,
    voiced: Duration,
}

impl IntakeBuffer {
    /// Create a buffer with the given segmentation policy
    #[must_use]
    pub fn new(config: &SegmentationConfig) -> Self {
        let max_bytes = pcm::bytes_for(config.max_utterance(), config.sample_rate)
            .max(pcm::BYTES_PER_SAMPLE);
        Self {
            sample_rate: config.sample_rate,
            energy_threshold: config.energy_threshold,
            silence_threshold: config.silence_threshold(),
            min_speech: config.min_speech(),
            max_bytes,
            buffer: Vec::new(),
            trailing_silence: Duration::ZERO,
            voiced: Duration::ZERO,
        }
    }

    /// Append a chunk, classifying voice activity by RMS energy
    pub fn append(&mut self, chunk: &[u8]) -> Option<Utterance> {
        let voiced = pcm::rms_energy(chunk) > self.energy_threshold;
        self.append_with_activity(chunk, voiced)
    }

    /// Append a chunk with an externally supplied voice-activity flag
    pub fn append_with_activity(&mut self, chunk: &[u8], voiced: bool) -> Option<Utterance> {
        if chunk.is_empty() || (self.buffer.is_empty() && !voiced) {
            return None;
        }

        let space = self.max_bytes - self.buffer.len();
        if chunk.len() < space {
            self.push(chunk, voiced);
            if self.trailing_silence >= self.silence_threshold {
                return self.take(EndReason::Silence);
            }
            return None;
        }

        let (head, rest) = chunk.split_at(space);
        self.push(head, voiced);
        let forced = self.take(EndReason::MaxDuration);

        if voiced && !rest.is_empty() {
            let keep = rest.len().min(self.max_bytes - pcm::BYTES_PER_SAMPLE);
            if keep < rest.len() {
                tracing::warn!(
                    dropped_bytes = rest.len() - keep,
                    "audio chunk larger than max utterance, truncating"
                );
            }
            self.push(&rest[..keep], voiced);
        }

        forced
    }

    /// Close the current utterance early (end marker or stalled stream)
    pub fn finish(&mut self, reason: EndReason) -> Option<Utterance> {
        if self.buffer.is_empty() {
            return None;
        }
        self.take(reason)
    }

    /// Drop any buffered audio
    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.trailing_silence = Duration::ZERO;
        self.voiced = Duration::ZERO;
    }

    /// Whether speech is currently being collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Upper bound on buffered bytes
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn push(&mut self, bytes: &[u8], voiced: bool) {
        let duration = pcm::duration_of(bytes.len(), self.sample_rate);
        self.buffer.extend_from_slice(bytes);
        if voiced {
            self.voiced += duration;
            self.trailing_silence = Duration::ZERO;
        } else {
            self.trailing_silence += duration;
        }
    }

    fn take(&mut self, end_reason: EndReason) -> Option<Utterance> {
        let pcm = std::mem::take(&mut self.buffer);
        let voiced = std::mem::take(&mut self.voiced);
        self.trailing_silence = Duration::ZERO;

        if voiced < self.min_speech {
            tracing::debug!(
                voiced_ms = voiced.as_millis(),
                reason = end_reason.as_str(),
                "discarding utterance below minimum speech"
            );
            return None;
        }

        Some(Utterance {
            duration: pcm::duration_of(pcm.len(), self.sample_rate),
            pcm,
            end_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmentationConfig {
        SegmentationConfig {
            sample_rate: 16_000,
            energy_threshold: 0.02,
            silence_ms: 1_000,
            max_utterance_ms: 2_000,
            min_speech_ms: 300,
            stall_ms: 2_000,
            dtx_threshold: 12,
        }
    }

    /// 100ms of PCM16 at 16kHz
    fn chunk(amplitude: i16) -> Vec<u8> {
        (0..1_600)
            .flat_map(|i| (if i % 2 == 0 { amplitude } else { -amplitude }).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_leading_silence_not_buffered() {
        let mut intake = IntakeBuffer::new(&config());
        for _ in 0..30 {
            assert!(intake.append(&chunk(0)).is_none());
        }
        assert!(intake.is_empty());
    }

    #[test]
    fn test_silence_ends_utterance() {
        let mut intake = IntakeBuffer::new(&config());
        for _ in 0..5 {
            assert!(intake.append(&chunk(8_000)).is_none());
        }
        for _ in 0..9 {
            assert!(intake.append(&chunk(0)).is_none());
        }
        let utterance = intake.append(&chunk(0)).unwrap();
        assert_eq!(utterance.end_reason, EndReason::Silence);
        assert_eq!(utterance.duration, Duration::from_millis(1_500));
        assert!(intake.is_empty());
    }

    #[test]
    fn test_forced_cut_never_exceeds_bound() {
        let mut intake = IntakeBuffer::new(&config());
        let mut forced = Vec::new();
        for _ in 0..45 {
            if let Some(u) = intake.append(&chunk(8_000)) {
                forced.push(u);
            }
            assert!(intake.len() < intake.max_bytes());
        }
        assert_eq!(forced.len(), 2);
        for u in &forced {
            assert_eq!(u.end_reason, EndReason::MaxDuration);
            assert_eq!(u.pcm.len(), intake.max_bytes());
        }
        assert_eq!(intake.len(), 5 * 3_200);
    }

    #[test]
    fn test_oversized_chunk_split() {
        let mut intake = IntakeBuffer::new(&config());
        let big: Vec<u8> = (0..25).flat_map(|_| chunk(8_000)).collect();
        let utterance = intake.append(&big).unwrap();
        assert_eq!(utterance.pcm.len(), intake.max_bytes());
        assert_eq!(intake.len(), 5 * 3_200);
    }

    #[test]
    fn test_short_blip_discarded() {
        let mut intake = IntakeBuffer::new(&config());
        intake.append(&chunk(8_000));
        assert!(!intake.is_empty());
        assert!(intake.finish(EndReason::EndMarker).is_none());
        assert!(intake.is_empty());
    }

    #[test]
    fn test_external_activity_flag() {
        let mut intake = IntakeBuffer::new(&config());
        for _ in 0..4 {
            intake.append_with_activity(&chunk(0), true);
        }
        let utterance = intake.finish(EndReason::Stalled).unwrap();
        assert_eq!(utterance.end_reason, EndReason::Stalled);
        assert_eq!(utterance.duration, Duration::from_millis(400));
    }
}

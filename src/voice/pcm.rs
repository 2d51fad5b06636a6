//! 16-bit little-endian mono PCM helpers

use std::time::Duration;

use crate::{Error, Result};

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Iterate samples normalized to [-1.0, 1.0]
///
/// A trailing odd byte is ignored.
pub fn samples(pcm: &[u8]) -> impl Iterator<Item = f32> + '_ {
    pcm.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
}

/// Root-mean-square energy of a PCM16 chunk, 0.0 for empty input
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(pcm: &[u8]) -> f32 {
    let count = pcm.len() / BYTES_PER_SAMPLE;
    if count == 0 {
        return 0.0;
    }

    let sum_squares: f32 = samples(pcm).map(|s| s * s).sum();
    (sum_squares / count as f32).sqrt()
}

/// Playback duration of `bytes` of PCM16 at `sample_rate`
#[must_use]
pub fn duration_of(bytes: usize, sample_rate: u32) -> Duration {
    let samples = (bytes / BYTES_PER_SAMPLE) as u64;
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
}

/// Byte length of `duration` of PCM16 at `sample_rate`, always sample aligned
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn bytes_for(duration: Duration, sample_rate: u32) -> usize {
    let samples = duration.as_micros() * u128::from(sample_rate) / 1_000_000;
    (samples as usize).saturating_mul(BYTES_PER_SAMPLE)
}

/// Wrap PCM16 bytes in a WAV container for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in pcm.chunks_exact(BYTES_PER_SAMPLE) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples: usize, amplitude: i16) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let s = if i % 2 == 0 { amplitude } else { -amplitude };
                s.to_le_bytes()
            })
            .collect()
    }

    #[test]
    fn test_energy_calculation() {
        assert!(rms_energy(&tone(100, 0)).abs() < f32::EPSILON);
        assert!(rms_energy(&tone(100, 16384)) > 0.4);
        assert!(rms_energy(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_duration_and_bytes_agree() {
        assert_eq!(bytes_for(Duration::from_secs(1), 16_000), 32_000);
        assert_eq!(duration_of(32_000, 16_000), Duration::from_secs(1));
        assert_eq!(bytes_for(Duration::from_millis(1), 11_025) % 2, 0);
    }

    #[test]
    fn test_wav_header() {
        let wav = pcm16_to_wav(&tone(160, 1000), 16_000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
    }
}

//! PCM audio helpers
//!
//! Devices stream 16-bit mono little-endian PCM; providers mostly want WAV.

use std::io::Cursor;

use crate::Result;

/// Convert raw little-endian PCM bytes to i16 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Convert i16 samples to little-endian PCM bytes
#[must_use]
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// RMS energy of a PCM frame
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// Wrap raw PCM in a standard mono 16-bit WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| crate::Error::Audio(e.to_string()))?;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| crate::Error::Audio(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| crate::Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Duration in milliseconds of a PCM byte length at the given sample rate
#[must_use]
pub const fn pcm_duration_ms(byte_len: usize, sample_rate: u32) -> u64 {
    (byte_len as u64 / 2) * 1000 / sample_rate as u64
}

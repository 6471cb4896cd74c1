//! WAV encoding for training uploads and debugging captures

use super::frame::SAMPLE_RATE;
use crate::{Error, Result};

/// Encode 16kHz mono int16 samples as WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::ResourceExhausted(format!("wav writer: {e}")))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::ResourceExhausted(format!("wav write: {e}")))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::ResourceExhausted(format!("wav finalize: {e}")))?;
    }

    Ok(cursor.into_inner())
}

/// Decode WAV bytes into int16 samples, requiring the pipeline format
///
/// # Errors
///
/// Returns `Error::InvalidInput` for anything other than 16kHz mono 16-bit PCM
pub fn wav_to_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::InvalidInput(format!("wav: {e}")))?;

    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(Error::InvalidInput(format!(
            "wav must be 16kHz mono 16-bit, got {}Hz {}ch {}-bit",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        )));
    }

    reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidInput(format!("wav sample: {e}")))
}

//! Training sample upload

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::audio::samples_to_wav;
use crate::{Error, Result};

/// Server-requested training window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingMode {
    pub remaining: u32,
    pub duration_ms: u32,
    pub label: Option<String>,
}

/// Encode PCM as base64 WAV split into pieces of at most `chunk_bytes`
///
/// # Errors
///
/// Returns `Error::InvalidInput` for an empty sample or a zero chunk size,
/// or the WAV encoder's error
pub fn encode_chunks(samples: &[i16], chunk_bytes: usize) -> Result<Vec<String>> {
    if samples.is_empty() {
        return Err(Error::InvalidInput("training sample is empty".to_string()));
    }
    if chunk_bytes == 0 {
        return Err(Error::InvalidInput(
            "training chunk size must be non-zero".to_string(),
        ));
    }

    let wav = samples_to_wav(samples)?;
    let encoded = BASE64.encode(wav);

    // base64 output is ASCII so byte chunks are valid strings
    Ok(encoded
        .as_bytes()
        .chunks(chunk_bytes)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect())
}

//! Fixed-size PCM frames

use std::fmt;

use crate::{Error, Result};

/// Pipeline sample rate (16kHz speech)
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per 20ms frame
pub const FRAME_SAMPLES: usize = 320;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: u32 = 20;

/// Payload bytes per frame (int16 mono)
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// One 20ms frame of 16-bit mono PCM
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    samples: [i16; FRAME_SAMPLES],
}

impl Frame {
    /// An all-zero frame
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            samples: [0; FRAME_SAMPLES],
        }
    }

    /// Build a frame from exactly [`FRAME_SAMPLES`] samples
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the slice length is wrong
    pub fn from_slice(samples: &[i16]) -> Result<Self> {
        let samples: [i16; FRAME_SAMPLES] = samples.try_into().map_err(|_| {
            Error::InvalidInput(format!(
                "frame needs {FRAME_SAMPLES} samples, got {}",
                samples.len()
            ))
        })?;
        Ok(Self { samples })
    }

    /// Decode a frame from little-endian int16 bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` unless exactly [`FRAME_BYTES`] bytes are given
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FRAME_BYTES {
            return Err(Error::InvalidInput(format!(
                "frame needs {FRAME_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut frame = Self::silent();
        for (dst, pair) in frame.samples.iter_mut().zip(bytes.chunks_exact(2)) {
            *dst = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Ok(frame)
    }

    #[must_use]
    pub const fn samples(&self) -> &[i16; FRAME_SAMPLES] {
        &self.samples
    }

    pub const fn samples_mut(&mut self) -> &mut [i16; FRAME_SAMPLES] {
        &mut self.samples
    }

    /// Peak absolute amplitude, saturated to 32767
    #[must_use]
    pub fn max_amplitude(&self) -> u16 {
        max_amplitude(&self.samples)
    }

    /// Root-mean-square level on the int16 scale
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Multiply every sample by `gain`, clipping to the int16 range
    pub fn apply_gain(&mut self, gain: f32) {
        scale_samples(&mut self.samples, gain);
    }

    /// Write the samples as little-endian bytes into `out`
    ///
    /// Returns the number of bytes written ([`FRAME_BYTES`]) or 0 if `out`
    /// is too small.
    pub fn write_le_bytes(&self, out: &mut [u8]) -> usize {
        if out.len() < FRAME_BYTES {
            return 0;
        }
        for (pair, s) in out.chunks_exact_mut(2).zip(self.samples.iter()) {
            pair.copy_from_slice(&s.to_le_bytes());
        }
        FRAME_BYTES
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("max_amplitude", &self.max_amplitude())
            .field("rms", &self.rms())
            .finish()
    }
}

/// Peak absolute amplitude, saturated to 32767
#[must_use]
pub fn max_amplitude(samples: &[i16]) -> u16 {
    samples
        .iter()
        .map(|s| s.unsigned_abs().min(32767))
        .max()
        .unwrap_or(0)
}

/// RMS level on the int16 scale
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
#[must_use]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Scale samples in place with int16 clipping
#[allow(clippy::cast_possible_truncation)]
pub fn scale_samples(samples: &mut [i16], factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        *s = (f32::from(*s) * factor).clamp(-32768.0, 32767.0) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_length_checked() {
        assert!(Frame::from_slice(&[0; FRAME_SAMPLES]).is_ok());
        assert!(matches!(
            Frame::from_slice(&[0; 100]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_max_amplitude_saturates() {
        let mut frame = Frame::silent();
        frame.samples_mut()[3] = i16::MIN;
        assert_eq!(frame.max_amplitude(), 32767);
    }

    #[test]
    fn test_rms_of_constant() {
        let frame = Frame::from_slice(&[-1000; FRAME_SAMPLES]).unwrap();
        assert!((frame.rms() - 1000.0).abs() < 0.01);
        assert!(Frame::silent().rms() < f32::EPSILON);
    }

    #[test]
    fn test_gain_clips() {
        let mut frame = Frame::from_slice(&[20_000; FRAME_SAMPLES]).unwrap();
        frame.apply_gain(2.0);
        assert!(frame.samples().iter().all(|&s| s == 32767));

        let mut frame = Frame::from_slice(&[1000; FRAME_SAMPLES]).unwrap();
        frame.apply_gain(0.5);
        assert!(frame.samples().iter().all(|&s| s == 500));
    }

    #[test]
    fn test_le_bytes() {
        let mut frame = Frame::silent();
        frame.samples_mut()[0] = 0x1234;
        frame.samples_mut()[1] = -2;
        let mut out = [0u8; FRAME_BYTES];
        assert_eq!(frame.write_le_bytes(&mut out), FRAME_BYTES);
        assert_eq!(&out[..4], &[0x34, 0x12, 0xFE, 0xFF]);
        assert_eq!(Frame::from_le_bytes(&out).unwrap(), frame);
        assert_eq!(frame.write_le_bytes(&mut [0u8; 10]), 0);
    }
}

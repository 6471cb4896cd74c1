//! Time-domain spectral features
//!
//! No FFT is performed. Zero-crossing rate, a low-band energy ratio and a
//! rolloff estimate from the first-difference energy are cheap enough to
//! run on every frame well inside the audio budget.

use crate::config::VadConfig;

/// Spectral features of one frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpectralFeatures {
    /// Sign changes across the frame
    pub zero_crossing_rate: u16,
    /// Energy in the first third of the frame over total energy
    pub low_freq_energy_ratio: f32,
    /// Dominant frequency estimate as a fraction of Nyquist
    pub spectral_rolloff: f32,
}

impl SpectralFeatures {
    /// Whether the features look like speech under `config`
    #[must_use]
    pub fn is_speech_like(&self, config: &VadConfig) -> bool {
        (config.zcr_min..=config.zcr_max).contains(&self.zero_crossing_rate)
            && self.low_freq_energy_ratio >= config.low_freq_ratio_threshold
            && self.spectral_rolloff <= config.spectral_rolloff_threshold
    }
}

/// Compute spectral features for a block of samples
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn analyze(samples: &[i16]) -> SpectralFeatures {
    if samples.len() < 2 {
        return SpectralFeatures::default();
    }

    let mut crossings: u32 = 0;
    let mut total = 0.0f64;
    let mut low = 0.0f64;
    let mut diff_energy = 0.0f64;
    let third = samples.len() / 3;

    for (i, &s) in samples.iter().enumerate() {
        let v = f64::from(s);
        let e = v * v;
        total += e;
        if i < third {
            low += e;
        }
        if i > 0 {
            let prev = samples[i - 1];
            if (prev >= 0) != (s >= 0) {
                crossings += 1;
            }
            let d = v - f64::from(prev);
            diff_energy += d * d;
        }
    }

    if total <= 0.0 {
        return SpectralFeatures {
            zero_crossing_rate: crossings.min(u32::from(u16::MAX)) as u16,
            ..SpectralFeatures::default()
        };
    }

    // For a sinusoid at normalized frequency f, E[diff^2] / (4 E[x^2]) = sin^2(pi f)
    let ratio = (diff_energy / (4.0 * total)).clamp(0.0, 1.0);
    let nyquist_fraction = 2.0 * ratio.sqrt().asin() / std::f64::consts::PI;

    SpectralFeatures {
        zero_crossing_rate: crossings.min(u32::from(u16::MAX)) as u16,
        low_freq_energy_ratio: (low / total) as f32,
        spectral_rolloff: nyquist_fraction.clamp(0.0, 1.0) as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amplitude: f64) -> Vec<i16> {
        (0..320)
            .map(|i| {
                let t = f64::from(i) / 16_000.0;
                (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_silence_has_no_features() {
        let features = analyze(&[0; 320]);
        assert_eq!(features.zero_crossing_rate, 0);
        assert!(features.low_freq_energy_ratio.abs() < f32::EPSILON);
    }

    #[test]
    fn test_zcr_counts_sign_changes() {
        // 400 Hz over 20ms is 8 cycles, so about 16 crossings
        let features = analyze(&sine(400.0, 5000.0));
        assert!((14..=17).contains(&features.zero_crossing_rate));
    }

    #[test]
    fn test_rolloff_tracks_frequency() {
        let low = analyze(&sine(500.0, 5000.0));
        let high = analyze(&sine(6000.0, 5000.0));
        // 500 Hz is 1/16 of Nyquist, 6 kHz is 3/4
        assert!((low.spectral_rolloff - 0.0625).abs() < 0.02);
        assert!((high.spectral_rolloff - 0.75).abs() < 0.05);
    }

    #[test]
    fn test_low_band_ratio_front_loaded() {
        let mut samples = [0i16; 320];
        for s in samples.iter_mut().take(100) {
            *s = 3000;
        }
        let features = analyze(&samples);
        assert!((features.low_freq_energy_ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_speech_like_bounds() {
        let config = VadConfig::default();
        let features = SpectralFeatures {
            zero_crossing_rate: 40,
            low_freq_energy_ratio: 0.5,
            spectral_rolloff: 0.2,
        };
        assert!(features.is_speech_like(&config));

        let noisy = SpectralFeatures {
            zero_crossing_rate: 250,
            ..features
        };
        assert!(!noisy.is_speech_like(&config));
    }
}

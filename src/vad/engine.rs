//! Layered voice activity detection
//!
//! Per-frame decision in four layers:
//!
//! 1. Energy: peak amplitude against an adaptive threshold derived from an
//!    EMA noise floor
//! 2. Context: the threshold is scaled for the current conversation context
//!    and raised further while TTS audio is playing
//! 3. Spectral: zero-crossing rate, low-band ratio and rolloff
//! 4. Consistency: majority vote over the last K frames
//!
//! In listening and speaking contexts a confident energy decision skips
//! layers 3 and 4.

use std::time::Instant;

use serde::Serialize;

use super::consistency::ConsistencyWindow;
use super::spectral;
use crate::audio::{FRAME_DURATION_MS, FRAME_SAMPLES, Frame, max_amplitude, rms};
use crate::config::{ProcessingMode, VadConfig};
use crate::{Error, Result};

/// Confidence contributed by the energy layer
const ENERGY_WEIGHT: f32 = 0.6;

/// Confidence contributed by the spectral layer
const SPECTRAL_WEIGHT: f32 = 0.4;

/// TTS level above which echo suppression engages
const ECHO_LEVEL_THRESHOLD: f32 = 0.1;

/// Extra amplitude margin required while suppressing echo
const ECHO_AMPLITUDE_MARGIN: f32 = 1.3;

/// Initial noise floor as a fraction of the base threshold
const INITIAL_NOISE_FRACTION: f32 = 0.3;

/// Conversation context driving detector sensitivity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationContext {
    #[default]
    Idle,
    Listening,
    Speaking,
    Processing,
}

impl ConversationContext {
    /// Contexts where the fast path may bypass spectral and consistency layers
    #[must_use]
    pub const fn is_active_conversation(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }
}

/// Per-frame detection record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DetectionResult {
    pub voice_active: bool,
    pub speech_started: bool,
    pub speech_ended: bool,
    /// Raw energy-layer decision before voting
    pub energy_detected: bool,
    pub high_confidence: bool,
    pub noise_floor_updated: bool,
    pub spectral_valid: bool,
    pub adaptive_active: bool,
    pub echo_suppression_active: bool,
    pub max_amplitude: u16,
    pub rms: f32,
    pub zero_crossing_rate: u16,
    pub low_freq_energy_ratio: f32,
    pub spectral_rolloff: f32,
    pub noise_floor: u16,
    pub snr_db: f32,
    /// Composite confidence in [0, 1]
    pub confidence: f32,
    /// Confidence scaled to 0..=255
    pub quality: u8,
    pub frame_count: u32,
    pub context: ConversationContext,
    /// Context-adapted amplitude threshold used for this frame
    pub threshold: u16,
    pub voice_duration_ms: u32,
    pub silence_duration_ms: u32,
    /// Inside a speech segment; cleared on the frame it ends or is discarded
    pub in_segment: bool,
}

/// Detector counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct VadStats {
    pub frames_processed: u64,
    pub voice_frames: u64,
    pub detection_count: u64,
    pub faults: u64,
    pub avg_processing_us: f64,
    pub max_processing_us: u64,
    pub avg_confidence: f64,
    pub min_noise_floor: u16,
    pub max_noise_floor: u16,
    pub current_noise_floor: u16,
    pub adaptations: u64,
}

/// Layered, context-aware voice activity detector
pub struct VadEngine {
    config: VadConfig,
    base_threshold: u16,
    confidence_threshold: f32,
    context: ConversationContext,
    tts_level: f32,
    noise_floor: f32,
    warmup_frames: u32,
    prev_voice: bool,
    in_segment: bool,
    segment_voice_frames: u32,
    silence_frames: u32,
    frame_count: u32,
    window: ConsistencyWindow,
    stats: VadStats,
}

impl VadEngine {
    /// Create a detector
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the threshold is zero or the noise
    /// floor smoothing factor is outside 0.01 to 0.10
    pub fn new(config: VadConfig) -> Result<Self> {
        if config.amplitude_threshold == 0 {
            return Err(Error::InvalidInput(
                "amplitude threshold must be non-zero".to_string(),
            ));
        }
        if !(0.01..=0.10).contains(&config.noise_floor_alpha) {
            return Err(Error::InvalidInput(format!(
                "noise floor alpha {} outside 0.01..=0.10",
                config.noise_floor_alpha
            )));
        }

        tracing::debug!(
            threshold = config.amplitude_threshold,
            silence_ms = config.silence_threshold_ms,
            mode = ?config.processing_mode,
            "vad engine initialized"
        );

        Ok(Self {
            base_threshold: config.amplitude_threshold,
            confidence_threshold: config.confidence_threshold,
            context: ConversationContext::Idle,
            tts_level: 0.0,
            noise_floor: f32::from(config.amplitude_threshold) * INITIAL_NOISE_FRACTION,
            warmup_frames: 0,
            prev_voice: false,
            in_segment: false,
            segment_voice_frames: 0,
            silence_frames: 0,
            frame_count: 0,
            window: ConsistencyWindow::new(config.consistency_frames),
            stats: VadStats::default(),
            config,
        })
    }

    /// Classify one frame
    pub fn process(&mut self, frame: &Frame) -> DetectionResult {
        self.process_samples(frame.samples())
    }

    /// Classify one block of samples
    ///
    /// Anything other than a full frame yields a zero-confidence result
    /// with quality 0 and counts as a fault.
    pub fn process_samples(&mut self, samples: &[i16]) -> DetectionResult {
        let started_at = Instant::now();

        if samples.len() != FRAME_SAMPLES {
            return self.fault_result("frame length");
        }

        self.frame_count = self.frame_count.wrapping_add(1);
        let max_amp = max_amplitude(samples);
        let level = rms(samples);
        if !level.is_finite() || !self.tts_level.is_finite() {
            return self.fault_result("non-finite level");
        }

        let features = self.config.features;
        let mut result = DetectionResult {
            frame_count: self.frame_count,
            context: self.context,
            max_amplitude: max_amp,
            rms: level,
            ..DetectionResult::default()
        };

        // Layer 1: energy with adaptive noise floor
        let base = f32::from(self.base_threshold);
        let threshold = if features.adaptive {
            if !self.prev_voice {
                self.update_noise_floor(level);
                result.noise_floor_updated = true;
            }
            let derived = self.noise_floor * 10f32.powf(self.config.snr_threshold_db / 20.0);
            derived.max(base / 4.0)
        } else {
            base
        };
        result.adaptive_active = features.adaptive && self.noise_floor > 0.0;
        result.snr_db = if features.snr {
            20.0 * ((level + 1.0) / (self.noise_floor + 1.0)).log10()
        } else {
            0.0
        };

        // Layer 2: conversation context
        let adapted = (threshold * self.context_multiplier()).min(32767.0);
        result.threshold = to_u16(adapted);
        result.noise_floor = to_u16(self.noise_floor);
        result.echo_suppression_active = features.conversation_aware
            && self.context == ConversationContext::Speaking
            && self.tts_level > ECHO_LEVEL_THRESHOLD;

        let amplitude = f32::from(max_amp);
        let mut energy = amplitude > adapted;
        if result.echo_suppression_active && energy {
            energy = amplitude > adapted * ECHO_AMPLITUDE_MARGIN;
        }
        result.energy_detected = energy;

        // Layer 3: spectral
        let fast_context = features.conversation_aware
            && self.config.processing_mode != ProcessingMode::Full
            && self.context.is_active_conversation();
        let run_spectral = features.spectral
            && self.config.processing_mode != ProcessingMode::Minimal
            && !fast_context;

        let spectrum = spectral::analyze(samples);
        result.zero_crossing_rate = spectrum.zero_crossing_rate;
        result.low_freq_energy_ratio = spectrum.low_freq_energy_ratio;
        result.spectral_rolloff = spectrum.spectral_rolloff;
        result.spectral_valid = run_spectral && spectrum.zero_crossing_rate > 0;
        let spectral_voice = run_spectral && spectrum.is_speech_like(&self.config);

        let mut frame_confidence = 0.0;
        if energy {
            frame_confidence += ENERGY_WEIGHT;
        }
        if spectral_voice {
            frame_confidence += SPECTRAL_WEIGHT;
        }

        // Layer 4: consistency, unless the fast path trusts energy alone
        let voice = if fast_context && energy && frame_confidence > 0.5 {
            result.confidence = frame_confidence;
            result.high_confidence = frame_confidence >= 0.6;
            true
        } else if features.consistency {
            let vote = self.window.push(
                energy || spectral_voice,
                frame_confidence,
                self.confidence_threshold,
            );
            result.confidence = vote.average_confidence;
            result.high_confidence = vote.average_confidence >= 0.8;
            vote.voice
        } else {
            result.confidence = frame_confidence;
            result.high_confidence = frame_confidence >= 0.8;
            energy || spectral_voice
        };
        result.confidence = result.confidence.clamp(0.0, 1.0);
        result.quality = quality(result.confidence);

        self.track_edges(voice, &mut result);
        self.record_stats(&result, started_at);

        tracing::trace!(
            frame = self.frame_count,
            voice,
            max_amp,
            threshold = result.threshold,
            confidence = result.confidence,
            "vad frame"
        );

        result
    }

    fn update_noise_floor(&mut self, level: f32) {
        let warmup_len = self.config.adaptation_window_ms / FRAME_DURATION_MS;
        // Within the adaptation window the floor is the running mean
        #[allow(clippy::cast_precision_loss)]
        let alpha = if self.warmup_frames < warmup_len {
            self.warmup_frames += 1;
            1.0 / self.warmup_frames as f32
        } else {
            self.config.noise_floor_alpha
        };
        self.noise_floor = alpha.mul_add(level, (1.0 - alpha) * self.noise_floor);
        self.stats.adaptations += 1;
    }

    fn context_multiplier(&self) -> f32 {
        if !self.config.features.conversation_aware {
            return 1.0;
        }

        match self.context {
            ConversationContext::Idle => self.config.idle_multiplier,
            ConversationContext::Listening => self.config.listening_multiplier,
            ConversationContext::Processing => self.config.processing_multiplier,
            ConversationContext::Speaking => {
                let mut multiplier = self.config.speaking_multiplier;
                if self.tts_level > 0.0 {
                    let echo_reduction = 10f32.powf(-self.config.echo_suppression_db / 20.0);
                    multiplier *= self.tts_level.mul_add(1.0 - echo_reduction, 1.0);
                }
                multiplier
            }
        }
    }

    fn track_edges(&mut self, voice: bool, result: &mut DetectionResult) {
        if voice && !self.prev_voice {
            result.speech_started = true;
            self.stats.detection_count += 1;
            if !self.in_segment {
                self.segment_voice_frames = 0;
            }
            self.in_segment = true;
            tracing::debug!(
                frame = self.frame_count,
                confidence = result.confidence,
                max_amp = result.max_amplitude,
                "speech started"
            );
        }

        if voice {
            self.segment_voice_frames = self.segment_voice_frames.saturating_add(1);
            self.silence_frames = 0;
        } else if self.in_segment {
            self.silence_frames = self.silence_frames.saturating_add(1);
            if self.silence_frames.saturating_mul(FRAME_DURATION_MS)
                >= self.config.silence_threshold_ms
            {
                self.in_segment = false;
                let voiced_ms = self.segment_voice_frames.saturating_mul(FRAME_DURATION_MS);
                if voiced_ms >= self.config.min_voice_duration_ms {
                    result.speech_ended = true;
                    tracing::debug!(voiced_ms, "speech ended");
                } else {
                    tracing::trace!(voiced_ms, "discarding short voice segment");
                }
            }
        }

        result.voice_active = voice;
        result.in_segment = self.in_segment;
        result.voice_duration_ms = self.segment_voice_frames.saturating_mul(FRAME_DURATION_MS);
        result.silence_duration_ms = self.silence_frames.saturating_mul(FRAME_DURATION_MS);
        self.prev_voice = voice;
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn record_stats(&mut self, result: &DetectionResult, started_at: Instant) {
        let elapsed_us = u64::try_from(started_at.elapsed().as_micros()).unwrap_or(u64::MAX);
        let stats = &mut self.stats;

        stats.frames_processed += 1;
        if result.voice_active {
            stats.voice_frames += 1;
        }
        let n = stats.frames_processed as f64;
        stats.avg_processing_us += (elapsed_us as f64 - stats.avg_processing_us) / n;
        stats.max_processing_us = stats.max_processing_us.max(elapsed_us);
        stats.avg_confidence += (f64::from(result.confidence) - stats.avg_confidence) / n;

        stats.current_noise_floor = result.noise_floor;
        if stats.min_noise_floor == 0 || result.noise_floor < stats.min_noise_floor {
            stats.min_noise_floor = result.noise_floor;
        }
        stats.max_noise_floor = stats.max_noise_floor.max(result.noise_floor);
    }

    fn fault_result(&mut self, reason: &str) -> DetectionResult {
        self.stats.faults += 1;
        tracing::warn!(reason, "vad fault, emitting zero-confidence result");
        DetectionResult {
            frame_count: self.frame_count,
            context: self.context,
            noise_floor: to_u16(self.noise_floor),
            ..DetectionResult::default()
        }
    }

    /// Switch the conversation context
    ///
    /// Leaving `speaking` clears the TTS level.
    pub fn set_context(&mut self, context: ConversationContext) {
        if context == self.context {
            return;
        }
        if self.context == ConversationContext::Speaking {
            self.tts_level = 0.0;
        }
        tracing::debug!(from = ?self.context, to = ?context, "vad context changed");
        self.context = context;
    }

    #[must_use]
    pub const fn context(&self) -> ConversationContext {
        self.context
    }

    /// Publish the current TTS playback level, clamped to [0, 1]
    ///
    /// A level above 0.1 in conversation-aware mode switches to `speaking`.
    pub fn set_tts_level(&mut self, level: f32) {
        let level = if level.is_finite() {
            level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if self.config.features.conversation_aware
            && level > ECHO_LEVEL_THRESHOLD
            && self.context != ConversationContext::Speaking
        {
            self.set_context(ConversationContext::Speaking);
        }
        self.tts_level = level;
    }

    #[must_use]
    pub const fn tts_level(&self) -> f32 {
        self.tts_level
    }

    /// Swap the base amplitude and confidence thresholds
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for a zero amplitude or a confidence
    /// outside [0, 1]; nothing is changed in that case
    pub fn update_thresholds(&mut self, amplitude: Option<u16>, confidence: Option<f32>) -> Result<()> {
        if amplitude == Some(0) {
            return Err(Error::InvalidInput(
                "amplitude threshold must be non-zero".to_string(),
            ));
        }
        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::InvalidInput(format!(
                    "confidence threshold {c} outside 0..=1"
                )));
            }
        }

        if let Some(a) = amplitude {
            self.base_threshold = a;
        }
        if let Some(c) = confidence {
            self.confidence_threshold = c;
        }
        tracing::info!(
            amplitude = self.base_threshold,
            confidence = self.confidence_threshold,
            "vad thresholds updated"
        );
        Ok(())
    }

    /// Current base amplitude and confidence thresholds
    #[must_use]
    pub const fn thresholds(&self) -> (u16, f32) {
        (self.base_threshold, self.confidence_threshold)
    }

    #[must_use]
    pub const fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    #[must_use]
    pub const fn stats(&self) -> &VadStats {
        &self.stats
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Return to the initial detection state, keeping thresholds and context
    pub fn reset(&mut self) {
        self.noise_floor = f32::from(self.config.amplitude_threshold) * INITIAL_NOISE_FRACTION;
        self.warmup_frames = 0;
        self.prev_voice = false;
        self.in_segment = false;
        self.segment_voice_frames = 0;
        self.silence_frames = 0;
        self.window.clear();
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u16(value: f32) -> u16 {
    value.clamp(0.0, 65535.0) as u16
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quality(confidence: f32) -> u8 {
    (confidence.clamp(0.0, 1.0) * 255.0) as u8
}

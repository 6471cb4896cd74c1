//! Wake word detection
//!
//! Detects the wake phrase locally from its syllabic energy envelope, then
//! hands the detection to the server for validation. A candidate opens
//! after a few consecutive loud frames, collects per-frame RMS energy until
//! trailing silence, and is scored by correlation against a three-syllable
//! template plus a syllable count.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;

use super::engine::{ConversationContext, DetectionResult};
use crate::audio::{FRAME_DURATION_MS, Frame, rms};
use crate::config::WakeWordConfig;
use crate::{Error, Result};

/// Envelope of the wake phrase, one value per 20 ms segment
const TEMPLATE: [f32; 11] = [0.3, 0.7, 0.4, 0.2, 0.1, 0.4, 0.8, 0.3, 0.6, 0.3, 0.1];

/// Frames of context kept ahead of a candidate
const PRE_ROLL_FRAMES: usize = 8;

/// Longest candidate before it is abandoned
const MAX_CANDIDATE_FRAMES: usize = 64;

/// Shortest trimmed envelope worth scoring
const MIN_CANDIDATE_FRAMES: usize = 10;

/// Upper bound on `pattern_frames`
pub const MAX_PATTERN_FRAMES: usize = 25;

/// Frames of energy history feeding threshold adaptation
const HISTORY_FRAMES: usize = 50;

/// Frames between threshold adaptations
const ADAPT_INTERVAL_FRAMES: u32 = 250;

/// Values below this fraction of the candidate peak are trimmed
const TRIM_LEVEL: f32 = 0.05;

/// Syllable peak must exceed this fraction of the candidate peak
const SYLLABLE_PEAK: f32 = 0.4;
const SYLLABLE_RISE: f32 = 0.1;
const SYLLABLE_FALL: f32 = 0.15;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Lifecycle of a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeWordState {
    Listening,
    Triggered,
    Confirmed,
    Rejected,
}

/// Bucketed detection confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    #[must_use]
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.86 {
            Self::VeryHigh
        } else if confidence >= 0.71 {
            Self::High
        } else if confidence >= 0.41 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A local wake word trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WakeWordEvent {
    pub detection_id: u32,
    pub state: WakeWordState,
    pub confidence: f32,
    pub confidence_level: ConfidenceLevel,
    /// Template correlation scaled to 0..=1000
    pub pattern_score: u16,
    pub syllable_count: u8,
    pub duration_ms: u32,
    /// Peak RMS energy of the utterance
    pub peak_energy: f32,
    pub energy_threshold: f32,
    /// VAD frame counter when the trigger fired
    pub frame: u32,
}

/// Detector counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WakeWordStats {
    pub candidates: u64,
    pub total_detections: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub rate_limited: u64,
    pub adaptations: u64,
    pub avg_confidence: f64,
    pub energy_threshold: f32,
    pub confidence_threshold: f32,
    pub last_detection_id: u32,
}

/// Detects the wake phrase in the frame stream
pub struct WakeWordDetector {
    config: WakeWordConfig,
    base_energy: f32,
    energy_threshold: f32,
    confidence_threshold: f32,
    limiter: DirectLimiter,
    next_detection_id: u32,
    context: ConversationContext,

    pre_roll: [f32; PRE_ROLL_FRAMES],
    pre_roll_next: usize,
    onset_frames: usize,
    in_candidate: bool,
    envelope: [f32; MAX_CANDIDATE_FRAMES],
    envelope_len: usize,
    silence_frames: u32,
    candidate_high_confidence: bool,

    history: [f32; HISTORY_FRAMES],
    history_len: usize,
    history_next: usize,
    frames_since_adapt: u32,
    consecutive_false: u32,

    stats: WakeWordStats,
}

impl WakeWordDetector {
    /// Create a new wake word detector
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if pattern or consistency frames are
    /// out of range or the detection cap is zero
    pub fn new(config: WakeWordConfig) -> Result<Self> {
        if !(15..=MAX_PATTERN_FRAMES).contains(&config.pattern_frames) {
            return Err(Error::InvalidInput(format!(
                "pattern frames {} outside 15..={MAX_PATTERN_FRAMES}",
                config.pattern_frames
            )));
        }
        if !(3..=7).contains(&config.consistency_frames) {
            return Err(Error::InvalidInput(format!(
                "consistency frames {} outside 3..=7",
                config.consistency_frames
            )));
        }
        let per_minute = NonZeroU32::new(config.max_detections_per_minute).ok_or_else(|| {
            Error::InvalidInput("max detections per minute must be non-zero".to_string())
        })?;
        validate_thresholds(Some(config.energy_threshold), Some(config.confidence_threshold))?;

        tracing::debug!(
            energy = config.energy_threshold,
            confidence = config.confidence_threshold,
            syllables = config.expected_syllables,
            "wake word detector initialized"
        );

        Ok(Self {
            base_energy: config.energy_threshold,
            energy_threshold: config.energy_threshold,
            confidence_threshold: config.confidence_threshold,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            next_detection_id: 1,
            context: ConversationContext::Idle,
            pre_roll: [0.0; PRE_ROLL_FRAMES],
            pre_roll_next: 0,
            onset_frames: 0,
            in_candidate: false,
            envelope: [0.0; MAX_CANDIDATE_FRAMES],
            envelope_len: 0,
            silence_frames: 0,
            candidate_high_confidence: false,
            history: [0.0; HISTORY_FRAMES],
            history_len: 0,
            history_next: 0,
            frames_since_adapt: 0,
            consecutive_false: 0,
            stats: WakeWordStats::default(),
            config,
        })
    }

    /// Feed one frame together with its VAD result
    ///
    /// Returns an event when the wake phrase was detected
    pub fn process(&mut self, frame: &Frame, vad: &DetectionResult) -> Option<WakeWordEvent> {
        if !self.config.enabled {
            return None;
        }
        if !self.is_active() {
            self.reset();
            return None;
        }

        let energy = calculate_energy(frame.samples());
        self.record_history(energy);

        let loud = energy > self.energy_threshold;

        if !self.in_candidate {
            self.push_pre_roll(energy);
            if loud && vad.energy_detected {
                self.onset_frames += 1;
                self.candidate_high_confidence |= vad.high_confidence;
                if self.onset_frames >= self.config.consistency_frames {
                    self.open_candidate();
                }
            } else {
                self.onset_frames = 0;
                self.candidate_high_confidence = false;
            }
            return None;
        }

        if self.envelope_len == MAX_CANDIDATE_FRAMES {
            tracing::trace!("wake word candidate too long, abandoning");
            self.reset();
            return None;
        }
        self.envelope[self.envelope_len] = energy;
        self.envelope_len += 1;
        self.candidate_high_confidence |= vad.high_confidence;

        if loud {
            self.silence_frames = 0;
            return None;
        }

        self.silence_frames += 1;
        if self.silence_frames.saturating_mul(FRAME_DURATION_MS) < self.config.silence_timeout_ms {
            return None;
        }

        let event = self.evaluate_candidate(vad.frame_count);
        self.reset();
        event
    }

    fn is_active(&self) -> bool {
        self.context == ConversationContext::Idle || self.config.enable_during_conversation
    }

    fn push_pre_roll(&mut self, energy: f32) {
        self.pre_roll[self.pre_roll_next] = energy;
        self.pre_roll_next = (self.pre_roll_next + 1) % PRE_ROLL_FRAMES;
    }

    fn open_candidate(&mut self) {
        // Pre-roll is chronological starting at the oldest slot
        for i in 0..PRE_ROLL_FRAMES {
            self.envelope[i] = self.pre_roll[(self.pre_roll_next + i) % PRE_ROLL_FRAMES];
        }
        self.envelope_len = PRE_ROLL_FRAMES;
        self.in_candidate = true;
        self.silence_frames = 0;
        self.stats.candidates += 1;
        tracing::trace!(threshold = self.energy_threshold, "wake word candidate opened");
    }

    fn evaluate_candidate(&mut self, frame: u32) -> Option<WakeWordEvent> {
        let raw = &self.envelope[..self.envelope_len];
        let peak = raw.iter().copied().fold(0.0f32, f32::max);
        if peak <= 0.0 {
            return None;
        }

        let start = raw.iter().position(|&e| e / peak >= TRIM_LEVEL)?;
        let end = raw.iter().rposition(|&e| e / peak >= TRIM_LEVEL)? + 1;
        if end - start < MIN_CANDIDATE_FRAMES {
            tracing::trace!(frames = end - start, "wake word candidate too short");
            return None;
        }

        let mut normalized = [0.0f32; MAX_CANDIDATE_FRAMES];
        let len = end - start;
        for (dst, &src) in normalized.iter_mut().zip(&raw[start..end]) {
            *dst = src / peak;
        }
        let envelope = &normalized[..len];

        let correlation = pattern_correlation(envelope, self.config.pattern_frames);
        let syllables = count_syllables(envelope);
        let confidence = self.score(correlation, syllables);

        tracing::debug!(
            correlation,
            syllables,
            confidence,
            duration_ms = len * FRAME_DURATION_MS as usize,
            "wake word candidate scored"
        );

        if syllables != self.config.expected_syllables || confidence < self.confidence_threshold {
            return None;
        }

        if self.limiter.check().is_err() {
            self.stats.rate_limited += 1;
            tracing::warn!("wake word rate limit exceeded, dropping detection");
            return None;
        }

        let detection_id = self.next_detection_id;
        self.next_detection_id = self.next_detection_id.wrapping_add(1);

        self.stats.total_detections += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.stats.total_detections as f64;
        self.stats.avg_confidence += (f64::from(confidence) - self.stats.avg_confidence) / n;
        self.stats.last_detection_id = detection_id;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let event = WakeWordEvent {
            detection_id,
            state: WakeWordState::Triggered,
            confidence,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            pattern_score: (correlation * 1000.0).round().clamp(0.0, 1000.0) as u16,
            syllable_count: syllables,
            duration_ms: u32::try_from(len).unwrap_or(u32::MAX) * FRAME_DURATION_MS,
            peak_energy: peak,
            energy_threshold: self.energy_threshold,
            frame,
        };

        tracing::info!(
            detection_id,
            confidence,
            pattern_score = event.pattern_score,
            "wake word detected"
        );

        Some(event)
    }

    fn score(&self, correlation: f32, syllables: u8) -> f32 {
        let expected = self.config.expected_syllables;
        let syllable_factor = if syllables == expected {
            1.2
        } else if (2..=4).contains(&syllables) {
            1.1
        } else {
            0.8
        };
        let vad_factor = if self.candidate_high_confidence { 1.1 } else { 1.0 };
        (correlation * syllable_factor * vad_factor).min(1.0)
    }

    fn record_history(&mut self, energy: f32) {
        self.history[self.history_next] = energy;
        self.history_next = (self.history_next + 1) % HISTORY_FRAMES;
        self.history_len = (self.history_len + 1).min(HISTORY_FRAMES);

        if !self.config.enable_adaptation {
            return;
        }
        self.frames_since_adapt += 1;
        if self.frames_since_adapt < ADAPT_INTERVAL_FRAMES || self.in_candidate {
            return;
        }
        self.frames_since_adapt = 0;

        #[allow(clippy::cast_precision_loss)]
        let average =
            self.history[..self.history_len].iter().sum::<f32>() / self.history_len as f32;
        let target = average * 2.5;
        let adapted = 0.9f32.mul_add(self.energy_threshold, 0.1 * target);
        self.energy_threshold = adapted.clamp(self.base_energy / 3.0, self.base_energy * 4.0);
        self.stats.adaptations += 1;
        tracing::trace!(threshold = self.energy_threshold, "wake word threshold adapted");
    }

    /// Apply the server's verdict on a detection
    pub fn record_validation(&mut self, detection_id: u32, validated: bool) {
        if validated {
            self.stats.true_positives += 1;
            self.consecutive_false = 0;
            if self.config.enable_adaptation && self.stats.true_positives > 5 {
                self.energy_threshold *= 0.98;
            }
        } else {
            self.stats.false_positives += 1;
            self.consecutive_false += 1;
            if self.consecutive_false > 2 {
                self.energy_threshold *= 1.05;
                self.consecutive_false = 0;
            }
        }
        self.energy_threshold = self
            .energy_threshold
            .clamp(self.base_energy / 2.0, self.base_energy * 3.0);

        tracing::debug!(
            detection_id,
            validated,
            threshold = self.energy_threshold,
            "wake word feedback applied"
        );
    }

    /// Swap energy and confidence thresholds
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for energy outside 1 to 32767 or
    /// confidence outside 0.1 to 1.0; nothing changes in that case
    pub fn update_thresholds(&mut self, energy: Option<f32>, confidence: Option<f32>) -> Result<()> {
        validate_thresholds(energy, confidence)?;
        if let Some(e) = energy {
            self.base_energy = e;
            self.energy_threshold = e;
        }
        if let Some(c) = confidence {
            self.confidence_threshold = c;
        }
        tracing::info!(
            energy = self.energy_threshold,
            confidence = self.confidence_threshold,
            "wake word thresholds updated"
        );
        Ok(())
    }

    /// Current energy and confidence thresholds
    #[must_use]
    pub const fn thresholds(&self) -> (f32, f32) {
        (self.energy_threshold, self.confidence_threshold)
    }

    pub fn set_context(&mut self, context: ConversationContext) {
        self.context = context;
        if !self.is_active() {
            self.reset();
        }
    }

    #[must_use]
    pub fn stats(&self) -> WakeWordStats {
        WakeWordStats {
            energy_threshold: self.energy_threshold,
            confidence_threshold: self.confidence_threshold,
            ..self.stats.clone()
        }
    }

    /// Drop any in-progress candidate
    pub fn reset(&mut self) {
        self.in_candidate = false;
        self.onset_frames = 0;
        self.envelope_len = 0;
        self.silence_frames = 0;
        self.candidate_high_confidence = false;
        self.pre_roll = [0.0; PRE_ROLL_FRAMES];
    }
}

fn validate_thresholds(energy: Option<f32>, confidence: Option<f32>) -> Result<()> {
    if let Some(e) = energy {
        if !(1.0..=32767.0).contains(&e) {
            return Err(Error::InvalidInput(format!(
                "wake energy threshold {e} outside 1..=32767"
            )));
        }
    }
    if let Some(c) = confidence {
        if !(0.1..=1.0).contains(&c) {
            return Err(Error::InvalidInput(format!(
                "wake confidence threshold {c} outside 0.1..=1.0"
            )));
        }
    }
    Ok(())
}

/// Calculate RMS energy of int16 samples
#[must_use]
pub fn calculate_energy(samples: &[i16]) -> f32 {
    rms(samples)
}

/// Correlate an envelope against the template after resampling both
#[must_use]
pub fn pattern_correlation(envelope: &[f32], frames: usize) -> f32 {
    let frames = frames.clamp(2, MAX_PATTERN_FRAMES);
    let mut a = [0.0f32; MAX_PATTERN_FRAMES];
    let mut b = [0.0f32; MAX_PATTERN_FRAMES];
    resample(envelope, &mut a[..frames]);
    resample(&TEMPLATE, &mut b[..frames]);
    pearson(&a[..frames], &b[..frames]).max(0.0)
}

/// Linear interpolation of `src` onto `dst.len()` points
fn resample(src: &[f32], dst: &mut [f32]) {
    if src.is_empty() || dst.is_empty() {
        return;
    }
    if src.len() == 1 || dst.len() == 1 {
        dst.fill(src[0]);
        return;
    }

    #[allow(clippy::cast_precision_loss)]
    let step = (src.len() - 1) as f32 / (dst.len() - 1) as f32;
    for (i, out) in dst.iter_mut().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let x = i as f32 * step;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lo = (x.floor() as usize).min(src.len() - 1);
        let hi = (lo + 1).min(src.len() - 1);
        let frac = x - x.floor();
        *out = (src[hi] - src[lo]).mul_add(frac, src[lo]);
    }
}

fn pearson(a: &[f32], b: &[f32]) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let n = a.len() as f32;
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom < 1e-9 { 0.0 } else { cov / denom }
}

/// Count syllable peaks in a peak-normalized envelope
///
/// A syllable is a rise of at least 0.1 above the preceding valley to a
/// level above 0.4, ended by a fall of at least 0.15 from its peak.
#[must_use]
pub fn count_syllables(envelope: &[f32]) -> u8 {
    let mut count: u8 = 0;
    let mut valley = 0.0f32;
    let mut peak = 0.0f32;
    let mut in_peak = false;

    for &v in envelope {
        if in_peak {
            if v > peak {
                peak = v;
            } else if peak - v >= SYLLABLE_FALL {
                in_peak = false;
                valley = v;
            }
        } else if v < valley {
            valley = v;
        } else if v > SYLLABLE_PEAK && v - valley >= SYLLABLE_RISE {
            in_peak = true;
            peak = v;
            count = count.saturating_add(1);
        }
    }

    count
}

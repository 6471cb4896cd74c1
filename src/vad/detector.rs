//! Detector partition and its mailboxes
//!
//! The VAD engine and the wake word detector are owned by the audio task.
//! Everything else talks to them through a [`DetectorHandle`]: context, TTS
//! level and threshold swaps are single-slot `watch` cells, wake word
//! verdicts are a bounded queue. Pending updates are applied at the next
//! frame boundary.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::engine::{ConversationContext, DetectionResult, VadEngine, VadStats};
use super::wake_word::{WakeWordDetector, WakeWordEvent, WakeWordStats};
use crate::audio::Frame;
use crate::config::{VadConfig, WakeWordConfig};
use crate::{Error, Result};

/// Frames between stats publications
const STATS_INTERVAL_FRAMES: u32 = 50;

/// Runtime threshold swap, fields left as `None` are unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThresholdUpdate {
    pub vad_amplitude_threshold: Option<u16>,
    pub vad_confidence_threshold: Option<f32>,
    pub wake_energy_threshold: Option<f32>,
    pub wake_confidence_threshold: Option<f32>,
}

impl ThresholdUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.vad_amplitude_threshold.is_none()
            && self.vad_confidence_threshold.is_none()
            && self.wake_energy_threshold.is_none()
            && self.wake_confidence_threshold.is_none()
    }

    /// Check every field against the detector bounds
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the first out-of-range field
    pub fn validate(&self) -> Result<()> {
        if self.vad_amplitude_threshold == Some(0) {
            return Err(Error::InvalidInput(
                "vad amplitude threshold must be non-zero".to_string(),
            ));
        }
        if let Some(c) = self.vad_confidence_threshold {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::InvalidInput(format!(
                    "vad confidence threshold {c} outside 0..=1"
                )));
            }
        }
        if let Some(e) = self.wake_energy_threshold {
            if !(1.0..=32767.0).contains(&e) {
                return Err(Error::InvalidInput(format!(
                    "wake energy threshold {e} outside 1..=32767"
                )));
            }
        }
        if let Some(c) = self.wake_confidence_threshold {
            if !(0.1..=1.0).contains(&c) {
                return Err(Error::InvalidInput(format!(
                    "wake confidence threshold {c} outside 0.1..=1.0"
                )));
            }
        }
        Ok(())
    }
}

/// Server verdict on a wake word detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeVerdict {
    pub detection_id: u32,
    pub validated: bool,
}

/// Snapshot of both detectors for telemetry
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub vad: VadStats,
    pub wake_word: WakeWordStats,
    pub context: ConversationContext,
    pub vad_amplitude_threshold: u16,
    pub vad_confidence_threshold: f32,
    pub noise_floor: f32,
}

/// Control side of the detector partition
#[derive(Clone)]
pub struct DetectorHandle {
    context: Arc<watch::Sender<ConversationContext>>,
    tts_level: Arc<watch::Sender<f32>>,
    thresholds: Arc<watch::Sender<Option<ThresholdUpdate>>>,
    verdicts: mpsc::Sender<WakeVerdict>,
    stats: watch::Receiver<DetectorStats>,
}

impl DetectorHandle {
    /// Request a context switch at the next frame boundary
    pub fn set_context(&self, context: ConversationContext) {
        self.context.send_replace(context);
    }

    #[must_use]
    pub fn context(&self) -> ConversationContext {
        *self.context.borrow()
    }

    /// Publish the playback level used for echo suppression
    pub fn set_tts_level(&self, level: f32) {
        let level = if level.is_finite() {
            level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.tts_level.send_replace(level);
    }

    /// Queue a threshold swap, replacing any swap not yet applied
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if any field is out of range
    pub fn update_thresholds(&self, update: ThresholdUpdate) -> Result<()> {
        update.validate()?;
        if update.is_empty() {
            return Ok(());
        }
        self.thresholds.send_replace(Some(update));
        Ok(())
    }

    /// Forward a server verdict to the wake word detector
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the verdict queue is full
    pub fn record_verdict(&self, detection_id: u32, validated: bool) -> Result<()> {
        self.verdicts
            .try_send(WakeVerdict {
                detection_id,
                validated,
            })
            .map_err(|e| Error::Busy(format!("wake verdict queue: {e}")))
    }

    /// Latest published detector stats
    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        self.stats.borrow().clone()
    }
}

/// VAD and wake word detection driven from the audio task
pub struct Detector {
    vad: VadEngine,
    wake: WakeWordDetector,
    context: watch::Receiver<ConversationContext>,
    tts_level: watch::Receiver<f32>,
    thresholds: watch::Receiver<Option<ThresholdUpdate>>,
    verdicts: mpsc::Receiver<WakeVerdict>,
    stats: watch::Sender<DetectorStats>,
    frames_since_stats: u32,
}

impl Detector {
    /// Build the detector partition and its control handle
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if either detector config is invalid
    pub fn new(
        vad: VadConfig,
        wake: WakeWordConfig,
        verdict_depth: usize,
    ) -> Result<(Self, DetectorHandle)> {
        let vad = VadEngine::new(vad)?;
        let wake = WakeWordDetector::new(wake)?;

        let (context_tx, context_rx) = watch::channel(ConversationContext::Idle);
        let (tts_tx, tts_rx) = watch::channel(0.0f32);
        let (thresholds_tx, thresholds_rx) = watch::channel(None);
        let (verdict_tx, verdict_rx) = mpsc::channel(verdict_depth.max(1));
        let (stats_tx, stats_rx) = watch::channel(DetectorStats::default());

        let handle = DetectorHandle {
            context: Arc::new(context_tx),
            tts_level: Arc::new(tts_tx),
            thresholds: Arc::new(thresholds_tx),
            verdicts: verdict_tx,
            stats: stats_rx,
        };

        let detector = Self {
            vad,
            wake,
            context: context_rx,
            tts_level: tts_rx,
            thresholds: thresholds_rx,
            verdicts: verdict_rx,
            stats: stats_tx,
            frames_since_stats: 0,
        };

        Ok((detector, handle))
    }

    /// Apply pending updates, then classify one frame
    pub fn process(&mut self, frame: &Frame) -> (DetectionResult, Option<WakeWordEvent>) {
        self.apply_pending();

        let result = self.vad.process(frame);
        let wake = self.wake.process(frame, &result);

        self.frames_since_stats += 1;
        if self.frames_since_stats >= STATS_INTERVAL_FRAMES {
            self.frames_since_stats = 0;
            self.publish_stats();
        }

        (result, wake)
    }

    fn apply_pending(&mut self) {
        if self.context.has_changed().unwrap_or(false) {
            let context = *self.context.borrow_and_update();
            self.vad.set_context(context);
            self.wake.set_context(context);
        }

        if self.tts_level.has_changed().unwrap_or(false) {
            let level = *self.tts_level.borrow_and_update();
            self.vad.set_tts_level(level);
            // The engine may have switched itself to speaking
            self.wake.set_context(self.vad.context());
        }

        if self.thresholds.has_changed().unwrap_or(false) {
            let update = *self.thresholds.borrow_and_update();
            if let Some(update) = update {
                self.apply_thresholds(&update);
            }
        }

        while let Ok(verdict) = self.verdicts.try_recv() {
            self.wake
                .record_validation(verdict.detection_id, verdict.validated);
        }
    }

    fn apply_thresholds(&mut self, update: &ThresholdUpdate) {
        if let Err(e) = self
            .vad
            .update_thresholds(update.vad_amplitude_threshold, update.vad_confidence_threshold)
        {
            tracing::warn!(error = %e, "rejected vad threshold update");
        }
        if let Err(e) = self
            .wake
            .update_thresholds(update.wake_energy_threshold, update.wake_confidence_threshold)
        {
            tracing::warn!(error = %e, "rejected wake word threshold update");
        }
    }

    fn publish_stats(&self) {
        let (amplitude, confidence) = self.vad.thresholds();
        self.stats.send_replace(DetectorStats {
            vad: self.vad.stats().clone(),
            wake_word: self.wake.stats(),
            context: self.vad.context(),
            vad_amplitude_threshold: amplitude,
            vad_confidence_threshold: confidence,
            noise_floor: self.vad.noise_floor(),
        });
    }

    #[must_use]
    pub const fn vad(&self) -> &VadEngine {
        &self.vad
    }

    #[must_use]
    pub const fn wake_word(&self) -> &WakeWordDetector {
        &self.wake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> (Detector, DetectorHandle) {
        Detector::new(VadConfig::conversation(), WakeWordConfig::default(), 8).unwrap()
    }

    #[test]
    fn test_context_applied_at_frame_boundary() {
        let (mut detector, handle) = detector();
        handle.set_context(ConversationContext::Listening);
        assert_eq!(detector.vad().context(), ConversationContext::Idle);

        let (result, _) = detector.process(&Frame::silent());
        assert_eq!(result.context, ConversationContext::Listening);
        assert_eq!(handle.context(), ConversationContext::Listening);
    }

    #[test]
    fn test_latest_threshold_update_wins() {
        let (mut detector, handle) = detector();
        handle
            .update_thresholds(ThresholdUpdate {
                vad_amplitude_threshold: Some(1000),
                ..ThresholdUpdate::default()
            })
            .unwrap();
        handle
            .update_thresholds(ThresholdUpdate {
                vad_amplitude_threshold: Some(1500),
                ..ThresholdUpdate::default()
            })
            .unwrap();

        detector.process(&Frame::silent());
        assert_eq!(detector.vad().thresholds().0, 1500);
    }

    #[test]
    fn test_invalid_update_rejected_up_front() {
        let (_detector, handle) = detector();
        let err = handle
            .update_thresholds(ThresholdUpdate {
                wake_confidence_threshold: Some(2.0),
                ..ThresholdUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_verdicts_reach_wake_detector() {
        let (mut detector, handle) = detector();
        handle.record_verdict(1, true).unwrap();
        handle.record_verdict(2, false).unwrap();
        detector.process(&Frame::silent());

        let stats = detector.wake_word().stats();
        assert_eq!(stats.true_positives, 1);
        assert_eq!(stats.false_positives, 1);
    }

    #[test]
    fn test_tts_level_switches_context() {
        let (mut detector, handle) = detector();
        handle.set_tts_level(0.6);
        let (result, _) = detector.process(&Frame::silent());
        assert_eq!(result.context, ConversationContext::Speaking);
        assert!(result.echo_suppression_active);
    }

    #[test]
    fn test_stats_published() {
        let (mut detector, handle) = detector();
        for _ in 0..STATS_INTERVAL_FRAMES {
            detector.process(&Frame::silent());
        }
        assert_eq!(
            handle.stats().vad.frames_processed,
            u64::from(STATS_INTERVAL_FRAMES)
        );
    }
}

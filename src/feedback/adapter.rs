//! Feedback loop between local detections and the server

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::pending::PendingTable;
use super::training::{TrainingMode, encode_chunks};
use crate::config::{Config, FeedbackConfig};
use crate::playback::PlayerHandle;
use crate::shutdown::Shutdown;
use crate::transport::messages::{
    StreamReport, ThresholdRecommendation, VadReport, WakeWordReport, timestamp_ms,
};
use crate::transport::{ChannelHandle, ClientMessage, DatagramStats, ServerMessage};
use crate::vad::{DetectionResult, DetectorHandle, ThresholdUpdate, WakeWordEvent};
use crate::{Error, Result};

/// Housekeeping period for expiry, reverts and periodic statistics
const TICK: Duration = Duration::from_millis(100);

/// Outbound side of the reliable channel
pub trait MessageSink: Send + Sync {
    /// Queue one message without waiting
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be queued
    fn send(&self, message: ClientMessage) -> Result<()>;

    /// Whether messages currently reach the server
    fn is_connected(&self) -> bool {
        true
    }
}

impl MessageSink for ChannelHandle {
    fn send(&self, message: ClientMessage) -> Result<()> {
        Self::send(self, message)
    }

    fn is_connected(&self) -> bool {
        Self::is_connected(self)
    }
}

/// Work for the adapter task
#[derive(Debug)]
pub enum FeedbackInput {
    Server(ServerMessage),
    WakeWord {
        event: WakeWordEvent,
        vad_active: bool,
        snr_db: f32,
    },
    TrainingAudio {
        samples: Vec<i16>,
        is_positive: bool,
    },
}

/// Outcomes the coordinator acts on
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEvent {
    WakeWordConfirmed { detection_id: u32 },
    WakeWordRejected { detection_id: u32 },
    TrainingRequested { sample_count: u32, duration_ms: u32 },
    TrainingFinished,
}

/// Validation accuracy and loop counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub reports_sent: u64,
    pub report_failures: u64,
    pub pending: u64,
    pub validations: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    /// Verdicts for ids that were never pending or arrived too late
    pub unknown_validations: u64,
    pub expired: u64,
    pub accuracy_percent: f64,
    pub avg_latency_ms: f64,
    pub threshold_updates: u64,
    pub threshold_reverts: u64,
    pub last_threshold_reason: Option<String>,
    pub training_samples_sent: u64,
    pub training_chunks_sent: u64,
    pub statistics_reports: u64,
    pub training_active: bool,
}

/// Control side of the adapter task
#[derive(Clone)]
pub struct FeedbackHandle {
    inputs: mpsc::Sender<FeedbackInput>,
    stats: watch::Receiver<FeedbackStats>,
    training: watch::Receiver<Option<u32>>,
}

impl FeedbackHandle {
    /// Forward a local trigger for server validation
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the adapter queue is full
    pub fn report_wake_word(&self, event: WakeWordEvent, vad: &DetectionResult) -> Result<()> {
        self.submit(FeedbackInput::WakeWord {
            event,
            vad_active: vad.voice_active,
            snr_db: vad.snr_db,
        })
    }

    /// Hand a non-TTS server message to the adapter
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the adapter queue is full
    pub fn deliver(&self, message: ServerMessage) -> Result<()> {
        self.submit(FeedbackInput::Server(message))
    }

    /// Upload recorded audio while training mode is active
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the adapter queue is full
    pub fn submit_training(&self, samples: Vec<i16>, is_positive: bool) -> Result<()> {
        self.submit(FeedbackInput::TrainingAudio {
            samples,
            is_positive,
        })
    }

    /// Requested sample length while training mode is active
    #[must_use]
    pub fn training_duration_ms(&self) -> Option<u32> {
        *self.training.borrow()
    }

    #[must_use]
    pub fn stats(&self) -> FeedbackStats {
        self.stats.borrow().clone()
    }

    fn submit(&self, input: FeedbackInput) -> Result<()> {
        self.inputs
            .try_send(input)
            .map_err(|e| Error::Busy(format!("feedback queue: {e}")))
    }
}

struct Override {
    expires_at: Instant,
    revert: ThresholdUpdate,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    vad_amplitude: u16,
    vad_confidence: f32,
    wake_energy: f32,
    wake_confidence: f32,
}

impl Baseline {
    fn with(self, update: &ThresholdUpdate) -> Self {
        Self {
            vad_amplitude: update.vad_amplitude_threshold.unwrap_or(self.vad_amplitude),
            vad_confidence: update.vad_confidence_threshold.unwrap_or(self.vad_confidence),
            wake_energy: update.wake_energy_threshold.unwrap_or(self.wake_energy),
            wake_confidence: update.wake_confidence_threshold.unwrap_or(self.wake_confidence),
        }
    }
}

/// Thresholds pushed to the detector that its stats do not show yet
#[derive(Debug, Clone, Copy)]
struct Staged {
    update: ThresholdUpdate,
    thresholds: Baseline,
    /// `frames_processed` of the stats snapshot current at push time
    seen_frames: u64,
}

/// Closes the loop between wake word triggers and server verdicts
pub struct FeedbackAdapter {
    config: FeedbackConfig,
    outbound: Box<dyn MessageSink>,
    detector: DetectorHandle,
    events: mpsc::Sender<FeedbackEvent>,
    inputs: mpsc::Receiver<FeedbackInput>,
    stats_tx: watch::Sender<FeedbackStats>,
    training_tx: watch::Sender<Option<u32>>,
    datagram: Option<Arc<DatagramStats>>,
    player: Option<PlayerHandle>,
    pending: PendingTable,
    baseline: Baseline,
    staged: Option<Staged>,
    override_: Option<Override>,
    training: Option<TrainingMode>,
    next_sample_index: u32,
    last_statistics: Instant,
    stats: FeedbackStats,
    latency_total_ms: f64,
}

impl FeedbackAdapter {
    /// Build the adapter and its handle
    #[must_use]
    pub fn new(
        config: &Config,
        outbound: Box<dyn MessageSink>,
        detector: DetectorHandle,
        events: mpsc::Sender<FeedbackEvent>,
    ) -> (Self, FeedbackHandle) {
        let (inputs_tx, inputs_rx) = mpsc::channel(64);
        let (stats_tx, stats_rx) = watch::channel(FeedbackStats::default());
        let (training_tx, training_rx) = watch::channel(None);

        let handle = FeedbackHandle {
            inputs: inputs_tx,
            stats: stats_rx,
            training: training_rx,
        };

        let adapter = Self {
            config: config.feedback.clone(),
            outbound,
            detector,
            events,
            inputs: inputs_rx,
            stats_tx,
            training_tx,
            datagram: None,
            player: None,
            pending: PendingTable::new(Duration::from_millis(config.feedback.validation_timeout_ms)),
            baseline: Baseline {
                vad_amplitude: config.vad.amplitude_threshold,
                vad_confidence: config.vad.confidence_threshold,
                wake_energy: config.wake_word.energy_threshold,
                wake_confidence: config.wake_word.confidence_threshold,
            },
            staged: None,
            override_: None,
            training: None,
            next_sample_index: 0,
            last_statistics: Instant::now(),
            stats: FeedbackStats::default(),
            latency_total_ms: 0.0,
        };

        (adapter, handle)
    }

    /// Include datagram counters in statistics replies
    #[must_use]
    pub fn with_datagram_stats(mut self, stats: Arc<DatagramStats>) -> Self {
        self.datagram = Some(stats);
        self
    }

    /// Include playback status in statistics replies
    #[must_use]
    pub fn with_player(mut self, player: PlayerHandle) -> Self {
        self.player = Some(player);
        self
    }

    /// Send a detection summary and start its validation timer
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the id is still pending. A send
    /// failure is counted and not returned; the detection then expires.
    pub fn report_wake_word(
        &mut self,
        event: &WakeWordEvent,
        vad_active: bool,
        snr_db: f32,
        now: Instant,
    ) -> Result<()> {
        if !self.pending.insert(event.detection_id, event.confidence, now) {
            return Err(Error::InvalidInput(format!(
                "detection {} is already pending",
                event.detection_id
            )));
        }

        let message = ClientMessage::WakeWordDetected {
            detection_id: event.detection_id,
            device_id: self.config.device_id.clone(),
            confidence: event.confidence,
            energy_level: event.peak_energy,
            pattern_score: event.pattern_score,
            syllable_count: event.syllable_count,
            duration_ms: event.duration_ms,
            vad_active,
            snr_db,
            timestamp: timestamp_ms(),
        };

        match self.outbound.send(message) {
            Ok(()) => {
                self.stats.reports_sent += 1;
                tracing::info!(
                    detection_id = event.detection_id,
                    confidence = event.confidence,
                    "wake word reported"
                );
            }
            Err(e) => {
                self.stats.report_failures += 1;
                tracing::warn!(
                    detection_id = event.detection_id,
                    error = %e,
                    "wake word report not sent"
                );
            }
        }

        self.publish();
        Ok(())
    }

    /// Handle one inbound server message
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for TTS messages and for threshold
    /// values outside the detector bounds
    pub fn handle_message(&mut self, message: ServerMessage, now: Instant) -> Result<()> {
        let result = match message {
            ServerMessage::WakeWordValidation {
                detection_id,
                validated,
                server_confidence,
                energy_threshold_delta,
            } => {
                self.on_validation(detection_id, validated, server_confidence, now);
                energy_threshold_delta.map_or(Ok(()), |d| self.apply_energy_delta(d))
            }
            ServerMessage::ThresholdUpdate(rec) => self.apply_recommendation(&rec, now),
            ServerMessage::TrainingRequest {
                sample_count,
                duration_ms,
                label,
            } => {
                self.start_training(sample_count, duration_ms, label);
                Ok(())
            }
            ServerMessage::StatisticsRequest => {
                self.send_statistics(now);
                Ok(())
            }
            ServerMessage::Ping { .. } | ServerMessage::Pong { .. } | ServerMessage::State { .. } => {
                Ok(())
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!(code = ?code, message = %message, "server reported error");
                Ok(())
            }
            other @ (ServerMessage::TtsStart(_)
            | ServerMessage::TtsChunk(_)
            | ServerMessage::TtsEnd(_)) => Err(Error::InvalidInput(format!(
                "tts message routed to feedback: {other:?}"
            ))),
        };
        self.publish();
        result
    }

    fn on_validation(
        &mut self,
        detection_id: u32,
        validated: bool,
        server_confidence: f32,
        now: Instant,
    ) {
        let Some(resolved) = self.pending.resolve(detection_id, now) else {
            self.stats.unknown_validations += 1;
            tracing::debug!(detection_id, "verdict for unknown or expired detection");
            return;
        };

        self.stats.validations += 1;
        if validated {
            self.stats.true_positives += 1;
        } else {
            self.stats.false_positives += 1;
        }

        #[allow(clippy::cast_precision_loss)]
        {
            let latency_ms = resolved.latency.as_secs_f64() * 1000.0;
            self.latency_total_ms += latency_ms;
            let validations = self.stats.validations as f64;
            self.stats.avg_latency_ms = self.latency_total_ms / validations;
            self.stats.accuracy_percent = self.stats.true_positives as f64 * 100.0 / validations;
        }

        tracing::info!(
            detection_id,
            validated,
            local_confidence = resolved.confidence,
            server_confidence,
            latency_ms = resolved.latency.as_millis(),
            "wake word verdict"
        );

        if let Err(e) = self.detector.record_verdict(detection_id, validated) {
            tracing::warn!(error = %e, "verdict not forwarded to detector");
        }

        let event = if validated {
            FeedbackEvent::WakeWordConfirmed { detection_id }
        } else {
            FeedbackEvent::WakeWordRejected { detection_id }
        };
        self.emit(event);
    }

    fn apply_energy_delta(&mut self, delta: f32) -> Result<()> {
        if !delta.is_finite() {
            return Err(Error::InvalidInput(format!(
                "energy threshold delta {delta} is not finite"
            )));
        }
        let base = self.baseline.wake_energy;
        let current = self.current().wake_energy;
        let target = (current + delta).clamp(base / 2.0, base * 3.0).clamp(1.0, 32767.0);

        tracing::debug!(current, target, "applying energy threshold delta");
        self.push_thresholds(ThresholdUpdate {
            wake_energy_threshold: Some(target),
            ..ThresholdUpdate::default()
        })
    }

    /// Hand an update to the detector mailbox
    ///
    /// The mailbox keeps only the latest update, so one that lands before
    /// the detector has consumed the previous is merged with it.
    fn push_thresholds(&mut self, update: ThresholdUpdate) -> Result<()> {
        let seen_frames = self.detector.stats().vad.frames_processed;
        let (merged, before) = match self.staged.filter(|s| s.seen_frames == seen_frames) {
            Some(staged) => (
                ThresholdUpdate {
                    vad_amplitude_threshold: update
                        .vad_amplitude_threshold
                        .or(staged.update.vad_amplitude_threshold),
                    vad_confidence_threshold: update
                        .vad_confidence_threshold
                        .or(staged.update.vad_confidence_threshold),
                    wake_energy_threshold: update
                        .wake_energy_threshold
                        .or(staged.update.wake_energy_threshold),
                    wake_confidence_threshold: update
                        .wake_confidence_threshold
                        .or(staged.update.wake_confidence_threshold),
                },
                staged.thresholds,
            ),
            None => (update, self.current()),
        };

        self.detector.update_thresholds(merged)?;
        self.staged = Some(Staged {
            update: merged,
            thresholds: before.with(&update),
            seen_frames,
        });
        Ok(())
    }

    fn apply_recommendation(&mut self, rec: &ThresholdRecommendation, now: Instant) -> Result<()> {
        let update = ThresholdUpdate {
            vad_amplitude_threshold: rec.vad_amplitude_threshold,
            vad_confidence_threshold: rec.vad_confidence_threshold,
            wake_energy_threshold: rec.wake_energy_threshold,
            wake_confidence_threshold: rec.wake_confidence_threshold,
        };
        update.validate()?;
        if update.is_empty() {
            return Ok(());
        }

        let prior = self.current();
        self.push_thresholds(update)?;
        self.stats.threshold_updates += 1;
        self.stats.last_threshold_reason.clone_from(&rec.reason);

        tracing::info!(
            reason = rec.reason.as_deref().unwrap_or("unspecified"),
            expires_ms = rec.expires_ms,
            "threshold update applied"
        );

        match rec.expires_ms {
            Some(ms) => {
                let earlier = self.override_.take().map(|o| o.revert);
                let revert = ThresholdUpdate {
                    vad_amplitude_threshold: update.vad_amplitude_threshold.and(
                        earlier
                            .and_then(|e| e.vad_amplitude_threshold)
                            .or(Some(prior.vad_amplitude)),
                    ),
                    vad_confidence_threshold: update.vad_confidence_threshold.and(
                        earlier
                            .and_then(|e| e.vad_confidence_threshold)
                            .or(Some(prior.vad_confidence)),
                    ),
                    wake_energy_threshold: update.wake_energy_threshold.and(
                        earlier
                            .and_then(|e| e.wake_energy_threshold)
                            .or(Some(prior.wake_energy)),
                    ),
                    wake_confidence_threshold: update.wake_confidence_threshold.and(
                        earlier
                            .and_then(|e| e.wake_confidence_threshold)
                            .or(Some(prior.wake_confidence)),
                    ),
                };
                self.override_ = Some(Override {
                    expires_at: now + Duration::from_millis(ms),
                    revert,
                });
            }
            None => self.override_ = None,
        }

        Ok(())
    }

    fn start_training(&mut self, sample_count: u32, duration_ms: u32, label: Option<String>) {
        let sample_count = sample_count.max(1);
        tracing::info!(sample_count, duration_ms, "training mode enabled");
        self.training = Some(TrainingMode {
            remaining: sample_count,
            duration_ms,
            label,
        });
        self.training_tx.send_replace(Some(duration_ms));
        self.emit(FeedbackEvent::TrainingRequested {
            sample_count,
            duration_ms,
        });
    }

    /// Upload one recorded sample, chunked
    ///
    /// Returns the number of chunks queued.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` outside training mode or for an empty
    /// sample, and the channel error if a chunk cannot be queued
    pub fn send_training_sample(&mut self, samples: &[i16], is_positive: bool) -> Result<usize> {
        let Some(mode) = self.training.as_mut() else {
            return Err(Error::InvalidInput("training mode is not active".to_string()));
        };

        let chunks = encode_chunks(samples, self.config.training_chunk_bytes)?;
        let chunk_count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        let label = mode.label.clone().unwrap_or_else(|| {
            if is_positive { "positive" } else { "negative" }.to_string()
        });
        let sample_index = self.next_sample_index;

        for (index, audio_data) in chunks.into_iter().enumerate() {
            self.outbound.send(ClientMessage::TrainingSample {
                device_id: self.config.device_id.clone(),
                sample_index,
                chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
                chunk_count,
                label: Some(label.clone()),
                audio_data,
                timestamp: timestamp_ms(),
            })?;
            self.stats.training_chunks_sent += 1;
        }

        self.next_sample_index = self.next_sample_index.wrapping_add(1);
        self.stats.training_samples_sent += 1;
        mode.remaining = mode.remaining.saturating_sub(1);

        tracing::info!(
            sample_index,
            chunks = chunk_count,
            remaining = mode.remaining,
            "training sample sent"
        );

        if mode.remaining == 0 {
            self.training = None;
            self.training_tx.send_replace(None);
            self.emit(FeedbackEvent::TrainingFinished);
        }

        self.publish();
        Ok(chunk_count as usize)
    }

    /// Statistics report for the server
    #[must_use]
    pub fn statistics_message(&self) -> ClientMessage {
        let detector = self.detector.stats();
        let datagram = self.datagram.as_ref().map(|d| d.snapshot());

        ClientMessage::Statistics {
            device_id: self.config.device_id.clone(),
            wake_word_stats: WakeWordReport {
                total_detections: detector.wake_word.total_detections,
                true_positives: self.stats.true_positives,
                false_positives: self.stats.false_positives,
                avg_confidence: detector.wake_word.avg_confidence,
                current_threshold: detector.wake_word.energy_threshold,
            },
            vad_stats: VadReport {
                voice_packets: datagram.as_ref().map_or(0, |d| d.voice_packets),
                silence_packets: datagram.as_ref().map_or(0, |d| d.silence_packets),
                avg_confidence: detector.vad.avg_confidence,
                noise_floor: detector.noise_floor,
                frames_processed: detector.vad.frames_processed,
            },
            stream_stats: datagram
                .map(|d| StreamReport {
                    packets_sent: d.packets_sent,
                    packets_suppressed: d.packets_suppressed,
                    packets_dropped: d.packets_dropped,
                    send_errors: d.send_errors,
                    bandwidth_saved_bytes: d.bandwidth_saved_bytes,
                    avg_send_us: d.avg_send_us,
                })
                .unwrap_or_default(),
            timestamp: timestamp_ms(),
        }
    }

    fn send_statistics(&mut self, now: Instant) {
        self.last_statistics = now;
        let message = self.statistics_message();
        match self.outbound.send(message) {
            Ok(()) => self.stats.statistics_reports += 1,
            Err(e) => tracing::debug!(error = %e, "statistics not sent"),
        }

        let Some(player) = &self.player else {
            return;
        };
        let status = player.status();
        let Some(session_id) = status.session_id else {
            return;
        };
        let message = ClientMessage::PlaybackStatus {
            device_id: self.config.device_id.clone(),
            session_id,
            playback_state: status.state,
            chunks_received: status.chunks_received,
            chunks_played: status.chunks_played,
            buffer_level_ms: status.buffer_level_ms,
            underruns: status.underruns,
            dropouts: status.dropouts,
            timestamp: timestamp_ms(),
        };
        if let Err(e) = self.outbound.send(message) {
            tracing::debug!(error = %e, "playback status not sent");
        }
    }

    /// Expire verdicts, revert timed overrides, send periodic statistics
    pub fn tick(&mut self, now: Instant) {
        let expired = self.pending.expire(now);
        if !expired.is_empty() {
            self.stats.expired += expired.len() as u64;
            tracing::debug!(ids = ?expired, "wake word verdicts expired");
        }

        if self.override_.as_ref().is_some_and(|o| now >= o.expires_at) {
            if let Some(o) = self.override_.take() {
                match self.push_thresholds(o.revert) {
                    Ok(()) => {
                        self.stats.threshold_reverts += 1;
                        tracing::info!("threshold override expired, reverted");
                    }
                    Err(e) => tracing::warn!(error = %e, "threshold revert rejected"),
                }
            }
        }

        let interval = Duration::from_millis(self.config.statistics_interval_ms);
        if !interval.is_zero() && now.saturating_duration_since(self.last_statistics) >= interval {
            self.send_statistics(now);
        }

        self.publish();
    }

    /// Thresholds in effect, from the detector once it has published
    /// stats newer than the last push
    fn current(&self) -> Baseline {
        let stats = self.detector.stats();
        if let Some(staged) = self.staged
            && staged.seen_frames == stats.vad.frames_processed
        {
            return staged.thresholds;
        }
        if stats.vad.frames_processed == 0 {
            return self.baseline;
        }
        Baseline {
            vad_amplitude: stats.vad_amplitude_threshold,
            vad_confidence: stats.vad_confidence_threshold,
            wake_energy: stats.wake_word.energy_threshold,
            wake_confidence: stats.wake_word.confidence_threshold,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &FeedbackStats {
        &self.stats
    }

    fn publish(&mut self) {
        self.stats.pending = self.pending.len() as u64;
        self.stats.training_active = self.training.is_some();
        self.stats_tx.send_replace(self.stats.clone());
    }

    fn emit(&self, event: FeedbackEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(error = %e, "feedback event dropped");
        }
    }

    fn handle_input(&mut self, input: FeedbackInput) {
        let now = Instant::now();
        let result = match input {
            FeedbackInput::Server(message) => self.handle_message(message, now),
            FeedbackInput::WakeWord {
                event,
                vad_active,
                snr_db,
            } => self.report_wake_word(&event, vad_active, snr_db, now),
            FeedbackInput::TrainingAudio {
                samples,
                is_positive,
            } => self.send_training_sample(&samples, is_positive).map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "feedback input rejected");
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.last_statistics = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                _ = interval.tick() => self.tick(Instant::now()),
            }
        }

        self.pending.clear();
        tracing::debug!("feedback adapter stopped");
    }

    /// Spawn the adapter task
    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{VadConfig, WakeWordConfig};
    use crate::vad::{ConfidenceLevel, Detector, WakeWordState};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<ClientMessage>>>);

    impl MessageSink for Recorder {
        fn send(&self, message: ClientMessage) -> Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().iter().map(ClientMessage::kind).collect()
        }
    }

    struct Harness {
        adapter: FeedbackAdapter,
        recorder: Recorder,
        events: mpsc::Receiver<FeedbackEvent>,
        detector: Detector,
    }

    fn harness() -> Harness {
        harness_with(WakeWordConfig::default())
    }

    fn harness_with(wake_word: WakeWordConfig) -> Harness {
        let mut config = Config::default();
        config.wake_word = wake_word.clone();
        let (detector, handle) = Detector::new(VadConfig::default(), wake_word, 8).unwrap();
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(16);
        let (adapter, _handle) =
            FeedbackAdapter::new(&config, Box::new(recorder.clone()), handle, tx);
        Harness {
            adapter,
            recorder,
            events: rx,
            detector,
        }
    }

    fn event(detection_id: u32) -> WakeWordEvent {
        WakeWordEvent {
            detection_id,
            state: WakeWordState::Triggered,
            confidence: 0.8,
            confidence_level: ConfidenceLevel::High,
            pattern_score: 800,
            syllable_count: 3,
            duration_ms: 600,
            peak_energy: 6000.0,
            energy_threshold: 3500.0,
            frame: 100,
        }
    }

    fn validation(detection_id: u32, validated: bool) -> ServerMessage {
        ServerMessage::WakeWordValidation {
            detection_id,
            validated,
            server_confidence: 0.9,
            energy_threshold_delta: None,
        }
    }

    #[test]
    fn test_report_then_confirm() {
        let mut h = harness();
        let t0 = Instant::now();
        h.adapter.report_wake_word(&event(5), true, 20.0, t0).unwrap();
        assert_eq!(h.recorder.kinds(), vec!["wake_word_detected"]);
        assert!(h.adapter.report_wake_word(&event(5), true, 20.0, t0).is_err());

        h.adapter
            .handle_message(validation(5, true), t0 + Duration::from_millis(200))
            .unwrap();

        let stats = h.adapter.stats();
        assert_eq!(stats.true_positives, 1);
        assert_eq!(stats.pending, 0);
        assert!((stats.accuracy_percent - 100.0).abs() < 1e-9);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1.0);
        assert_eq!(
            h.events.try_recv().unwrap(),
            FeedbackEvent::WakeWordConfirmed { detection_id: 5 }
        );
    }

    #[test]
    fn test_unknown_and_expired() {
        let mut h = harness();
        let t0 = Instant::now();
        h.adapter.handle_message(validation(99, true), t0).unwrap();
        assert_eq!(h.adapter.stats().unknown_validations, 1);

        h.adapter.report_wake_word(&event(1), true, 10.0, t0).unwrap();
        h.adapter.tick(t0 + Duration::from_millis(3100));
        assert_eq!(h.adapter.stats().expired, 1);
        assert_eq!(h.adapter.stats().pending, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_rejection_counts_false_positive() {
        let mut h = harness();
        let t0 = Instant::now();
        h.adapter.report_wake_word(&event(2), false, 5.0, t0).unwrap();
        h.adapter.handle_message(validation(2, false), t0).unwrap();
        assert_eq!(h.adapter.stats().false_positives, 1);
        assert!((h.adapter.stats().accuracy_percent).abs() < 1e-9);
        assert_eq!(
            h.events.try_recv().unwrap(),
            FeedbackEvent::WakeWordRejected { detection_id: 2 }
        );
    }

    #[test]
    fn test_threshold_update_and_revert() {
        let mut h = harness();
        let t0 = Instant::now();
        let rec = ThresholdRecommendation {
            wake_energy_threshold: Some(5000.0),
            wake_confidence_threshold: Some(0.8),
            vad_amplitude_threshold: None,
            vad_confidence_threshold: None,
            reason: Some("noisy room".to_string()),
            expires_ms: Some(1000),
        };
        h.adapter
            .handle_message(ServerMessage::ThresholdUpdate(rec), t0)
            .unwrap();
        assert_eq!(h.adapter.stats().threshold_updates, 1);
        assert_eq!(
            h.adapter.stats().last_threshold_reason.as_deref(),
            Some("noisy room")
        );

        let frame = crate::audio::Frame::silent();
        h.detector.process(&frame);
        let (energy, confidence) = h.detector.wake_word().thresholds();
        assert!((energy - 5000.0).abs() < f32::EPSILON);
        assert!((confidence - 0.8).abs() < f32::EPSILON);

        h.adapter.tick(t0 + Duration::from_millis(1001));
        assert_eq!(h.adapter.stats().threshold_reverts, 1);
        h.detector.process(&frame);
        let base = WakeWordConfig::default();
        let (energy, confidence) = h.detector.wake_word().thresholds();
        assert!((energy - base.energy_threshold).abs() < f32::EPSILON);
        assert!((confidence - base.confidence_threshold).abs() < f32::EPSILON);
    }

    #[test]
    fn test_energy_deltas_accumulate_between_stats() {
        let mut h = harness_with(WakeWordConfig {
            enable_adaptation: false,
            ..WakeWordConfig::default()
        });
        let base = WakeWordConfig::default().energy_threshold;
        let frame = crate::audio::Frame::silent();
        for _ in 0..50 {
            h.detector.process(&frame);
        }
        assert_eq!(h.adapter.detector.stats().vad.frames_processed, 50);

        let t0 = Instant::now();
        for detection_id in [1, 2] {
            h.adapter
                .handle_message(
                    ServerMessage::WakeWordValidation {
                        detection_id,
                        validated: true,
                        server_confidence: 0.9,
                        energy_threshold_delta: Some(100.0),
                    },
                    t0,
                )
                .unwrap();
        }
        assert!((h.adapter.current().wake_energy - (base + 200.0)).abs() < f32::EPSILON);

        h.detector.process(&frame);
        let (energy, _) = h.detector.wake_word().thresholds();
        assert!((energy - (base + 200.0)).abs() < f32::EPSILON);

        // next publication carries the applied value
        for _ in 0..49 {
            h.detector.process(&frame);
        }
        assert_eq!(h.adapter.detector.stats().vad.frames_processed, 100);
        assert!((h.adapter.current().wake_energy - (base + 200.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_merged_updates_keep_both_fields() {
        let mut h = harness();
        let t0 = Instant::now();
        let energy_only = ThresholdRecommendation {
            wake_energy_threshold: Some(5000.0),
            wake_confidence_threshold: None,
            vad_amplitude_threshold: None,
            vad_confidence_threshold: None,
            reason: None,
            expires_ms: None,
        };
        let amplitude_only = ThresholdRecommendation {
            wake_energy_threshold: None,
            vad_amplitude_threshold: Some(1500),
            ..energy_only.clone()
        };
        h.adapter
            .handle_message(ServerMessage::ThresholdUpdate(energy_only), t0)
            .unwrap();
        h.adapter
            .handle_message(ServerMessage::ThresholdUpdate(amplitude_only), t0)
            .unwrap();

        h.detector.process(&crate::audio::Frame::silent());
        let (energy, _) = h.detector.wake_word().thresholds();
        assert!((energy - 5000.0).abs() < f32::EPSILON);
        assert_eq!(h.detector.vad().thresholds().0, 1500);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut h = harness();
        let rec = ThresholdRecommendation {
            wake_energy_threshold: Some(0.0),
            wake_confidence_threshold: None,
            vad_amplitude_threshold: None,
            vad_confidence_threshold: None,
            reason: None,
            expires_ms: None,
        };
        assert!(matches!(
            h.adapter
                .handle_message(ServerMessage::ThresholdUpdate(rec), Instant::now()),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(h.adapter.stats().threshold_updates, 0);
    }

    #[test]
    fn test_training_only_when_requested() {
        let mut h = harness();
        let samples = vec![100i16; 16_000];
        assert!(h.adapter.send_training_sample(&samples, true).is_err());

        h.adapter
            .handle_message(
                ServerMessage::TrainingRequest {
                    sample_count: 1,
                    duration_ms: 1000,
                    label: None,
                },
                Instant::now(),
            )
            .unwrap();
        assert!(h.adapter.stats().training_active);

        let chunks = h.adapter.send_training_sample(&samples, true).unwrap();
        assert!(chunks >= 4);
        assert!(h.recorder.kinds().iter().all(|k| *k == "training_sample"));
        assert!(!h.adapter.stats().training_active);
        assert!(h.adapter.send_training_sample(&samples, true).is_err());
    }

    #[test]
    fn test_statistics_request_replies() {
        let mut h = harness();
        h.adapter
            .handle_message(ServerMessage::StatisticsRequest, Instant::now())
            .unwrap();
        assert_eq!(h.recorder.kinds(), vec!["statistics"]);
        assert_eq!(h.adapter.stats().statistics_reports, 1);
    }

    #[test]
    fn test_statistics_carry_stream_and_playback() {
        let h = harness();
        let (sink, _source, control) = crate::audio::playback_ring(8);
        let (_detector, detector_handle) =
            Detector::new(VadConfig::default(), WakeWordConfig::default(), 4).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let (_player, player) = crate::playback::Player::new(
            crate::config::PlaybackConfig::default(),
            sink,
            control,
            detector_handle,
            tx,
        );
        player
            .handle_message(ServerMessage::TtsStart(crate::transport::TtsSessionStart {
                session_id: "reply-7".to_string(),
                total_chunks_expected: 3,
                total_samples: 960,
                estimated_duration_ms: 60,
                sample_rate: crate::audio::SAMPLE_RATE,
                playback: crate::transport::messages::PlaybackSettings::default(),
                response_text: None,
            }))
            .unwrap();

        let mut adapter = h
            .adapter
            .with_datagram_stats(Arc::new(DatagramStats::default()))
            .with_player(player.clone());
        adapter
            .handle_message(ServerMessage::StatisticsRequest, Instant::now())
            .unwrap();
        assert_eq!(h.recorder.kinds(), vec!["statistics", "playback_status"]);

        let sent = h.recorder.0.lock().unwrap();
        let stats = serde_json::to_value(&sent[0]).unwrap();
        assert_eq!(stats["stream_stats"]["packets_sent"], 0);
        assert!(stats["stream_stats"]["avg_send_us"].is_number());

        match &sent[1] {
            ClientMessage::PlaybackStatus {
                session_id,
                playback_state,
                dropouts,
                ..
            } => {
                assert_eq!(session_id, "reply-7");
                assert_eq!(*playback_state, player.status().state);
                assert_eq!(*dropouts, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        let status = serde_json::to_value(&sent[1]).unwrap();
        assert!(status["playback_state"].is_string());
        assert_eq!(status["dropouts"], 0);
    }
}

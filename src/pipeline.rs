//! Tasks that move audio and messages between components
//!
//! - [`AudioTask`]: capture ring, detector, datagram sender
//! - [`EventRouter`]: reliable channel events to the player, the feedback
//!   adapter and the coordinator
//! - [`EndpointFollower`]: best discovered server to the transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::Error;
use crate::audio::{CaptureSource, FRAME_SAMPLES, FRAME_WAIT, Frame, SAMPLE_RATE};
use crate::coordinator::CoordinatorEvent;
use crate::discovery::ServerEndpoint;
use crate::feedback::{FeedbackHandle, MessageSink};
use crate::observability::Telemetry;
use crate::playback::PlayerHandle;
use crate::shutdown::Shutdown;
use crate::transport::messages::timestamp_ms;
use crate::transport::{
    ChannelEvent, ChannelHandle, ClientMessage, DatagramSender, SendOutcome, ServerMessage,
    control_url,
};
use crate::vad::{DetectionResult, Detector};

fn notify(coordinator: &mpsc::Sender<CoordinatorEvent>, event: CoordinatorEvent) {
    if let Err(e) = coordinator.try_send(event) {
        tracing::debug!(error = %e, "coordinator queue full, event dropped");
    }
}

/// Collects one utterance per training request window
#[derive(Debug, Default)]
struct TrainingRecorder {
    samples: Vec<i16>,
    recording: bool,
}

impl TrainingRecorder {
    /// Returns a finished sample once `duration_ms` of speech is captured
    fn on_frame(
        &mut self,
        duration_ms: Option<u32>,
        frame: &Frame,
        result: &DetectionResult,
    ) -> Option<Vec<i16>> {
        let Some(duration_ms) = duration_ms else {
            if self.recording {
                self.recording = false;
                self.samples.clear();
            }
            return None;
        };

        if !self.recording && result.speech_started {
            self.recording = true;
            self.samples.clear();
        }
        if !self.recording {
            return None;
        }

        self.samples.extend_from_slice(frame.samples());
        let wanted = duration_ms as usize * SAMPLE_RATE as usize / 1000;
        if self.samples.len() >= wanted {
            self.recording = false;
            return Some(std::mem::take(&mut self.samples));
        }
        None
    }
}

/// Speech edges and voiced PCM mirrored onto the reliable channel
struct VoiceStream {
    sink: Box<dyn MessageSink>,
    device_id: String,
    batch_samples: usize,
    pending: Vec<i16>,
    sequence: u32,
    active: bool,
}

impl VoiceStream {
    fn new(sink: Box<dyn MessageSink>, device_id: &str, batch_frames: usize) -> Self {
        let batch_samples = batch_frames.max(1) * FRAME_SAMPLES;
        Self {
            sink,
            device_id: device_id.to_string(),
            batch_samples,
            pending: Vec::with_capacity(batch_samples),
            sequence: 0,
            active: false,
        }
    }

    /// A segment opens on speech start while connected and closes on the
    /// frame the detector leaves it
    fn on_frame(&mut self, frame: &Frame, result: &DetectionResult) {
        if result.speech_started && !self.active {
            if !self.sink.is_connected() {
                return;
            }
            self.active = true;
            self.pending.clear();
            self.send(ClientMessage::VoiceDetected {
                device_id: self.device_id.clone(),
                confidence: result.confidence,
                max_amplitude: result.max_amplitude,
                snr_db: result.snr_db,
                timestamp: timestamp_ms(),
            });
        }
        if !self.active {
            return;
        }

        self.pending.extend_from_slice(frame.samples());
        if self.pending.len() >= self.batch_samples {
            self.flush();
        }

        if !result.in_segment {
            self.flush();
            self.active = false;
            self.send(ClientMessage::VoiceEnded {
                device_id: self.device_id.clone(),
                duration_ms: result.voice_duration_ms,
                timestamp: timestamp_ms(),
            });
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let message = ClientMessage::audio_stream(&self.device_id, self.sequence, &self.pending);
        self.sequence = self.sequence.wrapping_add(1);
        self.pending.clear();
        self.send(message);
    }

    fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if let Err(e) = self.sink.send(message) {
            tracing::debug!(kind, error = %e, "voice stream message dropped");
        }
    }
}

/// Capture to detector to datagram, one frame at a time
pub struct AudioTask {
    capture: CaptureSource,
    detector: Detector,
    sender: DatagramSender,
    target: watch::Receiver<Option<SocketAddr>>,
    has_target: bool,
    coordinator: mpsc::Sender<CoordinatorEvent>,
    feedback: FeedbackHandle,
    telemetry: Arc<Telemetry>,
    training: TrainingRecorder,
    voice: Option<VoiceStream>,
    faulted: bool,
}

impl AudioTask {
    #[must_use]
    pub fn new(
        capture: CaptureSource,
        detector: Detector,
        sender: DatagramSender,
        target: watch::Receiver<Option<SocketAddr>>,
        coordinator: mpsc::Sender<CoordinatorEvent>,
        feedback: FeedbackHandle,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            capture,
            detector,
            sender,
            target,
            has_target: false,
            coordinator,
            feedback,
            telemetry,
            training: TrainingRecorder::default(),
            voice: None,
            faulted: false,
        }
    }

    /// Mirror speech segments onto the reliable channel, `batch_frames`
    /// frames per `audio_stream` message
    #[must_use]
    pub fn with_voice_stream(
        mut self,
        sink: Box<dyn MessageSink>,
        device_id: &str,
        batch_frames: usize,
    ) -> Self {
        self.voice = Some(VoiceStream::new(sink, device_id, batch_frames));
        self
    }

    /// Classify, transmit and report one captured frame
    pub fn process_frame(&mut self, frame: &Frame, delivered: Instant) -> DetectionResult {
        let (result, wake) = self.detector.process(frame);

        if self.has_target {
            match self
                .sender
                .send_frame(frame, &result, wake.as_ref(), timestamp_ms())
            {
                Ok(SendOutcome::Sent { .. } | SendOutcome::Suppressed) => {}
                Ok(SendOutcome::Dropped { sequence }) => {
                    tracing::trace!(sequence, "datagram dropped");
                }
                Err(e) => tracing::debug!(error = %e, "datagram send failed"),
            }
        }
        self.telemetry.record_frame(delivered.elapsed(), result.rms);

        if result.speech_started {
            notify(&self.coordinator, CoordinatorEvent::SpeechStarted);
        }
        if result.speech_ended {
            notify(&self.coordinator, CoordinatorEvent::SpeechEnded);
        }
        if let Some(voice) = self.voice.as_mut() {
            voice.on_frame(frame, &result);
        }

        if let Some(event) = wake {
            let detection_id = event.detection_id;
            tracing::info!(
                detection_id,
                confidence = event.confidence,
                "local wake word trigger"
            );
            if let Err(e) = self.feedback.report_wake_word(event, &result) {
                tracing::warn!(detection_id, error = %e, "wake word report dropped");
            }
            notify(
                &self.coordinator,
                CoordinatorEvent::LocalWakeWord { detection_id },
            );
        }

        if let Some(sample) =
            self.training
                .on_frame(self.feedback.training_duration_ms(), frame, &result)
            && let Err(e) = self.feedback.submit_training(sample, true)
        {
            tracing::warn!(error = %e, "training sample dropped");
        }

        result
    }

    fn apply_target(&mut self) {
        let target = *self.target.borrow_and_update();
        match target {
            Some(addr) => {
                self.sender.set_target(addr);
                self.has_target = true;
            }
            None => self.has_target = false,
        }
    }

    /// Pull frames until shutdown
    pub async fn run(mut self, mut shutdown: Shutdown) {
        self.apply_target();
        let mut target_open = true;

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                changed = self.target.changed(), if target_open => {
                    if changed.is_err() {
                        // Target source gone; keep streaming to the last one
                        target_open = false;
                    } else {
                        self.apply_target();
                    }
                }
                frame = self.capture.next_frame() => match frame {
                    Ok(frame) => {
                        let delivered = Instant::now();
                        self.faulted = false;
                        self.process_frame(&frame, delivered);
                    }
                    Err(Error::TimedOut(_)) => self.telemetry.record_capture_timeout(),
                    Err(e) => {
                        self.telemetry.record_codec_fault();
                        if !self.faulted {
                            self.faulted = true;
                            tracing::error!(error = %e, "capture failed");
                            notify(&self.coordinator, CoordinatorEvent::CodecFault(e.to_string()));
                        }
                        tokio::time::sleep(FRAME_WAIT).await;
                    }
                },
            }
        }

        tracing::debug!("audio task stopped");
    }

    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Dispatches reliable channel events by type
pub struct EventRouter {
    events: mpsc::Receiver<ChannelEvent>,
    player: PlayerHandle,
    feedback: FeedbackHandle,
    coordinator: mpsc::Sender<CoordinatorEvent>,
}

impl EventRouter {
    #[must_use]
    pub const fn new(
        events: mpsc::Receiver<ChannelEvent>,
        player: PlayerHandle,
        feedback: FeedbackHandle,
        coordinator: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            events,
            player,
            feedback,
            coordinator,
        }
    }

    /// Route one event
    pub fn route(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => notify(&self.coordinator, CoordinatorEvent::TransportConnected),
            ChannelEvent::Disconnected { reason } => {
                tracing::info!(reason, "control channel down");
                if self.player.interrupt() {
                    tracing::info!("in-flight tts discarded");
                }
                notify(&self.coordinator, CoordinatorEvent::TransportDisconnected);
            }
            ChannelEvent::ConnectFailed {
                consecutive_failures,
            } => notify(
                &self.coordinator,
                CoordinatorEvent::TransportFailed {
                    consecutive_failures,
                },
            ),
            ChannelEvent::GaveUp => notify(&self.coordinator, CoordinatorEvent::TransportGaveUp),
            ChannelEvent::PeerFault(reason) => tracing::debug!(reason, "server sent a bad frame"),
            ChannelEvent::Message(message) if message.is_tts() => {
                if let Err(e) = self.player.handle_message(message) {
                    tracing::debug!(error = %e, "tts message rejected");
                }
            }
            ChannelEvent::Message(ServerMessage::State { state }) => {
                tracing::debug!(state, "server state");
                if state == "thinking" {
                    notify(&self.coordinator, CoordinatorEvent::ServerThinking);
                }
            }
            ChannelEvent::Message(message) => {
                if let Err(e) = self.feedback.deliver(message) {
                    tracing::warn!(error = %e, "feedback message dropped");
                }
            }
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        tracing::debug!("event router stopped");
    }

    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Points the transport at the best discovered server
pub struct EndpointFollower {
    best: watch::Receiver<Option<ServerEndpoint>>,
    channel: ChannelHandle,
    control_path: String,
    target: watch::Sender<Option<SocketAddr>>,
    coordinator: mpsc::Sender<CoordinatorEvent>,
}

impl EndpointFollower {
    #[must_use]
    pub const fn new(
        best: watch::Receiver<Option<ServerEndpoint>>,
        channel: ChannelHandle,
        control_path: String,
        target: watch::Sender<Option<SocketAddr>>,
        coordinator: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            best,
            channel,
            control_path,
            target,
            coordinator,
        }
    }

    async fn apply(&mut self) {
        let best = self.best.borrow_and_update().clone();

        // Losing every candidate keeps the current server; the channel's own
        // reconnect logic decides whether it is really gone
        let Some(endpoint) = best else {
            if self.channel.endpoint().is_none() {
                notify(&self.coordinator, CoordinatorEvent::Searching);
            }
            return;
        };

        match tokio::net::lookup_host((endpoint.host.as_str(), endpoint.audio_port)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    self.target.send_replace(Some(addr));
                }
            }
            Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "cannot resolve audio target"),
        }

        self.channel.set_endpoint(Some(control_url(
            &endpoint.host,
            endpoint.control_port,
            &self.control_path,
        )));
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        self.apply().await;
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                changed = self.best.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply().await;
                }
            }
        }
    }

    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Result;

    #[derive(Clone, Default)]
    struct Sent {
        messages: Arc<Mutex<Vec<ClientMessage>>>,
        offline: bool,
    }

    impl MessageSink for Sent {
        fn send(&self, message: ClientMessage) -> Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.offline
        }
    }

    fn segment() -> Vec<DetectionResult> {
        let voiced = DetectionResult {
            voice_active: true,
            in_segment: true,
            ..DetectionResult::default()
        };
        vec![
            DetectionResult {
                speech_started: true,
                confidence: 0.8,
                max_amplitude: 4000,
                snr_db: 20.0,
                ..voiced
            },
            voiced,
            voiced,
            DetectionResult {
                speech_ended: true,
                voice_duration_ms: 60,
                ..DetectionResult::default()
            },
        ]
    }

    fn frame(value: i16) -> Frame {
        Frame::from_slice(&[value; crate::audio::FRAME_SAMPLES]).unwrap()
    }

    #[test]
    fn test_training_recorder_waits_for_speech() {
        let mut rec = TrainingRecorder::default();
        let quiet = DetectionResult::default();
        let start = DetectionResult {
            speech_started: true,
            voice_active: true,
            ..DetectionResult::default()
        };

        assert!(rec.on_frame(Some(60), &frame(1), &quiet).is_none());
        assert!(rec.on_frame(Some(60), &frame(2), &start).is_none());
        assert!(rec.on_frame(Some(60), &frame(3), &quiet).is_none());
        let sample = rec.on_frame(Some(60), &frame(4), &quiet).unwrap();

        assert_eq!(sample.len(), 3 * crate::audio::FRAME_SAMPLES);
        assert_eq!(sample[0], 2);
        assert_eq!(*sample.last().unwrap(), 4);
    }

    #[test]
    fn test_training_recorder_idle_without_mode() {
        let mut rec = TrainingRecorder::default();
        let start = DetectionResult {
            speech_started: true,
            ..DetectionResult::default()
        };
        assert!(rec.on_frame(None, &frame(1), &start).is_none());
        assert!(!rec.recording);
    }

    #[test]
    fn test_voice_stream_batches_segment() {
        let sent = Sent::default();
        let mut stream = VoiceStream::new(Box::new(sent.clone()), "vt", 2);
        for (i, result) in segment().iter().enumerate() {
            stream.on_frame(&frame(i16::try_from(i).unwrap()), result);
        }

        let messages = sent.messages.lock().unwrap();
        let kinds: Vec<_> = messages.iter().map(ClientMessage::kind).collect();
        assert_eq!(
            kinds,
            vec!["voice_detected", "audio_stream", "audio_stream", "voice_ended"]
        );
        match &messages[0] {
            ClientMessage::VoiceDetected {
                max_amplitude,
                confidence,
                ..
            } => {
                assert_eq!(*max_amplitude, 4000);
                assert!((confidence - 0.8).abs() < f32::EPSILON);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &messages[2] {
            ClientMessage::AudioStream {
                sequence, samples, ..
            } => {
                assert_eq!(*sequence, 1);
                assert_eq!(*samples, 2 * crate::audio::FRAME_SAMPLES);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            messages[3],
            ClientMessage::VoiceEnded { duration_ms: 60, .. }
        ));
        drop(messages);
        assert!(!stream.active);
    }

    #[test]
    fn test_voice_stream_flushes_partial_batch() {
        let sent = Sent::default();
        let mut stream = VoiceStream::new(Box::new(sent.clone()), "vt", 10);
        for result in segment() {
            stream.on_frame(&frame(7), &result);
        }

        let messages = sent.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages[1],
            ClientMessage::AudioStream { sequence: 0, samples, .. }
                if samples == 4 * crate::audio::FRAME_SAMPLES
        ));
    }

    #[test]
    fn test_voice_stream_idle_while_offline() {
        let sent = Sent {
            offline: true,
            ..Sent::default()
        };
        let mut stream = VoiceStream::new(Box::new(sent.clone()), "vt", 2);
        for result in segment() {
            stream.on_frame(&frame(1), &result);
        }
        assert!(sent.messages.lock().unwrap().is_empty());
    }
}

//! Conversation flow integration tests
//!
//! Drives the coordinator with the real player, feedback adapter and
//! audio rings. Hardware and network are replaced by the ring ends and a
//! recording message sink.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use voice_terminal::Config;
use voice_terminal::audio::{
    CaptureControl, FRAME_SAMPLES, PlaybackSource, capture_ring, playback_ring,
};
use voice_terminal::config::{PlaybackConfig, WakeWordConfig};
use voice_terminal::coordinator::{
    ConversationState, Coordinator, CoordinatorEvent, DevicePeripherals, DisplayState,
};
use voice_terminal::feedback::{FeedbackAdapter, FeedbackEvent};
use voice_terminal::pipeline::EventRouter;
use voice_terminal::playback::{PlaybackEvent, PlaybackState, Player, PlayerHandle};
use voice_terminal::transport::messages::{PlaybackActions, PlaybackSettings};
use voice_terminal::transport::{
    ChannelEvent, ClientMessage, ServerMessage, TtsChunk, TtsSessionEnd, TtsSessionStart,
};
use voice_terminal::vad::{DetectionResult, Detector, WakeWordDetector};

mod common;
use common::{Panel, SentMessages, wake_phrase};

struct Terminal {
    coordinator: Coordinator,
    player: Player,
    player_handle: PlayerHandle,
    playback_events: mpsc::Receiver<PlaybackEvent>,
    speaker: PlaybackSource,
    microphone: CaptureControl,
}

impl Terminal {
    fn new() -> Self {
        let mut config = Config::default();
        config.audio.auto_start_after_tts = true;

        let (_producer, _source, microphone) = capture_ring(8);
        let (sink, speaker, playback_control) = playback_ring(8);
        let (_detector, detector_handle) =
            Detector::new(config.vad.clone(), config.wake_word.clone(), 8).unwrap();
        let (playback_tx, playback_events) = mpsc::channel(32);
        let playback = PlaybackConfig {
            start_threshold_ms: 20,
            default_fade_in_ms: 0,
            default_fade_out_ms: 0,
            ..PlaybackConfig::default()
        };
        let (player, player_handle) = Player::new(
            playback,
            sink,
            playback_control.clone(),
            detector_handle.clone(),
            playback_tx,
        );
        let peripherals = DevicePeripherals::new(
            microphone.clone(),
            playback_control,
            detector_handle,
            player_handle.clone(),
        );
        let coordinator = Coordinator::new(&config, Box::new(peripherals));
        coordinator.handle_event(CoordinatorEvent::TransportConnected, Instant::now());

        Self {
            coordinator,
            player,
            player_handle,
            playback_events,
            speaker,
            microphone,
        }
    }

    /// Hand pending playback events to the coordinator
    fn forward(&mut self) -> Vec<PlaybackEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.playback_events.try_recv() {
            if let Some(next) = CoordinatorEvent::from_playback(&event) {
                self.coordinator.handle_event(next, Instant::now());
            }
            seen.push(event);
        }
        seen
    }

    /// One frame period: pump, forward events, let the speaker pull
    fn frame_period(&mut self) -> Option<i16> {
        self.player.tick();
        self.forward();
        let mut out = vec![0i16; FRAME_SAMPLES];
        (self.speaker.fill(&mut out) > 0).then_some(out[0])
    }

    /// Router feeding this terminal's player, plus the coordinator events
    /// it emits
    fn router(&self) -> (EventRouter, mpsc::Receiver<CoordinatorEvent>) {
        let config = Config::default();
        let (_detector, detector_handle) =
            Detector::new(config.vad.clone(), config.wake_word.clone(), 8).unwrap();
        let (feedback_tx, _feedback_rx) = mpsc::channel(16);
        let (_adapter, feedback) = FeedbackAdapter::new(
            &config,
            Box::new(SentMessages::default()),
            detector_handle,
            feedback_tx,
        );
        let (_events_tx, events) = mpsc::channel(16);
        let (coordinator_tx, coordinator_rx) = mpsc::channel(16);
        let router = EventRouter::new(
            events,
            self.player_handle.clone(),
            feedback,
            coordinator_tx,
        );
        (router, coordinator_rx)
    }

    fn reach_processing(&mut self) {
        let now = Instant::now();
        self.coordinator
            .handle_event(CoordinatorEvent::UserTrigger, now);
        assert!(self.microphone.is_enabled());
        assert_eq!(
            self.coordinator
                .handle_event(CoordinatorEvent::SpeechEnded, now),
            ConversationState::Processing
        );
        assert!(!self.microphone.is_enabled());
    }
}

fn tts_start(chunks: u32) -> ServerMessage {
    ServerMessage::TtsStart(TtsSessionStart {
        session_id: "reply-1".to_string(),
        total_chunks_expected: chunks,
        total_samples: chunks * FRAME_SAMPLES as u32,
        estimated_duration_ms: chunks * 20,
        sample_rate: 16_000,
        playback: PlaybackSettings {
            fade_in_ms: 0,
            fade_out_ms: 0,
            ..PlaybackSettings::default()
        },
        response_text: Some("It is sunny".to_string()),
    })
}

fn tts_chunk(sequence: u32) -> ServerMessage {
    let value = i16::try_from(sequence + 1).unwrap() * 100;
    ServerMessage::TtsChunk(TtsChunk {
        session_id: "reply-1".to_string(),
        sequence,
        is_final: false,
        checksum: 0,
        start_ms: sequence * 20,
        duration_ms: 20,
        samples: vec![value; FRAME_SAMPLES],
    })
}

#[test]
fn test_wake_word_round_trip() {
    let config = Config::default();
    let (mut detector, detector_handle) =
        Detector::new(config.vad.clone(), config.wake_word.clone(), 8).unwrap();
    let sent = SentMessages::default();
    let (feedback_tx, mut feedback_events) = mpsc::channel(16);
    let (mut adapter, _handle) = FeedbackAdapter::new(
        &config,
        Box::new(sent.clone()),
        detector_handle,
        feedback_tx,
    );
    let panel = Panel::default();
    let coordinator = Coordinator::new(&config, Box::new(panel.clone()));
    let t0 = Instant::now();
    coordinator.handle_event(CoordinatorEvent::TransportConnected, t0);

    // Local trigger
    let mut wake = WakeWordDetector::new(WakeWordConfig::default()).unwrap();
    let loud = DetectionResult {
        energy_detected: true,
        voice_active: true,
        ..DetectionResult::default()
    };
    let event = wake_phrase()
        .iter()
        .find_map(|frame| {
            let vad = if frame.rms() > 1000.0 {
                loud
            } else {
                DetectionResult::default()
            };
            wake.process(frame, &vad)
        })
        .expect("wake phrase detected");
    let detection_id = event.detection_id;

    adapter.report_wake_word(&event, true, 18.0, t0).unwrap();
    match sent.all().as_slice() {
        [ClientMessage::WakeWordDetected { detection_id: id, syllable_count, .. }] => {
            assert_eq!(*id, detection_id);
            assert_eq!(*syllable_count, 3);
        }
        other => panic!("unexpected outbound {other:?}"),
    }

    // Connected: only the server verdict opens the conversation
    assert_eq!(
        coordinator.handle_event(CoordinatorEvent::LocalWakeWord { detection_id }, t0),
        ConversationState::Idle
    );

    adapter
        .handle_message(
            ServerMessage::WakeWordValidation {
                detection_id,
                validated: true,
                server_confidence: 0.93,
                energy_threshold_delta: None,
            },
            t0 + Duration::from_millis(180),
        )
        .unwrap();
    assert_eq!(adapter.stats().true_positives, 1);
    assert_eq!(adapter.stats().pending, 0);

    let confirmed = feedback_events.try_recv().unwrap();
    assert_eq!(confirmed, FeedbackEvent::WakeWordConfirmed { detection_id });
    let next = CoordinatorEvent::from_feedback(&confirmed).unwrap();
    assert_eq!(
        coordinator.handle_event(next, t0 + Duration::from_millis(180)),
        ConversationState::Listening
    );
    let panel_state = panel.snapshot();
    assert!(panel_state.microphone);
    assert_eq!(panel_state.display, Some(DisplayState::Listening));

    // The detector sees the verdict at its next frame
    detector.process(&voice_terminal::audio::Frame::silent());
    assert_eq!(detector.wake_word().stats().true_positives, 1);
}

#[test]
fn test_tts_session_out_of_order() {
    let mut terminal = Terminal::new();
    terminal.reach_processing();

    let handle = terminal.player_handle.clone();
    handle.handle_message(tts_start(4)).unwrap();
    for sequence in [0, 2, 1, 3] {
        handle.handle_message(tts_chunk(sequence)).unwrap();
    }
    handle
        .handle_message(ServerMessage::TtsEnd(TtsSessionEnd {
            session_id: "reply-1".to_string(),
            total_chunks_sent: 4,
            actions: PlaybackActions {
                fade_out_ms: 0,
                return_to_listening: true,
                cooldown_period_ms: 0,
            },
        }))
        .unwrap();

    terminal.forward();
    assert_eq!(terminal.coordinator.state(), ConversationState::Speaking);

    let played: Vec<i16> = (0..12).filter_map(|_| terminal.frame_period()).collect();

    assert_eq!(played, vec![100, 200, 300, 400]);
    let status = handle.status();
    assert_eq!(status.chunks_played, 4);
    assert_eq!(status.underruns, 0);
    assert_eq!(status.state, PlaybackState::Finished);
    assert_eq!(status.sessions_completed, 1);

    // Drained with return_to_listening and no cooldown
    assert_eq!(terminal.coordinator.state(), ConversationState::Listening);
    assert!(terminal.microphone.is_enabled());
    assert_eq!(terminal.coordinator.stats().sessions_completed, 1);
}

#[test]
fn test_interrupt_during_speaking() {
    let mut terminal = Terminal::new();
    terminal.reach_processing();

    let handle = terminal.player_handle.clone();
    handle.handle_message(tts_start(6)).unwrap();
    for sequence in 0..6 {
        handle.handle_message(tts_chunk(sequence)).unwrap();
    }
    terminal.forward();
    assert_eq!(terminal.coordinator.state(), ConversationState::Speaking);

    assert_eq!(terminal.frame_period(), Some(100));
    let mic_before = terminal.microphone.is_enabled();

    assert_eq!(
        terminal
            .coordinator
            .handle_event(CoordinatorEvent::Interrupt, Instant::now()),
        ConversationState::Idle
    );

    // Within one frame period the speaker only produces silence
    terminal.player.tick();
    let events = terminal.forward();
    assert!(events.contains(&PlaybackEvent::Interrupted));
    for _ in 0..4 {
        assert_eq!(terminal.frame_period(), None);
    }

    let status = handle.status();
    assert!(status.chunks_played < 6);
    assert_eq!(status.sessions_interrupted, 1);
    assert_eq!(terminal.microphone.is_enabled(), mic_before);
    assert_eq!(terminal.coordinator.state(), ConversationState::Idle);
    assert_eq!(terminal.coordinator.stats().sessions_interrupted, 1);
}

#[test]
fn test_disconnect_discards_inflight_tts() {
    let mut terminal = Terminal::new();
    terminal.reach_processing();
    let (router, mut coordinator_events) = terminal.router();

    router.route(ChannelEvent::Message(tts_start(4)));
    for sequence in 0..3 {
        router.route(ChannelEvent::Message(tts_chunk(sequence)));
    }
    terminal.forward();
    assert_eq!(terminal.coordinator.state(), ConversationState::Speaking);
    assert_eq!(terminal.frame_period(), Some(100));

    router.route(ChannelEvent::Disconnected {
        reason: "server closed".to_string(),
    });

    // Cut before the pump runs again
    let status = terminal.player_handle.status();
    assert_eq!(status.buffer_level_ms, 0);
    assert_eq!(status.state, PlaybackState::Finished);
    assert_eq!(status.sessions_interrupted, 1);

    while let Ok(event) = coordinator_events.try_recv() {
        terminal.coordinator.handle_event(event, Instant::now());
    }
    terminal.player.tick();
    let events = terminal.forward();
    assert!(events.contains(&PlaybackEvent::Interrupted));
    for _ in 0..4 {
        assert_eq!(terminal.frame_period(), None);
    }

    assert!(terminal.player_handle.status().chunks_played < 3);
    assert_eq!(terminal.coordinator.state(), ConversationState::Idle);
    assert!(!terminal.coordinator.stats().connected);
}

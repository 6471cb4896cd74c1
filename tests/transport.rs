//! Transport integration tests
//!
//! Datagrams go to a local UDP socket; the reliable channel talks to an
//! in-process WebSocket server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use voice_terminal::Config;
use voice_terminal::audio::{FRAME_SAMPLES, Frame, capture_ring};
use voice_terminal::config::{FeedbackConfig, TransportConfig, VadConfig, WakeWordConfig};
use voice_terminal::coordinator::CoordinatorEvent;
use voice_terminal::feedback::FeedbackAdapter;
use voice_terminal::observability::Telemetry;
use voice_terminal::pipeline::AudioTask;
use voice_terminal::shutdown::shutdown_channel;
use voice_terminal::transport::{
    ChannelEvent, ClientMessage, ConnectionState, DatagramSender, DeviceIdentity, ReliableChannel,
    SendOutcome, control_url, decode_packet,
};
use voice_terminal::vad::{ConversationContext, DetectionResult, Detector};

mod common;
use common::constant;

const WAIT: Duration = Duration::from_secs(5);

async fn sender(interval_ms: u32) -> (DatagramSender, UdpSocket) {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
        silence_suppression: true,
        silence_packet_interval_ms: interval_ms,
        ..TransportConfig::default()
    };
    let sender = DatagramSender::bind(receiver.local_addr().unwrap(), &config)
        .await
        .unwrap();
    (sender, receiver)
}

/// Feed 10 s of silence, returning frames put on the wire
fn feed_silence(sender: &mut DatagramSender) -> usize {
    let frame = Frame::silent();
    let silence = DetectionResult::default();
    (0..500u64)
        .filter(|i| {
            matches!(
                sender.send_frame(&frame, &silence, None, i * 20).unwrap(),
                SendOutcome::Sent { .. } | SendOutcome::Dropped { .. }
            )
        })
        .count()
}

#[tokio::test]
async fn test_silence_thinned_to_one_per_second() {
    let (mut sender, _receiver) = sender(1000).await;

    let emitted = feed_silence(&mut sender);

    let stats = sender.stats().snapshot();
    assert!(emitted <= 11, "emitted {emitted}");
    assert!(stats.packets_suppressed >= 489);
    assert_eq!(stats.voice_packets, 0);
}

#[tokio::test]
async fn test_silence_rate_bounded_by_interval() {
    let (mut sender, _receiver) = sender(500).await;

    let emitted = feed_silence(&mut sender);

    // At most ceil(1000 / 500) per second over 10 s
    assert!(emitted <= 20, "emitted {emitted}");
    assert_eq!(
        sender.stats().snapshot().packets_suppressed,
        500 - emitted as u64
    );
}

#[tokio::test]
async fn test_voice_frames_always_reach_receiver() {
    let (mut sender, receiver) = sender(1000).await;
    let voice = DetectionResult {
        voice_active: true,
        speech_started: true,
        confidence: 0.9,
        high_confidence: true,
        ..DetectionResult::default()
    };
    let mut frame = Frame::silent();
    frame.samples_mut()[0] = 1234;

    let outcome = sender.send_frame(&frame, &voice, None, 0).unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { sequence: 0, .. }));

    let mut buf = [0u8; 2048];
    let len = tokio::time::timeout(WAIT, receiver.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let packet = decode_packet(&buf[..len]).unwrap();
    assert_eq!(packet.sequence, 0);
    assert_eq!(packet.samples[0], 1234);
    assert_eq!(sender.stats().snapshot().high_confidence_packets, 1);
}

/// Accept two connections, forwarding every text frame; the first
/// connection is dropped right after its opening message
async fn flaky_server(listener: TcpListener, frames: mpsc::UnboundedSender<(u32, String)>) {
    for round in 0..2u32 {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = frames.send((round, text.to_string()));
            }
            if round == 0 {
                break;
            }
        }
        drop(ws);
    }
}

fn message_type(text: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(text).unwrap();
    value["type"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_reconnect_resends_session_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    tokio::spawn(flaky_server(listener, frames_tx));

    let config = TransportConfig::default();
    let identity = DeviceIdentity::from_config(&FeedbackConfig::default(), "audio,vad");
    let (trigger, shutdown) = shutdown_channel();
    let (channel, handle, mut events) = ReliableChannel::new(
        &config,
        identity,
        Some(control_url("127.0.0.1", port, &config.control_path)),
        shutdown,
    );
    let mut state = handle.subscribe_state();
    let task = channel.spawn();

    let (round, hello) = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(round, 0);
    assert_eq!(message_type(&hello), "session_start");

    // Dropped by the server: back off starting at the initial delay
    let backoff = *tokio::time::timeout(
        WAIT,
        state.wait_for(|s| matches!(s, ConnectionState::Backoff { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    match backoff {
        ConnectionState::Backoff { delay_ms, .. } => {
            assert!((1000..=1250).contains(&delay_ms), "delay {delay_ms}");
        }
        other => panic!("unexpected state {other:?}"),
    }

    // Audio keeps flowing and control messages queue without blocking
    let (mut audio, _receiver) = sender(1000).await;
    let voice = DetectionResult {
        voice_active: true,
        ..DetectionResult::default()
    };
    assert!(matches!(
        audio.send_frame(&Frame::silent(), &voice, None, 0).unwrap(),
        SendOutcome::Sent { .. }
    ));
    tokio_test::assert_ok!(handle.send(ClientMessage::Ping {
        device_id: "vt-test".to_string(),
        timestamp: 1,
    }));

    let (round, hello) = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(round, 1);
    assert_eq!(message_type(&hello), "session_start");
    let (_, queued) = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(message_type(&queued), "ping");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.first(), Some(&ChannelEvent::Connected));
    assert!(
        seen.iter()
            .any(|e| matches!(e, ChannelEvent::Disconnected { .. }))
    );
    assert_eq!(
        seen.iter()
            .filter(|e| **e == ChannelEvent::Connected)
            .count(),
        2
    );
    assert_eq!(handle.stats().connections, 2);

    trigger.trigger();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

/// Accept one connection, forwarding every text frame
async fn recording_server(listener: TcpListener, frames: mpsc::UnboundedSender<String>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let _ = frames.send(text.to_string());
        }
    }
}

#[tokio::test]
async fn test_speech_segment_mirrored_on_control_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    tokio::spawn(recording_server(listener, frames_tx));

    let config = Config::default();
    let identity = DeviceIdentity::from_config(&config.feedback, "audio,vad");
    let (trigger, shutdown) = shutdown_channel();
    let (channel, handle, _events) = ReliableChannel::new(
        &config.transport,
        identity,
        Some(control_url("127.0.0.1", port, &config.transport.control_path)),
        shutdown,
    );
    let mut state = handle.subscribe_state();
    let task = channel.spawn();
    tokio::time::timeout(
        WAIT,
        state.wait_for(|s| matches!(s, ConnectionState::Connected)),
    )
    .await
    .unwrap()
    .unwrap();

    let vad = VadConfig {
        amplitude_threshold: 2000,
        silence_threshold_ms: 1000,
        ..VadConfig::conversation()
    };
    let (detector, detector_handle) = Detector::new(vad, WakeWordConfig::default(), 8).unwrap();
    detector_handle.set_context(ConversationContext::Listening);
    let (_producer, capture, _control) = capture_ring(8);
    let (datagrams, _receiver) = sender(100).await;
    let (_target_tx, target) = watch::channel(None);
    let (coordinator_tx, mut coordinator_rx) = mpsc::channel(256);
    let (feedback_tx, _feedback_rx) = mpsc::channel(16);
    let (_adapter, feedback) = FeedbackAdapter::new(
        &config,
        Box::new(handle.clone()),
        detector_handle,
        feedback_tx,
    );
    let mut audio = AudioTask::new(
        capture,
        detector,
        datagrams,
        target,
        coordinator_tx,
        feedback,
        Arc::new(Telemetry::new()),
    )
    .with_voice_stream(Box::new(handle.clone()), "vt-test", 10);

    let mut speech = constant(50, 50);
    speech.extend(constant(4000, 30));
    speech.extend(constant(50, 100));
    for frame in &speech {
        audio.process_frame(frame, Instant::now());
    }

    let mut voice = Vec::new();
    loop {
        let text = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        match value["type"].as_str().unwrap_or_default() {
            "voice_detected" | "audio_stream" => voice.push(value),
            "voice_ended" => {
                voice.push(value);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(voice[0]["type"], "voice_detected");
    assert_eq!(voice[0]["device_id"], "vt-test");
    assert!(voice[0]["max_amplitude"].as_u64().unwrap() >= 2000);

    let batches = &voice[1..voice.len() - 1];
    assert!(batches.len() >= 3, "{} batches", batches.len());
    let mut streamed = 0;
    for (i, batch) in batches.iter().enumerate() {
        assert_eq!(batch["type"], "audio_stream");
        assert_eq!(batch["sequence"].as_u64().unwrap(), i as u64);
        streamed += batch["samples"].as_u64().unwrap();
    }
    assert_eq!(streamed % FRAME_SAMPLES as u64, 0);
    assert!(streamed >= 30 * FRAME_SAMPLES as u64);

    let ended = &voice[voice.len() - 1];
    assert!(ended["duration_ms"].as_u64().unwrap() >= 400);

    let mut edges = Vec::new();
    while let Ok(event) = coordinator_rx.try_recv() {
        if matches!(
            event,
            CoordinatorEvent::SpeechStarted | CoordinatorEvent::SpeechEnded
        ) {
            edges.push(event);
        }
    }
    assert_eq!(
        edges,
        vec![CoordinatorEvent::SpeechStarted, CoordinatorEvent::SpeechEnded]
    );
    assert!(handle.stats().messages_sent >= 4);

    trigger.trigger();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

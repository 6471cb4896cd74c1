//! Playback pump
//!
//! The network task feeds chunks through a [`PlayerHandle`]; the pump
//! moves one frame per period from the jitter buffer into the speaker
//! ring and publishes the echo level to the detector. An interrupt drops
//! the buffered session at once; the speaker ring is flushed by the pump
//! on its next period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::jitter::{ChunkOutcome, JitterBuffer, PlaybackStatus, Pull};
use crate::audio::{FRAME_WAIT, PlaybackControl, PlaybackSink};
use crate::config::PlaybackConfig;
use crate::shutdown::Shutdown;
use crate::transport::ServerMessage;
use crate::transport::messages::PlaybackActions;
use crate::vad::DetectorHandle;
use crate::{Error, Result};

/// Frames kept queued in the speaker ring ahead of the driver
const LEAD_FRAMES: usize = 2;

/// Playback milestones for the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    SessionStarted { session_id: String },
    /// First chunk of a session accepted
    FirstChunk { session_id: String },
    /// Session fully played and the speaker ring is empty
    Drained {
        session_id: String,
        actions: Option<PlaybackActions>,
    },
    Interrupted,
}

/// Shared entry point into the jitter buffer
#[derive(Clone)]
pub struct PlayerHandle {
    buffer: Arc<Mutex<JitterBuffer>>,
    interrupt: Arc<AtomicBool>,
    events: mpsc::Sender<PlaybackEvent>,
}

impl PlayerHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, JitterBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a TTS message to the buffer
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for non-TTS messages and
    /// `Error::RemotePeer` for chunks or session ends the buffer rejects
    pub fn handle_message(&self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::TtsStart(start) => {
                self.lock().start_session(&start);
                self.emit(PlaybackEvent::SessionStarted {
                    session_id: start.session_id,
                });
                Ok(())
            }
            ServerMessage::TtsChunk(chunk) => {
                let session_id = chunk.session_id.clone();
                let outcome = self.lock().accept_chunk(chunk)?;
                if outcome == (ChunkOutcome::Accepted { first: true }) {
                    self.emit(PlaybackEvent::FirstChunk { session_id });
                }
                Ok(())
            }
            ServerMessage::TtsEnd(end) => self.lock().end_session(end),
            other => Err(Error::InvalidInput(format!(
                "not a tts message: {other:?}"
            ))),
        }
    }

    /// Discard the current session and stop the speaker at the next
    /// frame boundary
    ///
    /// Returns whether a session was cut.
    pub fn interrupt(&self) -> bool {
        let cut = self.lock().interrupt();
        self.interrupt.store(true, Ordering::Release);
        cut
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.lock().status()
    }

    fn emit(&self, event: PlaybackEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(error = %e, "playback event dropped");
        }
    }
}

/// Owns the speaker side and drives the jitter buffer
pub struct Player {
    handle: PlayerHandle,
    sink: PlaybackSink,
    control: PlaybackControl,
    detector: DetectorHandle,
    pending_drain: Option<(String, Option<PlaybackActions>)>,
    last_level: f32,
}

impl Player {
    /// Build the pump and its handle
    ///
    /// Events go out on `events`; the coordinator is the consumer.
    #[must_use]
    pub fn new(
        config: PlaybackConfig,
        sink: PlaybackSink,
        control: PlaybackControl,
        detector: DetectorHandle,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> (Self, PlayerHandle) {
        let handle = PlayerHandle {
            buffer: Arc::new(Mutex::new(JitterBuffer::new(config))),
            interrupt: Arc::new(AtomicBool::new(false)),
            events,
        };

        let player = Self {
            handle: handle.clone(),
            sink,
            control,
            detector,
            pending_drain: None,
            last_level: 0.0,
        };

        (player, handle)
    }

    /// Run one frame period
    pub fn tick(&mut self) {
        if self.handle.interrupt.swap(false, Ordering::AcqRel) {
            self.stop();
            return;
        }

        if let Some((session_id, actions)) = self.pending_drain.take() {
            if self.sink.outstanding_frames() == 0 {
                self.handle.emit(PlaybackEvent::Drained {
                    session_id,
                    actions,
                });
            } else {
                self.pending_drain = Some((session_id, actions));
            }
        }

        let mut buffer = self.handle.lock();
        while self.sink.outstanding_frames() < LEAD_FRAMES {
            match buffer.pull_frame() {
                Pull::Frame(frame) => {
                    if let Err(e) = self.sink.submit(&frame) {
                        // The frame is lost either way; the buffer has moved on
                        tracing::warn!(error = %e, "speaker rejected frame");
                        break;
                    }
                }
                Pull::Waiting => break,
                Pull::Finished {
                    session_id,
                    actions,
                } => {
                    self.pending_drain = Some((session_id, actions));
                    break;
                }
            }
        }
        let level = buffer.echo_level();
        drop(buffer);

        self.publish_level(level);
    }

    fn stop(&mut self) {
        self.handle.lock().interrupt();
        if self.sink.outstanding_frames() > 0 {
            self.control.fade_out_and_flush();
        }
        self.pending_drain = None;
        self.publish_level(0.0);
        self.handle.emit(PlaybackEvent::Interrupted);
    }

    fn publish_level(&mut self, level: f32) {
        if (level - self.last_level).abs() > f32::EPSILON {
            self.last_level = level;
            self.detector.set_tts_level(level);
        }
    }

    /// Drive the pump until shutdown
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(FRAME_WAIT);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!("playback pump started");
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = interval.tick() => self.tick(),
            }
        }
        tracing::debug!("playback pump stopped");
    }

    /// Spawn the pump on the runtime
    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_SAMPLES, playback_ring};
    use crate::config::{VadConfig, WakeWordConfig};
    use crate::transport::messages::PlaybackSettings;
    use crate::transport::{TtsChunk, TtsSessionStart};
    use crate::vad::Detector;

    fn setup() -> (
        Player,
        PlayerHandle,
        crate::audio::PlaybackSource,
        mpsc::Receiver<PlaybackEvent>,
    ) {
        let (sink, source, control) = playback_ring(8);
        control.enable(true);
        let (_detector, handle) =
            Detector::new(VadConfig::default(), WakeWordConfig::default(), 4).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let config = PlaybackConfig {
            start_threshold_ms: 20,
            default_fade_in_ms: 0,
            default_fade_out_ms: 0,
            ..PlaybackConfig::default()
        };
        let (player, player_handle) = Player::new(config, sink, control, handle, tx);
        (player, player_handle, source, rx)
    }

    fn tts_start(chunks: u32) -> ServerMessage {
        ServerMessage::TtsStart(TtsSessionStart {
            session_id: "s1".to_string(),
            total_chunks_expected: chunks,
            total_samples: chunks * 320,
            estimated_duration_ms: chunks * 20,
            sample_rate: 16_000,
            playback: PlaybackSettings {
                fade_in_ms: 0,
                fade_out_ms: 0,
                ..PlaybackSettings::default()
            },
            response_text: None,
        })
    }

    fn tts_chunk(sequence: u32, value: i16) -> ServerMessage {
        ServerMessage::TtsChunk(TtsChunk {
            session_id: "s1".to_string(),
            sequence,
            is_final: false,
            checksum: 0,
            start_ms: 0,
            duration_ms: 20,
            samples: vec![value; FRAME_SAMPLES],
        })
    }

    #[test]
    fn test_events_and_drain() {
        let (mut player, handle, mut source, mut rx) = setup();
        handle.handle_message(tts_start(2)).unwrap();
        handle.handle_message(tts_chunk(1, 200)).unwrap();
        handle.handle_message(tts_chunk(0, 100)).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            PlaybackEvent::SessionStarted { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlaybackEvent::FirstChunk { .. }
        ));
        assert!(rx.try_recv().is_err());

        player.tick();
        let mut out = vec![0i16; FRAME_SAMPLES];
        source.fill(&mut out);
        assert_eq!(out[0], 100);
        source.fill(&mut out);
        assert_eq!(out[0], 200);

        player.tick();
        assert!(rx.try_recv().is_err());
        player.tick();
        match rx.try_recv().unwrap() {
            PlaybackEvent::Drained { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.status().chunks_played, 2);
    }

    #[test]
    fn test_interrupt_flushes() {
        let (mut player, handle, mut source, mut rx) = setup();
        handle.handle_message(tts_start(4)).unwrap();
        for seq in 0..4 {
            handle.handle_message(tts_chunk(seq, 1000)).unwrap();
        }
        player.tick();

        assert!(handle.interrupt());
        assert_eq!(handle.status().buffer_level_ms, 0);
        player.tick();

        let mut out = vec![0i16; FRAME_SAMPLES];
        source.fill(&mut out);
        source.fill(&mut out);
        assert!(out.iter().all(|s| *s == 0));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&PlaybackEvent::Interrupted));
        assert!(handle.status().chunks_played < 4);
    }

    #[test]
    fn test_rejects_non_tts() {
        let (_player, handle, _source, _rx) = setup();
        assert!(
            handle
                .handle_message(ServerMessage::StatisticsRequest)
                .is_err()
        );
    }
}

//! Per-session reorder buffer for TTS audio
//!
//! Chunks arrive in any order and leave as contiguous PCM in sequence
//! order, exactly once. Session fades, volume, underrun pausing and
//! overflow drops happen here; the pump only moves frames.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::audio::{FRAME_SAMPLES, Frame, SAMPLE_RATE, rms, scale_samples};
use crate::config::PlaybackConfig;
use crate::transport::messages::{PlaybackActions, pcm_checksum};
use crate::transport::{TtsChunk, TtsSessionEnd, TtsSessionStart};
use crate::{Error, Result};

const SAMPLES_PER_MS: usize = (SAMPLE_RATE / 1000) as usize;

/// Playback phase of the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Finished,
}

/// Result of offering a chunk to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; `first` is set for the first chunk of the session
    Accepted { first: bool },
    /// Already stored or already played
    Duplicate,
}

/// Result of pulling one frame for the speaker
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Frame(Frame),
    /// Buffering, paused, or no session
    Waiting,
    /// Every chunk of the session has been delivered; reported once
    Finished {
        session_id: String,
        actions: Option<PlaybackActions>,
    },
}

/// Session and lifetime counters reported to the server on request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub session_id: Option<String>,
    pub chunks_expected: u32,
    pub chunks_received: u32,
    pub chunks_played: u32,
    pub buffer_level_ms: u32,
    pub underruns: u32,
    pub dropouts: u32,
    pub echo_level: f32,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_interrupted: u64,
    pub checksum_failures: u64,
    pub rejected_chunks: u64,
}

struct Session {
    id: String,
    expected: u32,
    volume: f32,
    fade_in_samples: usize,
    fade_out_samples: usize,
    faded_in: usize,
    slots: BTreeMap<u32, Vec<i16>>,
    slot_samples: usize,
    next_seq: u32,
    final_seq: Option<u32>,
    end: Option<TtsSessionEnd>,
    ready: VecDeque<i16>,
    /// Chunks in `ready` and their unplayed sample counts
    boundaries: VecDeque<(u32, usize)>,
    state: PlaybackState,
    received: u32,
    played: u32,
    underruns: u32,
    dropouts: u32,
}

impl Session {
    fn new(start: &TtsSessionStart, config: &PlaybackConfig) -> Self {
        let fade_in_ms = match start.playback.fade_in_ms {
            0 => config.default_fade_in_ms,
            ms => ms,
        };
        let fade_out_ms = match start.playback.fade_out_ms {
            0 => config.default_fade_out_ms,
            ms => ms,
        };

        Self {
            id: start.session_id.clone(),
            expected: start.total_chunks_expected,
            volume: start.playback.volume.clamp(0.0, 1.0),
            fade_in_samples: fade_in_ms as usize * SAMPLES_PER_MS,
            fade_out_samples: fade_out_ms as usize * SAMPLES_PER_MS,
            faded_in: 0,
            slots: BTreeMap::new(),
            slot_samples: 0,
            next_seq: 0,
            final_seq: None,
            end: None,
            ready: VecDeque::new(),
            boundaries: VecDeque::new(),
            state: PlaybackState::Buffering,
            received: 0,
            played: 0,
            underruns: 0,
            dropouts: 0,
        }
    }

    /// One past the last sequence of the session, once known
    fn window_end(&self) -> Option<u32> {
        let expected = (self.expected > 0).then_some(self.expected);
        let last = self.final_seq.map(|s| s.saturating_add(1));
        let sent = self
            .end
            .as_ref()
            .map(|e| e.total_chunks_sent)
            .filter(|n| *n > 0);

        [expected, last, sent].into_iter().flatten().min()
    }

    fn is_complete(&self) -> bool {
        self.window_end().is_some_and(|end| self.next_seq >= end)
    }

    fn ready_ms(&self) -> u32 {
        u32::try_from(self.ready.len() / SAMPLES_PER_MS).unwrap_or(u32::MAX)
    }

    fn promote(&mut self) {
        while let Some(mut pcm) = self.slots.remove(&self.next_seq) {
            self.slot_samples -= pcm.len();
            let is_last = self
                .window_end()
                .is_some_and(|end| self.next_seq.saturating_add(1) >= end);
            if is_last {
                fade_out(&mut pcm, self.fade_out_samples);
            }
            self.boundaries.push_back((self.next_seq, pcm.len()));
            self.ready.extend(pcm);
            self.next_seq = self.next_seq.wrapping_add(1);
        }
    }

    /// Remove `n` samples from the front, crediting finished chunks
    fn consume(&mut self, n: usize, played: bool) {
        let mut left = n;
        while let Some(front) = self.boundaries.front_mut() {
            if front.1 > left {
                front.1 -= left;
                break;
            }
            left -= front.1;
            self.boundaries.pop_front();
            if played {
                self.played += 1;
            } else {
                self.dropouts += 1;
            }
        }
    }

    fn enforce_limit(&mut self, max_samples: usize) {
        let total = self.ready.len() + self.slot_samples;
        if total <= max_samples {
            return;
        }
        let excess = (total - max_samples).min(self.ready.len());
        self.ready.drain(..excess);
        self.consume(excess, false);
        tracing::warn!(
            session_id = %self.id,
            dropped_samples = excess,
            "tts buffer overflow, oldest audio dropped"
        );
    }
}

/// Reorders TTS chunks and hands out frames for the speaker
pub struct JitterBuffer {
    config: PlaybackConfig,
    session: Option<Session>,
    echo_level: f32,
    totals: PlaybackStatus,
}

impl JitterBuffer {
    #[must_use]
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            session: None,
            echo_level: 0.0,
            totals: PlaybackStatus::default(),
        }
    }

    /// Open a session, replacing any session still in progress
    pub fn start_session(&mut self, start: &TtsSessionStart) {
        if let Some(old) = &self.session {
            if old.state != PlaybackState::Finished {
                tracing::warn!(
                    old = %old.id,
                    new = %start.session_id,
                    "tts session replaced before finishing"
                );
                self.totals.sessions_interrupted += 1;
            }
        }

        tracing::info!(
            session_id = %start.session_id,
            chunks = start.total_chunks_expected,
            estimated_ms = start.estimated_duration_ms,
            "tts session started"
        );
        self.session = Some(Session::new(start, &self.config));
        self.totals.sessions_started += 1;
    }

    /// Offer one chunk of the current session
    ///
    /// # Errors
    ///
    /// Returns `Error::RemotePeer` when there is no session, the session id
    /// does not match, the sequence is outside the session window, or a
    /// non-zero checksum does not match the payload
    pub fn accept_chunk(&mut self, chunk: TtsChunk) -> Result<ChunkOutcome> {
        let max_samples = self.config.max_buffer_ms as usize * SAMPLES_PER_MS;

        let Some(session) = self.session.as_mut() else {
            self.totals.rejected_chunks += 1;
            return Err(Error::RemotePeer(format!(
                "tts chunk for {} without an open session",
                chunk.session_id
            )));
        };

        if chunk.session_id != session.id {
            self.totals.rejected_chunks += 1;
            return Err(Error::RemotePeer(format!(
                "tts chunk for session {} while {} is open",
                chunk.session_id, session.id
            )));
        }

        if chunk.checksum != 0 {
            let actual = pcm_checksum(&chunk.samples);
            if actual != chunk.checksum {
                self.totals.checksum_failures += 1;
                return Err(Error::RemotePeer(format!(
                    "tts chunk {} checksum {actual:#x} != {:#x}",
                    chunk.sequence, chunk.checksum
                )));
            }
        }

        if chunk.sequence < session.next_seq || session.slots.contains_key(&chunk.sequence) {
            return Ok(ChunkOutcome::Duplicate);
        }

        if session.window_end().is_some_and(|end| chunk.sequence >= end) {
            self.totals.rejected_chunks += 1;
            return Err(Error::RemotePeer(format!(
                "tts chunk {} outside session window",
                chunk.sequence
            )));
        }

        if chunk.is_final {
            session.final_seq = Some(chunk.sequence);
        }

        let first = session.received == 0;
        session.received += 1;
        session.slot_samples += chunk.samples.len();
        session.slots.insert(chunk.sequence, chunk.samples);
        session.promote();
        session.enforce_limit(max_samples);

        tracing::trace!(
            sequence = chunk.sequence,
            buffered_ms = session.ready_ms(),
            "tts chunk accepted"
        );

        Ok(ChunkOutcome::Accepted { first })
    }

    /// Record the end of the current session
    ///
    /// # Errors
    ///
    /// Returns `Error::RemotePeer` when the session id does not match
    pub fn end_session(&mut self, end: TtsSessionEnd) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::RemotePeer(format!(
                "tts end for {} without an open session",
                end.session_id
            )));
        };
        if end.session_id != session.id {
            return Err(Error::RemotePeer(format!(
                "tts end for session {} while {} is open",
                end.session_id, session.id
            )));
        }

        tracing::debug!(
            session_id = %session.id,
            chunks_sent = end.total_chunks_sent,
            received = session.received,
            "tts session end received"
        );
        session.end = Some(end);
        // A shrunken window may release the tail fade
        session.promote();
        Ok(())
    }

    /// Next frame for the speaker
    pub fn pull_frame(&mut self) -> Pull {
        let start_ms = self.config.start_threshold_ms;
        let min_ms = self.config.min_buffer_ms;
        let alpha = self.config.echo_level_alpha;

        let Some(session) = self.session.as_mut() else {
            self.echo_level = 0.0;
            return Pull::Waiting;
        };

        match session.state {
            PlaybackState::Idle | PlaybackState::Finished => {
                self.echo_level = 0.0;
                return Pull::Waiting;
            }
            PlaybackState::Buffering | PlaybackState::Paused => {
                if session.ready_ms() >= start_ms || session.is_complete() {
                    session.state = PlaybackState::Playing;
                } else {
                    return Pull::Waiting;
                }
            }
            PlaybackState::Playing => {}
        }

        let complete = session.is_complete();
        if complete && session.ready.is_empty() {
            session.state = PlaybackState::Finished;
            self.echo_level = 0.0;
            self.totals.sessions_completed += 1;
            tracing::info!(
                session_id = %session.id,
                played = session.played,
                underruns = session.underruns,
                "tts session drained"
            );
            return Pull::Finished {
                session_id: session.id.clone(),
                actions: session.end.as_ref().map(|e| e.actions),
            };
        }

        if !complete && (session.ready.len() < FRAME_SAMPLES || session.ready_ms() < min_ms) {
            session.state = PlaybackState::Paused;
            session.underruns += 1;
            tracing::debug!(
                session_id = %session.id,
                buffered_ms = session.ready_ms(),
                "tts underrun, pausing"
            );
            return Pull::Waiting;
        }

        let mut frame = Frame::silent();
        let n = FRAME_SAMPLES.min(session.ready.len());
        let out = frame.samples_mut();
        for (dst, src) in out.iter_mut().zip(session.ready.drain(..n)) {
            *dst = src;
        }
        session.consume(n, true);

        if session.faded_in < session.fade_in_samples {
            let total = session.fade_in_samples;
            for s in &mut out[..n] {
                if session.faded_in >= total {
                    break;
                }
                #[allow(clippy::cast_precision_loss)]
                let gain = session.faded_in as f32 / total as f32;
                *s = scale(*s, gain);
                session.faded_in += 1;
            }
        }
        if session.volume < 1.0 {
            scale_samples(&mut out[..n], session.volume);
        }

        let level = (rms(frame.samples()) / 32768.0).clamp(0.0, 1.0);
        self.echo_level = alpha.mul_add(level, (1.0 - alpha) * self.echo_level);

        Pull::Frame(frame)
    }

    /// Drop everything queued for the current session
    ///
    /// Returns whether a session was cut short.
    pub fn interrupt(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state == PlaybackState::Finished {
            return false;
        }

        tracing::info!(
            session_id = %session.id,
            discarded_chunks = session.boundaries.len() + session.slots.len(),
            "tts playback interrupted"
        );

        session.ready.clear();
        session.boundaries.clear();
        session.slots.clear();
        session.slot_samples = 0;
        session.state = PlaybackState::Finished;
        self.totals.sessions_interrupted += 1;
        self.echo_level = 0.0;

        true
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.session.as_ref().map_or(PlaybackState::Idle, |s| s.state)
    }

    /// Smoothed level of the audio handed to the speaker, 0 to 1
    #[must_use]
    pub const fn echo_level(&self) -> f32 {
        self.echo_level
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        let mut status = self.totals.clone();
        status.echo_level = self.echo_level;
        if let Some(s) = &self.session {
            status.state = s.state;
            status.session_id = Some(s.id.clone());
            status.chunks_expected = s.expected;
            status.chunks_received = s.received;
            status.chunks_played = s.played;
            status.buffer_level_ms = s.ready_ms();
            status.underruns = s.underruns;
            status.dropouts = s.dropouts;
        }
        status
    }
}

fn scale(sample: i16, gain: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let v = (f32::from(sample) * gain).round() as i16;
    v
}

/// Linear ramp to zero over the last `len` samples
fn fade_out(pcm: &mut [i16], len: usize) {
    let len = len.min(pcm.len());
    if len == 0 {
        return;
    }
    let start = pcm.len() - len;
    for (k, s) in pcm[start..].iter_mut().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let gain = 1.0 - (k + 1) as f32 / len as f32;
        *s = scale(*s, gain);
    }
}

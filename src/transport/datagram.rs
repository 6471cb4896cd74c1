//! Unreliable datagram audio sender
//!
//! One packet per captured frame, carrying VAD and wake word metadata.
//! Sending never blocks: a full socket buffer drops the frame. During
//! silence, packets are thinned to one per `silence_packet_interval_ms`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UdpSocket;

use super::packet::{MAX_PACKET_LEN, PacketKind, VadBlock, WakeBlock, encode_packet};
use crate::audio::Frame;
use crate::config::TransportConfig;
use crate::vad::{DetectionResult, WakeWordEvent};
use crate::{Error, Result};

/// Decides which frames go on the wire while nobody is talking
#[derive(Debug, Clone)]
pub struct SilenceSuppressor {
    enabled: bool,
    interval_ms: u64,
    last_silence_sent_ms: Option<u64>,
    prev_voice: bool,
}

/// Why a frame was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReason {
    Voice,
    Edge,
    WakeWord,
    SilenceKeepalive,
    Unsuppressed,
}

impl SilenceSuppressor {
    #[must_use]
    pub fn new(enabled: bool, interval_ms: u32) -> Self {
        Self {
            enabled,
            interval_ms: u64::from(interval_ms),
            last_silence_sent_ms: None,
            prev_voice: false,
        }
    }

    /// Decide whether the frame at `timestamp_ms` is sent
    ///
    /// Voice, speech edges, voice-state changes and wake word frames are
    /// always sent.
    pub fn admit(
        &mut self,
        timestamp_ms: u64,
        vad: &DetectionResult,
        wake_word: bool,
    ) -> Option<SendReason> {
        let state_changed = vad.voice_active != self.prev_voice;
        self.prev_voice = vad.voice_active;

        if !self.enabled {
            return Some(SendReason::Unsuppressed);
        }
        if wake_word {
            return Some(SendReason::WakeWord);
        }
        if vad.speech_started || vad.speech_ended || state_changed {
            return Some(SendReason::Edge);
        }
        if vad.voice_active {
            return Some(SendReason::Voice);
        }

        let due = self
            .last_silence_sent_ms
            .is_none_or(|last| timestamp_ms.saturating_sub(last) >= self.interval_ms);
        if due {
            self.last_silence_sent_ms = Some(timestamp_ms);
            Some(SendReason::SilenceKeepalive)
        } else {
            None
        }
    }

    pub fn set(&mut self, enabled: bool, interval_ms: u32) {
        self.enabled = enabled;
        self.interval_ms = u64::from(interval_ms);
    }
}

/// Result of offering a frame to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { sequence: u32, bytes: usize },
    Suppressed,
    /// Socket buffer full, frame discarded
    Dropped { sequence: u32 },
}

/// Datagram counters, shared with the telemetry reader
#[derive(Debug, Default)]
pub struct DatagramStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_suppressed: AtomicU64,
    bandwidth_saved_bytes: AtomicU64,
    packets_dropped: AtomicU64,
    send_errors: AtomicU64,
    voice_packets: AtomicU64,
    silence_packets: AtomicU64,
    high_confidence_packets: AtomicU64,
    wake_word_packets: AtomicU64,
    state_changes: AtomicU64,
    confidence_milli_sum: AtomicU64,
    send_nanos: AtomicU64,
    last_sequence: AtomicU32,
    last_timestamp_ms: AtomicU64,
}

/// Point-in-time copy of [`DatagramStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatagramSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_suppressed: u64,
    pub bandwidth_saved_bytes: u64,
    pub packets_dropped: u64,
    pub send_errors: u64,
    pub voice_packets: u64,
    pub silence_packets: u64,
    pub high_confidence_packets: u64,
    pub wake_word_packets: u64,
    pub state_changes: u64,
    pub avg_vad_confidence: f64,
    /// Mean time spent in the socket send call
    pub avg_send_us: f64,
    pub last_sequence: u32,
    pub last_timestamp_ms: u64,
}

impl DatagramStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> DatagramSnapshot {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        let confidence_sum = self.confidence_milli_sum.load(Ordering::Relaxed);
        let send_nanos = self.send_nanos.load(Ordering::Relaxed);
        DatagramSnapshot {
            packets_sent: sent,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_suppressed: self.packets_suppressed.load(Ordering::Relaxed),
            bandwidth_saved_bytes: self.bandwidth_saved_bytes.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            voice_packets: self.voice_packets.load(Ordering::Relaxed),
            silence_packets: self.silence_packets.load(Ordering::Relaxed),
            high_confidence_packets: self.high_confidence_packets.load(Ordering::Relaxed),
            wake_word_packets: self.wake_word_packets.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            avg_vad_confidence: if sent == 0 {
                0.0
            } else {
                confidence_sum as f64 / (sent as f64 * 1000.0)
            },
            avg_send_us: if sent == 0 {
                0.0
            } else {
                send_nanos as f64 / (sent as f64 * 1000.0)
            },
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            last_timestamp_ms: self.last_timestamp_ms.load(Ordering::Relaxed),
        }
    }
}

/// Sends one packet per admitted frame to the server's audio port
pub struct DatagramSender {
    socket: UdpSocket,
    target: SocketAddr,
    next_sequence: u32,
    suppressor: SilenceSuppressor,
    buf: [u8; MAX_PACKET_LEN],
    stats: Arc<DatagramStats>,
}

impl DatagramSender {
    /// Bind an ephemeral local socket aimed at `target`
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound
    pub async fn bind(target: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;

        if config.adaptive_bitrate {
            tracing::debug!("adaptive bitrate requested, frames are always sent uncompressed");
        }

        tracing::info!(
            target = %target,
            local = %socket.local_addr()?,
            suppression = config.silence_suppression,
            "datagram sender bound"
        );

        Ok(Self {
            socket,
            target,
            next_sequence: 0,
            suppressor: SilenceSuppressor::new(
                config.silence_suppression,
                config.silence_packet_interval_ms,
            ),
            buf: [0; MAX_PACKET_LEN],
            stats: Arc::new(DatagramStats::default()),
        })
    }

    /// Offer one frame with its detection metadata
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` for socket failures other than a full buffer
    pub fn send_frame(
        &mut self,
        frame: &Frame,
        vad: &DetectionResult,
        wake_word: Option<&WakeWordEvent>,
        timestamp_ms: u64,
    ) -> Result<SendOutcome> {
        let was_voice = self.suppressor.prev_voice;
        let reason = self
            .suppressor
            .admit(timestamp_ms, vad, wake_word.is_some());
        if was_voice != vad.voice_active {
            self.stats.state_changes.fetch_add(1, Ordering::Relaxed);
        }

        let vad_block = VadBlock::from_result(vad);
        let kind = match wake_word {
            Some(event) => PacketKind::WakeWord {
                vad: vad_block,
                wake: WakeBlock::from_event(event),
            },
            None => PacketKind::Vad(vad_block),
        };

        let Some(reason) = reason else {
            let saved = kind.header_len() + frame.samples().len() * 2;
            self.stats.packets_suppressed.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bandwidth_saved_bytes
                .fetch_add(saved as u64, Ordering::Relaxed);
            return Ok(SendOutcome::Suppressed);
        };

        let len = encode_packet(self.next_sequence, &kind, frame.samples(), &mut self.buf)?;
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.stats.last_sequence.store(sequence, Ordering::Relaxed);
        self.stats
            .last_timestamp_ms
            .store(timestamp_ms, Ordering::Relaxed);

        let started = Instant::now();
        match self.socket.try_send_to(&self.buf[..len], self.target) {
            Ok(bytes) => {
                self.record_sent(reason, vad, bytes, started.elapsed());
                tracing::trace!(sequence, bytes, ?reason, "datagram sent");
                Ok(SendOutcome::Sent { sequence, bytes })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence, "socket busy, frame dropped");
                Ok(SendOutcome::Dropped { sequence })
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(Error::Io(e))
            }
        }
    }

    fn record_sent(
        &self,
        reason: SendReason,
        vad: &DetectionResult,
        bytes: usize,
        took: Duration,
    ) {
        let stats = &self.stats;
        stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(took.as_nanos()).unwrap_or(u64::MAX);
        stats.send_nanos.fetch_add(nanos, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if vad.voice_active {
            stats.voice_packets.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.silence_packets.fetch_add(1, Ordering::Relaxed);
        }
        if vad.high_confidence {
            stats.high_confidence_packets.fetch_add(1, Ordering::Relaxed);
        }
        if reason == SendReason::WakeWord {
            stats.wake_word_packets.fetch_add(1, Ordering::Relaxed);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let milli = (vad.confidence.clamp(0.0, 1.0) * 1000.0) as u64;
        stats.confidence_milli_sum.fetch_add(milli, Ordering::Relaxed);
    }

    /// Point the sender at a different server
    pub fn set_target(&mut self, target: SocketAddr) {
        if target != self.target {
            tracing::info!(from = %self.target, to = %target, "datagram target changed");
            self.target = target;
        }
    }

    #[must_use]
    pub const fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn set_silence_suppression(&mut self, enabled: bool, interval_ms: u32) {
        self.suppressor.set(enabled, interval_ms);
    }

    /// Shared counters for telemetry
    #[must_use]
    pub fn stats(&self) -> Arc<DatagramStats> {
        Arc::clone(&self.stats)
    }

    /// Sequence number of the next packet
    #[must_use]
    pub const fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

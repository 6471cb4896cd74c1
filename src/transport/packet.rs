//! Datagram audio packet codec
//!
//! Every packet starts with the 12-byte basic header. VAD packets
//! (version 0x02) append a 12-byte detection block, wake word packets
//! (version 0x03) append a further 12-byte wake word block. All integers and
//! PCM samples are little-endian.

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::vad::{DetectionResult, WakeWordEvent, WakeWordState};
use crate::{Error, Result};

pub const BASIC_HEADER_LEN: usize = 12;
pub const VAD_HEADER_LEN: usize = 24;
pub const WAKE_HEADER_LEN: usize = 36;

/// Largest packet the sender produces
pub const MAX_PACKET_LEN: usize = WAKE_HEADER_LEN + FRAME_SAMPLES * 2;

pub const VERSION_VAD: u8 = 0x02;
pub const VERSION_WAKE_WORD: u8 = 0x03;

/// Header flag marking a wake word packet
pub const FLAG_WAKE_WORD: u16 = 0x8000;

/// Bits of the `vad_flags` byte
pub mod vad_flags {
    pub const VOICE_ACTIVE: u8 = 0x01;
    pub const SPEECH_START: u8 = 0x02;
    pub const SPEECH_END: u8 = 0x04;
    pub const HIGH_CONFIDENCE: u8 = 0x08;
    pub const NOISE_UPDATED: u8 = 0x10;
    pub const SPECTRAL_VALID: u8 = 0x20;
    pub const ADAPTIVE_ACTIVE: u8 = 0x40;
}

/// Bits of the wake word flags byte
pub mod wake_flags {
    pub const DETECTED: u8 = 0x01;
    pub const CONFIRMED: u8 = 0x02;
    pub const REJECTED: u8 = 0x04;
    pub const HIGH_CONFIDENCE: u8 = 0x08;
}

/// Per-frame detection summary carried by VAD packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadBlock {
    pub flags: u8,
    pub confidence: u8,
    pub quality: u8,
    pub max_amplitude: u16,
    pub noise_floor: u16,
    pub zero_crossing_rate: u16,
    /// SNR in dB times two
    pub snr_db_scaled: u8,
}

impl VadBlock {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_result(result: &DetectionResult) -> Self {
        let mut flags = 0;
        for (set, bit) in [
            (result.voice_active, vad_flags::VOICE_ACTIVE),
            (result.speech_started, vad_flags::SPEECH_START),
            (result.speech_ended, vad_flags::SPEECH_END),
            (result.high_confidence, vad_flags::HIGH_CONFIDENCE),
            (result.noise_floor_updated, vad_flags::NOISE_UPDATED),
            (result.spectral_valid, vad_flags::SPECTRAL_VALID),
            (result.adaptive_active, vad_flags::ADAPTIVE_ACTIVE),
        ] {
            if set {
                flags |= bit;
            }
        }

        Self {
            flags,
            confidence: (result.confidence.clamp(0.0, 1.0) * 255.0) as u8,
            quality: result.quality,
            max_amplitude: result.max_amplitude,
            noise_floor: result.noise_floor,
            zero_crossing_rate: result.zero_crossing_rate,
            snr_db_scaled: (result.snr_db * 2.0).clamp(0.0, 255.0) as u8,
        }
    }

    #[must_use]
    pub const fn voice_active(&self) -> bool {
        self.flags & vad_flags::VOICE_ACTIVE != 0
    }

    #[must_use]
    pub const fn is_edge(&self) -> bool {
        self.flags & (vad_flags::SPEECH_START | vad_flags::SPEECH_END) != 0
    }
}

/// Wake word trailer carried by version 0x03 packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeBlock {
    pub detection_id: u32,
    pub flags: u8,
    pub confidence: u8,
    /// 0..=1000
    pub pattern_score: u16,
    pub syllable_count: u8,
    /// Detection duration in 10 ms units, saturating
    pub duration_10ms: u8,
}

impl WakeBlock {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_event(event: &WakeWordEvent) -> Self {
        let mut flags = match event.state {
            WakeWordState::Listening => 0,
            WakeWordState::Triggered => wake_flags::DETECTED,
            WakeWordState::Confirmed => wake_flags::DETECTED | wake_flags::CONFIRMED,
            WakeWordState::Rejected => wake_flags::DETECTED | wake_flags::REJECTED,
        };
        if event.confidence >= 0.71 {
            flags |= wake_flags::HIGH_CONFIDENCE;
        }

        Self {
            detection_id: event.detection_id,
            flags,
            confidence: (event.confidence.clamp(0.0, 1.0) * 255.0) as u8,
            pattern_score: event.pattern_score.min(1000),
            syllable_count: event.syllable_count,
            duration_10ms: u8::try_from(event.duration_ms / 10).unwrap_or(u8::MAX),
        }
    }
}

/// Packet layout, chosen per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Legacy header without detection data
    Basic,
    Vad(VadBlock),
    WakeWord { vad: VadBlock, wake: WakeBlock },
}

impl PacketKind {
    #[must_use]
    pub const fn header_len(&self) -> usize {
        match self {
            Self::Basic => BASIC_HEADER_LEN,
            Self::Vad(_) => VAD_HEADER_LEN,
            Self::WakeWord { .. } => WAKE_HEADER_LEN,
        }
    }

    #[must_use]
    pub const fn vad(&self) -> Option<&VadBlock> {
        match self {
            Self::Basic => None,
            Self::Vad(vad) | Self::WakeWord { vad, .. } => Some(vad),
        }
    }
}

/// Parsed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub sample_rate: u16,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub flags: u16,
    pub kind: PacketKind,
    pub samples: Vec<i16>,
}

/// Serialize a packet into `buf`, returning the number of bytes written
///
/// # Errors
///
/// Returns `Error::InvalidInput` if there are more samples than one frame
/// or `buf` is too small
pub fn encode_packet(
    sequence: u32,
    kind: &PacketKind,
    samples: &[i16],
    buf: &mut [u8],
) -> Result<usize> {
    if samples.len() > FRAME_SAMPLES {
        return Err(Error::InvalidInput(format!(
            "{} samples exceeds one frame",
            samples.len()
        )));
    }
    let header_len = kind.header_len();
    let total = header_len + samples.len() * 2;
    if buf.len() < total {
        return Err(Error::InvalidInput(format!(
            "packet buffer {} smaller than {total}",
            buf.len()
        )));
    }

    let flags = match kind {
        PacketKind::WakeWord { .. } => FLAG_WAKE_WORD,
        _ => 0,
    };
    let sample_count = u16::try_from(samples.len()).unwrap_or(u16::MAX);
    #[allow(clippy::cast_possible_truncation)]
    let rate = SAMPLE_RATE as u16;

    buf[0..4].copy_from_slice(&sequence.to_le_bytes());
    buf[4..6].copy_from_slice(&sample_count.to_le_bytes());
    buf[6..8].copy_from_slice(&rate.to_le_bytes());
    buf[8] = 1;
    buf[9] = 16;
    buf[10..12].copy_from_slice(&flags.to_le_bytes());

    match kind {
        PacketKind::Basic => {}
        PacketKind::Vad(vad) => write_vad(VERSION_VAD, vad, &mut buf[12..24]),
        PacketKind::WakeWord { vad, wake } => {
            write_vad(VERSION_WAKE_WORD, vad, &mut buf[12..24]);
            write_wake(wake, &mut buf[24..36]);
        }
    }

    for (chunk, sample) in buf[header_len..total].chunks_exact_mut(2).zip(samples) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }

    Ok(total)
}

fn write_vad(version: u8, vad: &VadBlock, out: &mut [u8]) {
    out[0] = version;
    out[1] = vad.flags;
    out[2] = vad.confidence;
    out[3] = vad.quality;
    out[4..6].copy_from_slice(&vad.max_amplitude.to_le_bytes());
    out[6..8].copy_from_slice(&vad.noise_floor.to_le_bytes());
    out[8..10].copy_from_slice(&vad.zero_crossing_rate.to_le_bytes());
    out[10] = vad.snr_db_scaled;
    out[11] = 0;
}

fn write_wake(wake: &WakeBlock, out: &mut [u8]) {
    out[0..4].copy_from_slice(&wake.detection_id.to_le_bytes());
    out[4] = wake.flags;
    out[5] = wake.confidence;
    out[6..8].copy_from_slice(&wake.pattern_score.to_le_bytes());
    out[8] = wake.syllable_count;
    out[9] = wake.duration_10ms;
    out[10..12].copy_from_slice(&0u16.to_le_bytes());
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parse a datagram
///
/// The layout is chosen from the version byte and confirmed by the packet
/// length matching `sample_count`.
///
/// # Errors
///
/// Returns `Error::RemotePeer` for truncated packets, length mismatches and
/// unsupported audio formats
pub fn decode_packet(bytes: &[u8]) -> Result<AudioPacket> {
    if bytes.len() < BASIC_HEADER_LEN {
        return Err(Error::RemotePeer(format!(
            "packet of {} bytes shorter than header",
            bytes.len()
        )));
    }

    let sequence = read_u32(bytes, 0);
    let sample_count = usize::from(read_u16(bytes, 4));
    let sample_rate = read_u16(bytes, 6);
    let channels = bytes[8];
    let bits_per_sample = bytes[9];
    let flags = read_u16(bytes, 10);

    if channels != 1 || bits_per_sample != 16 {
        return Err(Error::RemotePeer(format!(
            "unsupported format {channels}ch {bits_per_sample}-bit"
        )));
    }

    let payload = sample_count * 2;
    let version = bytes.get(12).copied();
    let kind = if bytes.len() == VAD_HEADER_LEN + payload && version == Some(VERSION_VAD) {
        PacketKind::Vad(read_vad(&bytes[12..24]))
    } else if bytes.len() == WAKE_HEADER_LEN + payload && version == Some(VERSION_WAKE_WORD) {
        PacketKind::WakeWord {
            vad: read_vad(&bytes[12..24]),
            wake: read_wake(&bytes[24..36]),
        }
    } else if bytes.len() == BASIC_HEADER_LEN + payload {
        PacketKind::Basic
    } else {
        return Err(Error::RemotePeer(format!(
            "packet length {} does not match {sample_count} samples",
            bytes.len()
        )));
    };

    let samples = bytes[kind.header_len()..]
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    Ok(AudioPacket {
        sequence,
        sample_rate,
        channels,
        bits_per_sample,
        flags,
        kind,
        samples,
    })
}

fn read_vad(bytes: &[u8]) -> VadBlock {
    VadBlock {
        flags: bytes[1],
        confidence: bytes[2],
        quality: bytes[3],
        max_amplitude: read_u16(bytes, 4),
        noise_floor: read_u16(bytes, 6),
        zero_crossing_rate: read_u16(bytes, 8),
        snr_db_scaled: bytes[10],
    }
}

fn read_wake(bytes: &[u8]) -> WakeBlock {
    WakeBlock {
        detection_id: read_u32(bytes, 0),
        flags: bytes[4],
        confidence: bytes[5],
        pattern_score: read_u16(bytes, 6),
        syllable_count: bytes[8],
        duration_10ms: bytes[9],
    }
}

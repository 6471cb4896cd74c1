//! Reliable channel wire messages
//!
//! Text frames carry JSON objects tagged by `"type"`. TTS chunks may also
//! arrive as binary frames with this layout:
//!
//! ```text
//! u8   session_id_len
//! [u8] session_id (<= 31 bytes, utf-8)
//! u32  sequence (LE)
//! u8   flags (bit 0 = final)
//! u32  checksum (LE, 0 = unchecked)
//! [i16] PCM samples (LE)
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::audio::SAMPLE_RATE;
use crate::playback::PlaybackState;
use crate::{Error, Result};

/// Longest session id accepted on the wire
pub const MAX_SESSION_ID_LEN: usize = 31;

const BINARY_CHUNK_FIXED_LEN: usize = 1 + 4 + 1 + 4;
const BINARY_FLAG_FINAL: u8 = 0x01;

/// Milliseconds since the Unix epoch
#[must_use]
pub fn timestamp_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Audio format announced in `session_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    #[serde(default)]
    pub frame_samples: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
            frame_samples: crate::audio::FRAME_SAMPLES,
        }
    }
}

/// Wake word counters reported in `statistics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WakeWordReport {
    pub total_detections: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub avg_confidence: f64,
    pub current_threshold: f32,
}

/// VAD counters reported in `statistics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VadReport {
    pub voice_packets: u64,
    pub silence_packets: u64,
    pub avg_confidence: f64,
    pub noise_floor: f32,
    pub frames_processed: u64,
}

/// Datagram stream counters reported in `statistics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    pub packets_sent: u64,
    pub packets_suppressed: u64,
    pub packets_dropped: u64,
    pub send_errors: u64,
    pub bandwidth_saved_bytes: u64,
    pub avg_send_us: f64,
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionStart {
        device_id: String,
        device_name: String,
        room: String,
        audio_format: AudioFormat,
        capabilities: String,
        timestamp: u64,
    },
    AudioStream {
        device_id: String,
        sequence: u32,
        samples: usize,
        /// Base64 int16 LE PCM
        audio_data: String,
        timestamp: u64,
    },
    VoiceDetected {
        device_id: String,
        confidence: f32,
        max_amplitude: u16,
        snr_db: f32,
        timestamp: u64,
    },
    VoiceEnded {
        device_id: String,
        duration_ms: u32,
        timestamp: u64,
    },
    WakeWordDetected {
        detection_id: u32,
        device_id: String,
        confidence: f32,
        energy_level: f32,
        pattern_score: u16,
        syllable_count: u8,
        duration_ms: u32,
        vad_active: bool,
        snr_db: f32,
        timestamp: u64,
    },
    Statistics {
        device_id: String,
        wake_word_stats: WakeWordReport,
        vad_stats: VadReport,
        stream_stats: StreamReport,
        timestamp: u64,
    },
    TrainingSample {
        device_id: String,
        sample_index: u32,
        chunk_index: u32,
        chunk_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Base64 slice of a WAV file
        audio_data: String,
        timestamp: u64,
    },
    PlaybackStatus {
        device_id: String,
        session_id: String,
        playback_state: PlaybackState,
        chunks_received: u32,
        chunks_played: u32,
        buffer_level_ms: u32,
        underruns: u32,
        dropouts: u32,
        timestamp: u64,
    },
    Ping {
        device_id: String,
        timestamp: u64,
    },
    Pong {
        device_id: String,
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Audio-metadata messages go stale and are dropped during an outage
    #[must_use]
    pub const fn is_audio_metadata(&self) -> bool {
        matches!(
            self,
            Self::AudioStream { .. } | Self::VoiceDetected { .. } | Self::VoiceEnded { .. }
        )
    }

    /// The wire `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::AudioStream { .. } => "audio_stream",
            Self::VoiceDetected { .. } => "voice_detected",
            Self::VoiceEnded { .. } => "voice_ended",
            Self::WakeWordDetected { .. } => "wake_word_detected",
            Self::Statistics { .. } => "statistics",
            Self::TrainingSample { .. } => "training_sample",
            Self::PlaybackStatus { .. } => "playback_status",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Build an `audio_stream` batch from PCM samples
    #[must_use]
    pub fn audio_stream(device_id: &str, sequence: u32, samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        Self::AudioStream {
            device_id: device_id.to_string(),
            sequence,
            samples: samples.len(),
            audio_data: BASE64.encode(bytes),
            timestamp: timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum ChecksumField {
    Hex(String),
    Number(u32),
}

/// `tts_audio_start` session block
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub estimated_duration_ms: u32,
    #[serde(default)]
    pub total_chunks_expected: u32,
}

/// `tts_audio_start` audio format block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TtsAudioFormat {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_bits")]
    pub bits_per_sample: u16,
    #[serde(default)]
    pub total_samples: u32,
}

const fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

const fn default_channels() -> u16 {
    1
}

const fn default_bits() -> u16 {
    16
}

impl Default for TtsAudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
            total_samples: 0,
        }
    }
}

/// `tts_audio_start` playback block
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub volume: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub interrupt_recording: bool,
    pub echo_cancellation: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            fade_in_ms: 10,
            fade_out_ms: 50,
            interrupt_recording: true,
            echo_cancellation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct ChunkInfo {
    session_id: String,
    #[serde(default)]
    chunk_sequence: u32,
    #[serde(default)]
    chunk_size: usize,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    checksum: Option<ChecksumField>,
    audio_data: String,
}

/// `tts_audio_chunk` timing block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChunkTiming {
    pub chunk_start_time_ms: u32,
    pub chunk_duration_ms: u32,
}

/// `tts_audio_end` summary block
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub total_chunks_sent: u32,
    #[serde(default)]
    pub total_audio_bytes: u64,
    #[serde(default)]
    pub actual_duration_ms: u32,
}

/// `tts_audio_end` follow-up actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaybackActions {
    pub fade_out_ms: u32,
    pub return_to_listening: bool,
    pub cooldown_period_ms: u32,
}

impl Default for PlaybackActions {
    fn default() -> Self {
        Self {
            fade_out_ms: 50,
            return_to_listening: true,
            cooldown_period_ms: 0,
        }
    }
}

/// Raw inbound JSON messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawServerMessage {
    WakeWordValidation {
        detection_id: u32,
        validated: bool,
        #[serde(default)]
        confidence: f32,
        #[serde(default)]
        energy_threshold_delta: Option<f32>,
    },
    ThresholdUpdate {
        #[serde(default)]
        energy_threshold: Option<f32>,
        #[serde(default)]
        confidence_threshold: Option<f32>,
        #[serde(default)]
        vad_amplitude_threshold: Option<u16>,
        #[serde(default)]
        vad_confidence_threshold: Option<f32>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        expires_ms: Option<u64>,
    },
    TrainingRequest {
        #[serde(default = "default_training_samples")]
        sample_count: u32,
        #[serde(default = "default_training_duration")]
        duration_ms: u32,
        #[serde(default)]
        label: Option<String>,
    },
    StatisticsRequest {},
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    TtsAudioStart {
        session_info: SessionInfo,
        #[serde(default)]
        audio_format: Option<TtsAudioFormat>,
        #[serde(default)]
        playback_config: Option<PlaybackSettings>,
    },
    TtsAudioChunk {
        chunk_info: ChunkInfo,
        #[serde(default)]
        timing: Option<ChunkTiming>,
    },
    TtsAudioEnd {
        session_summary: SessionSummary,
        #[serde(default)]
        playback_actions: Option<PlaybackActions>,
    },
    State {
        state: String,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

const fn default_training_samples() -> u32 {
    1
}

const fn default_training_duration() -> u32 {
    2000
}

/// Start of a TTS session
#[derive(Debug, Clone, PartialEq)]
pub struct TtsSessionStart {
    pub session_id: String,
    pub total_chunks_expected: u32,
    pub total_samples: u32,
    pub estimated_duration_ms: u32,
    pub sample_rate: u32,
    pub playback: PlaybackSettings,
    pub response_text: Option<String>,
}

/// One TTS audio chunk, from either frame kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsChunk {
    pub session_id: String,
    pub sequence: u32,
    pub is_final: bool,
    /// Additive checksum, 0 when the server sent none
    pub checksum: u32,
    pub start_ms: u32,
    pub duration_ms: u32,
    pub samples: Vec<i16>,
}

/// End of a TTS session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsSessionEnd {
    pub session_id: String,
    pub total_chunks_sent: u32,
    pub actions: PlaybackActions,
}

/// Server threshold recommendation
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRecommendation {
    pub wake_energy_threshold: Option<f32>,
    pub wake_confidence_threshold: Option<f32>,
    pub vad_amplitude_threshold: Option<u16>,
    pub vad_confidence_threshold: Option<f32>,
    pub reason: Option<String>,
    pub expires_ms: Option<u64>,
}

/// Typed inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    WakeWordValidation {
        detection_id: u32,
        validated: bool,
        server_confidence: f32,
        energy_threshold_delta: Option<f32>,
    },
    ThresholdUpdate(ThresholdRecommendation),
    TrainingRequest {
        sample_count: u32,
        duration_ms: u32,
        label: Option<String>,
    },
    StatisticsRequest,
    Ping { timestamp: Option<u64> },
    Pong { timestamp: Option<u64> },
    TtsStart(TtsSessionStart),
    TtsChunk(TtsChunk),
    TtsEnd(TtsSessionEnd),
    /// Server-side conversation phase (`listening`, `thinking`, `speaking`, ...)
    State { state: String },
    Error { code: Option<String>, message: String },
}

impl ServerMessage {
    /// Messages routed to the jitter buffer rather than the feedback adapter
    #[must_use]
    pub const fn is_tts(&self) -> bool {
        matches!(self, Self::TtsStart(_) | Self::TtsChunk(_) | Self::TtsEnd(_))
    }
}

fn check_session_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(Error::RemotePeer(format!(
            "session id length {} outside 1..={MAX_SESSION_ID_LEN}",
            id.len()
        )));
    }
    Ok(())
}

fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::RemotePeer(format!(
            "odd pcm payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Additive checksum over PCM payload bytes
#[must_use]
pub fn pcm_checksum(samples: &[i16]) -> u32 {
    samples.iter().fold(0u32, |acc, s| {
        let [lo, hi] = s.to_le_bytes();
        acc.wrapping_add(u32::from(lo)).wrapping_add(u32::from(hi))
    })
}

/// Parse a text frame
///
/// # Errors
///
/// Returns `Error::RemotePeer` for malformed JSON, unknown types, bad
/// session ids or undecodable audio
pub fn parse_text(text: &str) -> Result<ServerMessage> {
    let raw: RawServerMessage = serde_json::from_str(text)
        .map_err(|e| Error::RemotePeer(format!("invalid server message: {e}")))?;

    Ok(match raw {
        RawServerMessage::WakeWordValidation {
            detection_id,
            validated,
            confidence,
            energy_threshold_delta,
        } => ServerMessage::WakeWordValidation {
            detection_id,
            validated,
            server_confidence: confidence,
            energy_threshold_delta,
        },
        RawServerMessage::ThresholdUpdate {
            energy_threshold,
            confidence_threshold,
            vad_amplitude_threshold,
            vad_confidence_threshold,
            reason,
            expires_ms,
        } => ServerMessage::ThresholdUpdate(ThresholdRecommendation {
            wake_energy_threshold: energy_threshold,
            wake_confidence_threshold: confidence_threshold,
            vad_amplitude_threshold,
            vad_confidence_threshold,
            reason,
            expires_ms,
        }),
        RawServerMessage::TrainingRequest {
            sample_count,
            duration_ms,
            label,
        } => ServerMessage::TrainingRequest {
            sample_count,
            duration_ms,
            label,
        },
        RawServerMessage::StatisticsRequest {} => ServerMessage::StatisticsRequest,
        RawServerMessage::Ping { timestamp } => ServerMessage::Ping { timestamp },
        RawServerMessage::Pong { timestamp } => ServerMessage::Pong { timestamp },
        RawServerMessage::TtsAudioStart {
            session_info,
            audio_format,
            playback_config,
        } => {
            check_session_id(&session_info.session_id)?;
            let format = audio_format.unwrap_or_default();
            if format.channels != 1
                || format.bits_per_sample != 16
                || format.sample_rate != SAMPLE_RATE
            {
                return Err(Error::RemotePeer(format!(
                    "unsupported tts format {}ch {}-bit {}Hz",
                    format.channels, format.bits_per_sample, format.sample_rate
                )));
            }
            ServerMessage::TtsStart(TtsSessionStart {
                session_id: session_info.session_id,
                total_chunks_expected: session_info.total_chunks_expected,
                total_samples: format.total_samples,
                estimated_duration_ms: session_info.estimated_duration_ms,
                sample_rate: format.sample_rate,
                playback: playback_config.unwrap_or_default(),
                response_text: session_info.response_text,
            })
        }
        RawServerMessage::TtsAudioChunk { chunk_info, timing } => {
            check_session_id(&chunk_info.session_id)?;
            let bytes = BASE64
                .decode(chunk_info.audio_data.as_bytes())
                .map_err(|e| Error::RemotePeer(format!("tts chunk base64: {e}")))?;
            if chunk_info.chunk_size != 0 && chunk_info.chunk_size != bytes.len() {
                tracing::debug!(
                    declared = chunk_info.chunk_size,
                    actual = bytes.len(),
                    "tts chunk size mismatch"
                );
            }
            let checksum = match chunk_info.checksum {
                None => 0,
                Some(ChecksumField::Number(n)) => n,
                Some(ChecksumField::Hex(hex)) => {
                    let digits = hex.trim_start_matches("0x").trim_start_matches("0X");
                    u32::from_str_radix(digits, 16).map_err(|e| {
                        Error::RemotePeer(format!("tts chunk checksum {hex:?}: {e}"))
                    })?
                }
            };
            let timing = timing.unwrap_or_default();
            ServerMessage::TtsChunk(TtsChunk {
                session_id: chunk_info.session_id,
                sequence: chunk_info.chunk_sequence,
                is_final: chunk_info.is_final,
                checksum,
                start_ms: timing.chunk_start_time_ms,
                duration_ms: timing.chunk_duration_ms,
                samples: pcm_from_le_bytes(&bytes)?,
            })
        }
        RawServerMessage::TtsAudioEnd {
            session_summary,
            playback_actions,
        } => {
            check_session_id(&session_summary.session_id)?;
            ServerMessage::TtsEnd(TtsSessionEnd {
                session_id: session_summary.session_id,
                total_chunks_sent: session_summary.total_chunks_sent,
                actions: playback_actions.unwrap_or_default(),
            })
        }
        RawServerMessage::State { state } => ServerMessage::State { state },
        RawServerMessage::Error { code, message } => ServerMessage::Error { code, message },
    })
}

/// Parse a binary TTS chunk frame
///
/// # Errors
///
/// Returns `Error::RemotePeer` for truncated frames or bad session ids
pub fn parse_binary(bytes: &[u8]) -> Result<TtsChunk> {
    let id_len = usize::from(*bytes.first().ok_or_else(|| {
        Error::RemotePeer("empty binary frame".to_string())
    })?);
    if bytes.len() < BINARY_CHUNK_FIXED_LEN + id_len {
        return Err(Error::RemotePeer(format!(
            "binary chunk of {} bytes truncated",
            bytes.len()
        )));
    }

    let session_id = std::str::from_utf8(&bytes[1..=id_len])
        .map_err(|e| Error::RemotePeer(format!("binary chunk session id: {e}")))?
        .to_string();
    check_session_id(&session_id)?;

    let at = 1 + id_len;
    let sequence = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let flags = bytes[at + 4];
    let checksum = u32::from_le_bytes([
        bytes[at + 5],
        bytes[at + 6],
        bytes[at + 7],
        bytes[at + 8],
    ]);
    let samples = pcm_from_le_bytes(&bytes[at + 9..])?;

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = (samples.len() as u64 * 1000 / u64::from(SAMPLE_RATE)) as u32;

    Ok(TtsChunk {
        session_id,
        sequence,
        is_final: flags & BINARY_FLAG_FINAL != 0,
        checksum,
        start_ms: 0,
        duration_ms,
        samples,
    })
}

/// Serialize a TTS chunk into the binary frame layout
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the session id is too long
pub fn encode_binary(chunk: &TtsChunk) -> Result<Vec<u8>> {
    check_session_id(&chunk.session_id)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let id = chunk.session_id.as_bytes();
    let mut out = Vec::with_capacity(BINARY_CHUNK_FIXED_LEN + id.len() + chunk.samples.len() * 2);
    out.push(u8::try_from(id.len()).unwrap_or(u8::MAX));
    out.extend_from_slice(id);
    out.extend_from_slice(&chunk.sequence.to_le_bytes());
    out.push(if chunk.is_final { BINARY_FLAG_FINAL } else { 0 });
    out.extend_from_slice(&chunk.checksum.to_le_bytes());
    for s in &chunk.samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Ok(out)
}

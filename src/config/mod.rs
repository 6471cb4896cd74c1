//! Configuration for the voice terminal core
//!
//! One [`Config`] value is built at startup from defaults, an optional TOML
//! file and `VOICE_TERMINAL_*` environment variables. After startup only the
//! documented runtime updates (threshold swap, context, volume and gain) may
//! change detector or audio parameters.

pub mod file;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Voice terminal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub wake_word: WakeWordConfig,
    pub transport: TransportConfig,
    pub feedback: FeedbackConfig,
    pub playback: PlaybackConfig,
    pub discovery: DiscoveryConfig,
    pub coordinator: CoordinatorConfig,
    pub status: StatusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::conversation(),
            wake_word: WakeWordConfig::default(),
            transport: TransportConfig::default(),
            feedback: FeedbackConfig::default(),
            playback: PlaybackConfig::default(),
            discovery: DiscoveryConfig::default(),
            coordinator: CoordinatorConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

/// Capture and playback parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_bits_per_sample: u16,
    pub capture_channels: u16,
    pub capture_chunk_samples: usize,
    /// Pre-delivery gain on captured audio, 0.5 to 2.0
    pub microphone_gain: f32,
    /// Playback scale, 0.0 to 1.0
    pub playback_volume: f32,
    /// Outstanding playback frames before `submit` reports full
    pub playback_buffer_frames: usize,
    /// Captured frames buffered between the driver and the audio task
    pub capture_buffer_frames: usize,
    /// Re-enter listening after TTS finishes
    pub auto_start_after_tts: bool,
    /// Listening gives up after this long without speech (0 disables)
    pub silence_timeout_ms: u32,
    pub visual_feedback: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: crate::audio::SAMPLE_RATE,
            capture_bits_per_sample: 16,
            capture_channels: 1,
            capture_chunk_samples: crate::audio::FRAME_SAMPLES,
            microphone_gain: 1.0,
            playback_volume: 0.8,
            playback_buffer_frames: 32,
            capture_buffer_frames: 16,
            auto_start_after_tts: false,
            silence_timeout_ms: 5000,
            visual_feedback: true,
        }
    }
}

/// Which optional VAD layers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct VadFeatures {
    pub adaptive: bool,
    pub spectral: bool,
    pub consistency: bool,
    pub snr: bool,
    pub conversation_aware: bool,
}

impl Default for VadFeatures {
    fn default() -> Self {
        Self {
            adaptive: true,
            spectral: true,
            consistency: true,
            snr: true,
            conversation_aware: true,
        }
    }
}

/// VAD evaluation depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Every enabled layer on every frame
    Full,
    /// Fast path in active conversation
    #[default]
    Optimized,
    /// Energy layer only
    Minimal,
}

/// Voice activity detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default = "VadConfig::conversation")]
pub struct VadConfig {
    /// Base amplitude threshold (int16 scale)
    pub amplitude_threshold: u16,
    pub silence_threshold_ms: u32,
    pub min_voice_duration_ms: u32,
    pub noise_floor_alpha: f32,
    pub snr_threshold_db: f32,
    pub adaptation_window_ms: u32,
    pub zcr_min: u16,
    pub zcr_max: u16,
    pub low_freq_ratio_threshold: f32,
    pub spectral_rolloff_threshold: f32,
    pub consistency_frames: usize,
    pub confidence_threshold: f32,
    pub features: VadFeatures,
    pub processing_mode: ProcessingMode,
    pub idle_multiplier: f32,
    pub listening_multiplier: f32,
    pub speaking_multiplier: f32,
    pub processing_multiplier: f32,
    pub echo_suppression_db: f32,
    pub tts_fade_time_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 2000,
            silence_threshold_ms: 1500,
            min_voice_duration_ms: 200,
            noise_floor_alpha: 0.05,
            snr_threshold_db: 8.0,
            adaptation_window_ms: 500,
            zcr_min: 5,
            zcr_max: 200,
            low_freq_ratio_threshold: 0.4,
            spectral_rolloff_threshold: 0.85,
            consistency_frames: 5,
            confidence_threshold: 0.6,
            features: VadFeatures::default(),
            processing_mode: ProcessingMode::default(),
            idle_multiplier: 0.8,
            listening_multiplier: 1.0,
            speaking_multiplier: 1.5,
            processing_multiplier: 1.0,
            echo_suppression_db: 15.0,
            tts_fade_time_ms: 200,
        }
    }
}

impl VadConfig {
    /// Preset tuned for conversational turn-taking
    #[must_use]
    pub fn conversation() -> Self {
        Self {
            silence_threshold_ms: 1000,
            idle_multiplier: 0.75,
            speaking_multiplier: 1.7,
            echo_suppression_db: 18.0,
            tts_fade_time_ms: 150,
            ..Self::default()
        }
    }
}

/// Wake-word detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub enabled: bool,
    /// Base RMS energy threshold (int16 scale)
    pub energy_threshold: f32,
    pub confidence_threshold: f32,
    /// Trailing silence that closes a candidate utterance
    pub silence_timeout_ms: u32,
    /// Frames analyzed per candidate, 15 to 25
    pub pattern_frames: usize,
    /// Frames of agreement before a candidate opens, 3 to 7
    pub consistency_frames: usize,
    pub expected_syllables: u8,
    pub max_detections_per_minute: u32,
    pub enable_adaptation: bool,
    pub adaptation_rate: f32,
    /// Keep detecting while a conversation is active
    pub enable_during_conversation: bool,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 3500.0,
            confidence_threshold: 0.65,
            silence_timeout_ms: 300,
            pattern_frames: 20,
            consistency_frames: 3,
            expected_syllables: 3,
            max_detections_per_minute: 10,
            enable_adaptation: true,
            adaptation_rate: 0.05,
            enable_during_conversation: false,
        }
    }
}

/// Datagram and reliable channel parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server host when discovery is not used
    pub server_host: Option<String>,
    pub audio_port: u16,
    pub control_port: u16,
    pub control_path: String,
    pub silence_suppression: bool,
    pub silence_packet_interval_ms: u32,
    /// Compression hook for persistently low-confidence audio
    pub adaptive_bitrate: bool,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub keepalive_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// A control frame write slower than this drops the connection
    pub write_timeout_ms: u64,
    pub outbound_queue_depth: usize,
    /// Queued audio metadata older than this is dropped on disconnect
    pub metadata_max_age_ms: u64,
    /// Malformed inbound messages tolerated per window before disconnecting
    pub max_peer_faults: u32,
    pub peer_fault_window_ms: u64,
    /// Mirror speech segments over the control channel as
    /// `voice_detected`, `audio_stream` and `voice_ended`
    pub audio_stream: bool,
    /// Frames per `audio_stream` message
    pub audio_stream_batch_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_host: None,
            audio_port: 8000,
            control_port: 8001,
            control_path: "/vad_feedback".to_string(),
            silence_suppression: true,
            silence_packet_interval_ms: 100,
            adaptive_bitrate: false,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: None,
            keepalive_interval_ms: 30_000,
            connection_timeout_ms: 5000,
            write_timeout_ms: 5000,
            outbound_queue_depth: 64,
            metadata_max_age_ms: 2000,
            max_peer_faults: 10,
            peer_fault_window_ms: 60_000,
            audio_stream: true,
            audio_stream_batch_frames: 10,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Server-feedback parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub device_id: String,
    pub device_name: String,
    pub room: String,
    pub validation_timeout_ms: u64,
    pub statistics_interval_ms: u64,
    /// Largest base64 payload per training message
    pub training_chunk_bytes: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        // Without a hostname, a random suffix keeps terminals apart
        let host = hostname::get().map_or_else(
            |_| uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            |h| h.to_string_lossy().to_string(),
        );

        Self {
            device_id: format!("vt-{host}"),
            device_name: "voice-terminal".to_string(),
            room: "unknown".to_string(),
            validation_timeout_ms: 3000,
            statistics_interval_ms: 60_000,
            training_chunk_bytes: 8192,
        }
    }
}

/// TTS jitter buffer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Pause when buffered audio falls below this
    pub min_buffer_ms: u32,
    /// Start or resume once buffered audio reaches this
    pub start_threshold_ms: u32,
    /// Oldest audio is dropped beyond this
    pub max_buffer_ms: u32,
    pub default_fade_in_ms: u32,
    pub default_fade_out_ms: u32,
    /// Smoothing for the published echo level
    pub echo_level_alpha: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_buffer_ms: 0,
            start_threshold_ms: 60,
            max_buffer_ms: 10_000,
            default_fade_in_ms: 10,
            default_fade_out_ms: 50,
            echo_level_alpha: 0.3,
        }
    }
}

/// Server discovery and device advertisement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mdns: bool,
    pub advertise: bool,
    /// Static endpoints as `host:audio_port:control_port`
    pub static_endpoints: Vec<String>,
    pub scan_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub capabilities: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns: true,
            advertise: true,
            static_endpoints: Vec::new(),
            scan_interval_ms: 5000,
            health_check_interval_ms: 30_000,
            health_timeout_ms: 5000,
            capabilities: "audio,tts,vad,wake_word".to_string(),
        }
    }
}

/// Conversation coordinator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Consecutive failed reconnects before entering error
    pub max_transport_failures: u32,
    /// Supervisor exits when error persists this long
    pub error_grace_period_ms: u64,
    /// Cycle period of the coordinator timer
    pub tick_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_transport_failures: 10,
            error_grace_period_ms: 60_000,
            tick_ms: 20,
        }
    }
}

/// Local status server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then TOML file, then environment
    ///
    /// When `path` is `None` the standard config path is tried.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be read or parsed,
    /// or if the resulting values are out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => file::read_config_file(p)?,
            None => file::load_config_file(),
        };

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Overlay `VOICE_TERMINAL_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("VOICE_TERMINAL_SERVER_HOST") {
            self.transport.server_host = Some(host);
        }
        if let Some(port) = env_parse("VOICE_TERMINAL_AUDIO_PORT") {
            self.transport.audio_port = port;
        }
        if let Some(port) = env_parse("VOICE_TERMINAL_CONTROL_PORT") {
            self.transport.control_port = port;
        }
        if let Some(enabled) = env_parse("VOICE_TERMINAL_SILENCE_SUPPRESSION") {
            self.transport.silence_suppression = enabled;
        }
        if let Ok(id) = std::env::var("VOICE_TERMINAL_DEVICE_ID") {
            self.feedback.device_id = id;
        }
        if let Ok(room) = std::env::var("VOICE_TERMINAL_ROOM") {
            self.feedback.room = room;
        }
        if let Some(threshold) = env_parse("VOICE_TERMINAL_VAD_THRESHOLD") {
            self.vad.amplitude_threshold = threshold;
        }
        if let Some(threshold) = env_parse("VOICE_TERMINAL_WAKE_WORD_THRESHOLD") {
            self.wake_word.energy_threshold = threshold;
        }
        if let Some(port) = env_parse("VOICE_TERMINAL_STATUS_PORT") {
            self.status.port = port;
        }
    }

    /// Check every bounded parameter
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the first out-of-range value
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.capture_sample_rate != crate::audio::SAMPLE_RATE
            || audio.capture_bits_per_sample != 16
            || audio.capture_channels != 1
            || audio.capture_chunk_samples != crate::audio::FRAME_SAMPLES
        {
            return Err(invalid(
                "audio format is fixed at 16 kHz, 16-bit, mono, 320-sample frames",
            ));
        }
        check_range("audio.microphone_gain", audio.microphone_gain, 0.5, 2.0)?;
        check_range("audio.playback_volume", audio.playback_volume, 0.0, 1.0)?;
        if audio.playback_buffer_frames == 0 || audio.capture_buffer_frames == 0 {
            return Err(invalid("audio buffer sizes must be non-zero"));
        }

        let vad = &self.vad;
        if vad.amplitude_threshold == 0 {
            return Err(invalid("vad.amplitude_threshold must be non-zero"));
        }
        check_range("vad.noise_floor_alpha", vad.noise_floor_alpha, 0.01, 0.10)?;
        check_range("vad.confidence_threshold", vad.confidence_threshold, 0.0, 1.0)?;
        if !(1..=crate::vad::MAX_CONSISTENCY_FRAMES).contains(&vad.consistency_frames) {
            return Err(invalid(format!(
                "vad.consistency_frames must be in 1..={}",
                crate::vad::MAX_CONSISTENCY_FRAMES
            )));
        }
        if vad.zcr_min > vad.zcr_max {
            return Err(invalid("vad.zcr_min exceeds vad.zcr_max"));
        }

        let ww = &self.wake_word;
        check_range("wake_word.energy_threshold", ww.energy_threshold, 1.0, 32767.0)?;
        check_range("wake_word.confidence_threshold", ww.confidence_threshold, 0.1, 1.0)?;
        if !(15..=25).contains(&ww.pattern_frames) {
            return Err(invalid("wake_word.pattern_frames must be in 15..=25"));
        }
        if !(3..=7).contains(&ww.consistency_frames) {
            return Err(invalid("wake_word.consistency_frames must be in 3..=7"));
        }
        if ww.max_detections_per_minute == 0 {
            return Err(invalid("wake_word.max_detections_per_minute must be non-zero"));
        }

        let transport = &self.transport;
        if transport.silence_suppression
            && !(100..=1000).contains(&transport.silence_packet_interval_ms)
        {
            return Err(invalid(
                "transport.silence_packet_interval_ms must be in 100..=1000",
            ));
        }
        if transport.outbound_queue_depth == 0 {
            return Err(invalid("transport.outbound_queue_depth must be non-zero"));
        }
        if transport.write_timeout_ms == 0 {
            return Err(invalid("transport.write_timeout_ms must be non-zero"));
        }
        if transport.audio_stream && transport.audio_stream_batch_frames == 0 {
            return Err(invalid("transport.audio_stream_batch_frames must be non-zero"));
        }
        if transport.reconnect_initial_ms == 0
            || transport.reconnect_initial_ms > transport.reconnect_max_ms
        {
            return Err(invalid("transport reconnect delays are inconsistent"));
        }

        if self.feedback.device_id.is_empty() {
            return Err(invalid("feedback.device_id must not be empty"));
        }

        let playback = &self.playback;
        if playback.min_buffer_ms > playback.start_threshold_ms
            || playback.start_threshold_ms > playback.max_buffer_ms
        {
            return Err(invalid(
                "playback buffer levels must satisfy min <= start <= max",
            ));
        }
        check_range("playback.echo_level_alpha", playback.echo_level_alpha, 0.0, 1.0)?;

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidInput(msg.into())
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} = {value} outside {min}..={max}")))
    }
}

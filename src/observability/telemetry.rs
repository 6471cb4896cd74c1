//! Pipeline counters fed from the audio task

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Smoothing for the audio latency average
pub const LATENCY_ALPHA: f64 = 0.1;

/// Exponential moving average of a latency
#[derive(Debug)]
pub struct LatencyEma {
    alpha: f64,
    state: Mutex<(Option<f64>, u64)>,
}

impl LatencyEma {
    #[must_use]
    pub const fn new(alpha: f64) -> Self {
        Self {
            alpha,
            state: Mutex::new((None, 0)),
        }
    }

    /// Fold one measurement in; the first sample seeds the average
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 = Some(match state.0 {
            Some(avg) => self.alpha.mul_add(ms, (1.0 - self.alpha) * avg),
            None => ms,
        });
        state.1 += 1;
    }

    #[must_use]
    pub fn average_ms(&self) -> Option<f64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    #[must_use]
    pub fn samples(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

/// Shared audio-path counters
#[derive(Debug)]
pub struct Telemetry {
    started: Instant,
    latency: LatencyEma,
    /// Last frame RMS normalized to 0..1, stored as f32 bits
    audio_level: AtomicU32,
    frames_captured: AtomicU64,
    capture_timeouts: AtomicU64,
    codec_faults: AtomicU64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Telemetry`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub uptime_ms: u64,
    pub audio_latency_ms: Option<f64>,
    pub latency_samples: u64,
    pub audio_level: f32,
    pub frames_captured: u64,
    pub capture_timeouts: u64,
    pub codec_faults: u64,
}

impl Telemetry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            latency: LatencyEma::new(LATENCY_ALPHA),
            audio_level: AtomicU32::new(0),
            frames_captured: AtomicU64::new(0),
            capture_timeouts: AtomicU64::new(0),
            codec_faults: AtomicU64::new(0),
        }
    }

    /// Record one frame that made it from capture to the datagram socket
    pub fn record_frame(&self, latency: Duration, rms: f32) {
        self.latency.record(latency);
        let level = (rms / 32768.0).clamp(0.0, 1.0);
        self.audio_level.store(level.to_bits(), Ordering::Relaxed);
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_timeout(&self) {
        self.capture_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codec_fault(&self) {
        self.codec_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn audio_level(&self) -> f32 {
        f32::from_bits(self.audio_level.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            uptime_ms: u64::try_from(self.uptime().as_millis()).unwrap_or(u64::MAX),
            audio_latency_ms: self.latency.average_ms(),
            latency_samples: self.latency.samples(),
            audio_level: self.audio_level(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_timeouts: self.capture_timeouts.load(Ordering::Relaxed),
            codec_faults: self.codec_faults.load(Ordering::Relaxed),
        }
    }
}

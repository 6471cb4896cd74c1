//! Diagnostic snapshot across every component

use std::sync::Arc;

use serde::Serialize;

use super::telemetry::{Telemetry, TelemetrySnapshot};
use crate::coordinator::{ConversationState, Coordinator, CoordinatorStats};
use crate::discovery::{DiscoveryHandle, ServerEndpoint};
use crate::feedback::{FeedbackHandle, FeedbackStats};
use crate::playback::{PlayerHandle, PlaybackStatus};
use crate::transport::{ChannelHandle, ChannelSnapshot, DatagramSnapshot, DatagramStats};
use crate::transport::messages::timestamp_ms;
use crate::vad::{DetectorHandle, DetectorStats};

/// Full read-only view of the terminal
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub timestamp: u64,
    pub version: &'static str,
    pub state: ConversationState,
    pub free_memory_kb: Option<u64>,
    /// Wireless signal strength when the platform reports it
    pub wifi_rssi: Option<i32>,
    pub server: Option<ServerEndpoint>,
    pub telemetry: TelemetrySnapshot,
    pub datagram: DatagramSnapshot,
    pub channel: ChannelSnapshot,
    pub detector: DetectorStats,
    pub playback: PlaybackStatus,
    pub feedback: FeedbackStats,
    pub coordinator: CoordinatorStats,
}

/// Produces diagnostics on demand
pub trait DiagnosticsSource: Send + Sync {
    fn diagnostics(&self) -> Diagnostics;
}

/// Diagnostics gathered from the running components
pub struct DeviceDiagnostics {
    pub telemetry: Arc<Telemetry>,
    pub datagram: Arc<DatagramStats>,
    pub channel: ChannelHandle,
    pub detector: DetectorHandle,
    pub player: PlayerHandle,
    pub feedback: FeedbackHandle,
    pub coordinator: Arc<Coordinator>,
    pub discovery: Option<DiscoveryHandle>,
}

impl DiagnosticsSource for DeviceDiagnostics {
    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            timestamp: timestamp_ms(),
            version: env!("CARGO_PKG_VERSION"),
            state: self.coordinator.state(),
            free_memory_kb: free_memory_kb(),
            wifi_rssi: None,
            server: self.discovery.as_ref().and_then(DiscoveryHandle::best),
            telemetry: self.telemetry.snapshot(),
            datagram: self.datagram.snapshot(),
            channel: self.channel.stats(),
            detector: self.detector.stats(),
            playback: self.player.status(),
            feedback: self.feedback.stats(),
            coordinator: self.coordinator.stats(),
        }
    }
}

/// Available memory from `/proc/meminfo`, `None` where unsupported
#[must_use]
pub fn free_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<u64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
    };
    field("MemAvailable:").or_else(|| field("MemFree:"))
}

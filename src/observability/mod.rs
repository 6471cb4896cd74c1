//! Counters, diagnostics and the local status server
//!
//! Nothing here feeds back into the pipeline.

mod diagnostics;
mod server;
mod telemetry;

pub use diagnostics::{DeviceDiagnostics, Diagnostics, DiagnosticsSource, free_memory_kb};
pub use server::{HealthResponse, StatusResponse, StatusServer, router};
pub use telemetry::{LATENCY_ALPHA, LatencyEma, Telemetry, TelemetrySnapshot};

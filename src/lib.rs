//! Voice Terminal - the device core of a networked voice assistant
//!
//! Captures microphone audio, classifies each frame for voice activity and
//! wake words, streams it to a discovered server and plays back the spoken
//! reply:
//! - Audio I/O rings between the codec driver and the pipeline
//! - Voice activity and wake word detection
//! - UDP audio datagrams and a reliable WebSocket control channel
//! - Conversation coordination and server feedback
//! - Server discovery with health checks
//! - TTS jitter buffering
//!
//! # Architecture
//!
//! ```text
//!   mic ──► capture ring ──► detector ──► datagram sender ──► server
//!                               ▲                               │
//!              feedback adapter ┘◄──── reliable channel ◄───────┘
//!                      │                     │
//!                      ▼                     ▼
//!                 coordinator ◄──────── TTS player ──► playback ring ──► speaker
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod feedback;
pub mod observability;
pub mod pipeline;
pub mod playback;
pub mod shutdown;
pub mod transport;
pub mod vad;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};

//! Server transport
//!
//! Captured audio and detection metadata travel on an unreliable datagram
//! channel. Control messages and TTS audio travel on a reliable WebSocket.

mod backoff;
mod datagram;
pub mod messages;
pub mod packet;
mod reliable;

pub use backoff::ReconnectPolicy;
pub use datagram::{
    DatagramSender, DatagramSnapshot, DatagramStats, SendOutcome, SendReason, SilenceSuppressor,
};
pub use messages::{ClientMessage, ServerMessage, TtsChunk, TtsSessionEnd, TtsSessionStart};
pub use packet::{AudioPacket, PacketKind, decode_packet, encode_packet};
pub use reliable::{
    ChannelEvent, ChannelHandle, ChannelSnapshot, ChannelStats, ConnectionState, DeviceIdentity,
    ReliableChannel, control_url,
};

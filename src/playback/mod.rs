//! TTS playback
//!
//! Server TTS chunks are reordered per session in a jitter buffer and
//! pumped frame by frame into the speaker ring.

mod jitter;
mod player;

pub use jitter::{ChunkOutcome, JitterBuffer, PlaybackState, PlaybackStatus, Pull};
pub use player::{PlaybackEvent, Player, PlayerHandle};

//! Server feedback
//!
//! Local wake word triggers are reported to the server and held in a
//! pending table until a verdict arrives or they expire. Server threshold
//! recommendations and training requests flow back into the detector.

mod adapter;
mod pending;
mod training;

pub use adapter::{
    FeedbackAdapter, FeedbackEvent, FeedbackHandle, FeedbackInput, FeedbackStats, MessageSink,
};
pub use pending::{PendingTable, Resolved};
pub use training::{TrainingMode, encode_chunks};

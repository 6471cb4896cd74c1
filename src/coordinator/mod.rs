//! Conversation coordinator
//!
//! A single state machine decides when the microphone, speaker, detector
//! context and display change. Every other component reports events here
//! instead of toggling hardware itself.

mod machine;
mod peripherals;
mod state;

pub use machine::{Coordinator, CoordinatorEvent, CoordinatorInputs, CoordinatorStats};
pub use peripherals::{DevicePeripherals, Peripherals};
pub use state::{ConversationState, DisplayState};

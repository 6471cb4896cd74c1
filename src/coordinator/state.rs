//! Conversation states and the allowed moves between them

use std::fmt;

use serde::Serialize;

use crate::vad::ConversationContext;

/// Top-level conversation state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl ConversationState {
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Listening,
        Self::Processing,
        Self::Speaking,
        Self::Error,
    ];

    /// Whether `self -> to` is in the transition table
    #[must_use]
    pub const fn can_move_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Listening)
                | (Self::Listening, Self::Processing | Self::Idle)
                | (Self::Processing, Self::Speaking)
                | (Self::Speaking, Self::Idle | Self::Listening)
                | (Self::Error, Self::Idle)
                | (Self::Idle | Self::Listening | Self::Processing | Self::Speaking, Self::Error)
        )
    }

    /// Detector context while in this state
    #[must_use]
    pub const fn vad_context(self) -> ConversationContext {
        match self {
            Self::Idle | Self::Error => ConversationContext::Idle,
            Self::Listening => ConversationContext::Listening,
            Self::Processing => ConversationContext::Processing,
            Self::Speaking => ConversationContext::Speaking,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the display collaborator should show
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "display", content = "reason", rename_all = "snake_case")]
pub enum DisplayState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Error(String),
    /// No server endpoint known yet
    Searching,
    /// Endpoint known, control channel not up
    Connecting,
}

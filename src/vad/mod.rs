//! Voice activity and wake word detection

mod consistency;
mod detector;
mod engine;
mod spectral;
mod wake_word;

pub use consistency::{ConsistencyWindow, MAX_CONSISTENCY_FRAMES, Vote};
pub use detector::{Detector, DetectorHandle, DetectorStats, ThresholdUpdate, WakeVerdict};
pub use engine::{ConversationContext, DetectionResult, VadEngine, VadStats};
pub use spectral::{SpectralFeatures, analyze};
pub use wake_word::{
    ConfidenceLevel, MAX_PATTERN_FRAMES, WakeWordDetector, WakeWordEvent, WakeWordState,
    WakeWordStats, calculate_energy, count_syllables, pattern_correlation,
};

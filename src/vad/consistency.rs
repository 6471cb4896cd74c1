//! Multi-frame majority voting

/// Upper bound on the consistency window
pub const MAX_CONSISTENCY_FRAMES: usize = 16;

/// Bounded ring of the last K frame decisions and confidences
///
/// Confidences are stored in thousandths so the vote at the exact
/// threshold is decided by integer comparison.
#[derive(Debug, Clone)]
pub struct ConsistencyWindow {
    decisions: [bool; MAX_CONSISTENCY_FRAMES],
    confidences: [u16; MAX_CONSISTENCY_FRAMES],
    len: usize,
    filled: usize,
    next: usize,
}

/// Outcome of one vote
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub voice: bool,
    pub average_confidence: f32,
}

impl ConsistencyWindow {
    /// Create a window of `len` frames, clamped to 1..=[`MAX_CONSISTENCY_FRAMES`]
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            decisions: [false; MAX_CONSISTENCY_FRAMES],
            confidences: [0; MAX_CONSISTENCY_FRAMES],
            len: len.clamp(1, MAX_CONSISTENCY_FRAMES),
            filled: 0,
            next: 0,
        }
    }

    /// Record a frame and vote over the window
    ///
    /// Voice requires at least 60% positive frames and an average
    /// confidence at or above `threshold`.
    pub fn push(&mut self, decision: bool, confidence: f32, threshold: f32) -> Vote {
        self.decisions[self.next] = decision;
        self.confidences[self.next] = to_milli(confidence);
        self.next = (self.next + 1) % self.len;
        self.filled = (self.filled + 1).min(self.len);

        let positives = self.decisions[..self.filled].iter().filter(|&&d| d).count();
        let sum: u32 = self.confidences[..self.filled]
            .iter()
            .map(|&c| u32::from(c))
            .sum();

        let filled = u32::try_from(self.filled).unwrap_or(u32::MAX);
        let majority = positives * 5 >= self.filled * 3;
        let confident = sum >= u32::from(to_milli(threshold)) * filled;

        #[allow(clippy::cast_precision_loss)]
        let average_confidence = sum as f32 / (filled as f32 * 1000.0);

        Vote {
            voice: majority && confident,
            average_confidence,
        }
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.next = 0;
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_milli(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * 1000.0).round() as u16
}

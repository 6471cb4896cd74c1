//! Wake word detections awaiting a server verdict

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Pending {
    sent_at: Instant,
    confidence: f32,
}

/// A resolved detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub latency: Duration,
    pub confidence: f32,
}

/// Detection ids with an expiry
#[derive(Debug)]
pub struct PendingTable {
    entries: HashMap<u32, Pending>,
    timeout: Duration,
}

impl PendingTable {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Track a detection; returns false if the id is already pending
    pub fn insert(&mut self, detection_id: u32, confidence: f32, now: Instant) -> bool {
        if self.entries.contains_key(&detection_id) {
            return false;
        }
        self.entries.insert(
            detection_id,
            Pending {
                sent_at: now,
                confidence,
            },
        );
        true
    }

    /// Take a detection out of the table if it has not expired
    pub fn resolve(&mut self, detection_id: u32, now: Instant) -> Option<Resolved> {
        let pending = self.entries.remove(&detection_id)?;
        let latency = now.saturating_duration_since(pending.sent_at);
        (latency <= self.timeout).then_some(Resolved {
            latency,
            confidence: pending.confidence,
        })
    }

    /// Drop and return every detection older than the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.timeout;
        let mut expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

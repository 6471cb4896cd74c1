//! Known servers and their ranking

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use super::endpoint::{ServerEndpoint, ServerHealth};

/// A server together with its latest health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub endpoint: ServerEndpoint,
    pub health: Option<ServerHealth>,
}

impl Candidate {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.health.as_ref().is_some_and(|h| h.online)
    }

    fn response_time(&self) -> Option<u64> {
        self.health
            .as_ref()
            .filter(|h| h.online)
            .map(|h| h.response_time_ms)
    }
}

/// Online first, then fastest, then most recently seen
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.is_online()
        .cmp(&a.is_online())
        .then_with(|| match (a.response_time(), b.response_time()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| b.endpoint.last_seen.cmp(&a.endpoint.last_seen))
}

/// Registry of discovered servers
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, Candidate>,
}

impl ServerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server or refresh one already known, keeping its health
    pub fn upsert(&mut self, endpoint: ServerEndpoint) {
        match self.servers.get_mut(&endpoint.key()) {
            Some(existing) => existing.endpoint = endpoint,
            None => {
                tracing::info!(endpoint = %endpoint, origin = ?endpoint.origin, "server discovered");
                self.servers.insert(
                    endpoint.key(),
                    Candidate {
                        endpoint,
                        health: None,
                    },
                );
            }
        }
    }

    /// Attach a health result; unknown keys are ignored
    pub fn record_health(&mut self, key: &str, health: ServerHealth) {
        if let Some(candidate) = self.servers.get_mut(key) {
            if candidate.is_online() != health.online {
                tracing::info!(server = key, online = health.online, "server health changed");
            }
            candidate.health = Some(health);
        }
    }

    /// Endpoints to health-check
    #[must_use]
    pub fn endpoints(&self) -> Vec<ServerEndpoint> {
        self.servers.values().map(|c| c.endpoint.clone()).collect()
    }

    /// Every server, best first
    #[must_use]
    pub fn ranked(&self) -> Vec<Candidate> {
        let mut all: Vec<_> = self.servers.values().cloned().collect();
        all.sort_by(rank);
        all
    }

    /// Best online server
    #[must_use]
    pub fn best(&self) -> Option<ServerEndpoint> {
        self.servers
            .values()
            .filter(|c| c.is_online())
            .min_by(|a, b| rank(a, b))
            .map(|c| c.endpoint.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn health(online: bool, ms: u64) -> ServerHealth {
        if online {
            ServerHealth {
                online: true,
                response_time_ms: ms,
                cpu_usage: None,
                memory_usage: None,
                active_sessions: None,
                version: None,
                status: "ok".to_string(),
                checked_at: Utc::now(),
            }
        } else {
            ServerHealth::unreachable(ms)
        }
    }

    #[test]
    fn test_ranking_order() {
        let mut reg = ServerRegistry::new();
        let now = Utc::now();
        for (host, age) in [("slow", 0), ("fast", 10), ("down", 0), ("unknown", 0)] {
            let mut ep = ServerEndpoint::new(host, 8000, 8001);
            ep.last_seen = now - Duration::seconds(age);
            reg.upsert(ep);
        }
        reg.record_health("slow:8001", health(true, 80));
        reg.record_health("fast:8001", health(true, 15));
        reg.record_health("down:8001", health(false, 5000));

        let hosts: Vec<_> = reg.ranked().into_iter().map(|c| c.endpoint.host).collect();
        assert_eq!(hosts[..2], ["fast", "slow"]);
        assert_eq!(reg.best().unwrap().host, "fast");
    }

    #[test]
    fn test_tie_broken_by_last_seen() {
        let mut reg = ServerRegistry::new();
        let now = Utc::now();
        let mut old = ServerEndpoint::new("old", 1, 2);
        old.last_seen = now - Duration::seconds(60);
        let mut new = ServerEndpoint::new("new", 1, 2);
        new.last_seen = now;
        reg.upsert(old);
        reg.upsert(new);
        reg.record_health("old:2", health(true, 20));
        reg.record_health("new:2", health(true, 20));
        assert_eq!(reg.best().unwrap().host, "new");
    }

    #[test]
    fn test_no_best_when_all_offline() {
        let mut reg = ServerRegistry::new();
        reg.upsert(ServerEndpoint::new("a", 1, 2));
        assert!(reg.best().is_none());
        reg.record_health("a:2", health(false, 5000));
        assert!(reg.best().is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_health() {
        let mut reg = ServerRegistry::new();
        reg.upsert(ServerEndpoint::new("a", 1, 2));
        reg.record_health("a:2", health(true, 10));
        reg.upsert(ServerEndpoint::new("a", 1, 2));
        assert!(reg.ranked()[0].is_online());
    }
}

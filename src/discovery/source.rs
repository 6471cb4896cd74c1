//! Endpoint sources

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::endpoint::ServerEndpoint;
use crate::Result;

/// Something that can produce candidate servers
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Collect endpoints visible within `window`
    ///
    /// # Errors
    ///
    /// Returns error if the source is unusable
    async fn scan(&self, window: Duration) -> Result<Vec<ServerEndpoint>>;
}

/// Endpoints listed in configuration
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints {
    endpoints: Vec<ServerEndpoint>,
}

impl StaticEndpoints {
    /// Parse `host:audio_port:control_port` entries
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for the first malformed entry
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let endpoints = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { endpoints })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[async_trait]
impl EndpointSource for StaticEndpoints {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn scan(&self, _window: Duration) -> Result<Vec<ServerEndpoint>> {
        let now = Utc::now();
        Ok(self
            .endpoints
            .iter()
            .cloned()
            .map(|mut e| {
                e.last_seen = now;
                e
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_scan_refreshes_last_seen() {
        let source = StaticEndpoints::parse(&["a:1:2", "b:3:4"]).unwrap();
        let before = Utc::now();
        let found = source.scan(Duration::ZERO).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| e.last_seen >= before));
    }

    #[test]
    fn test_static_parse_error() {
        assert!(StaticEndpoints::parse(&["a:1"]).is_err());
        assert!(StaticEndpoints::parse::<&str>(&[]).unwrap().is_empty());
    }
}

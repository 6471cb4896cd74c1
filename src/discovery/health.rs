//! HTTP health checks against candidate servers

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use super::endpoint::{ServerEndpoint, ServerHealth};
use crate::Result;

/// Body of a server's `/health` response; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthBody {
    status: Option<String>,
    version: Option<String>,
    cpu_usage: Option<f32>,
    memory_usage: Option<f32>,
    active_sessions: Option<u32>,
}

/// Probes `GET /health`
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("voice-terminal/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Check one server
    ///
    /// Never fails: an unreachable or erroring server yields an offline
    /// record with status `unreachable`.
    pub async fn check(&self, endpoint: &ServerEndpoint) -> ServerHealth {
        let url = format!("{}/health", endpoint.http_base());
        let started = Instant::now();
        let result = self.fetch(&url).await;
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(body) => {
                tracing::debug!(endpoint = %endpoint, response_time_ms, "server healthy");
                ServerHealth {
                    online: true,
                    response_time_ms,
                    cpu_usage: body.cpu_usage,
                    memory_usage: body.memory_usage,
                    active_sessions: body.active_sessions,
                    version: body.version,
                    status: body.status.unwrap_or_else(|| "ok".to_string()),
                    checked_at: Utc::now(),
                }
            }
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "health check failed");
                ServerHealth::unreachable(response_time_ms)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<HealthBody> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        // Servers that answer 200 with a non-JSON body still count as online
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }
}

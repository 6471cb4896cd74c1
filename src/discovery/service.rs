//! Periodic scanning and health checking

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use super::endpoint::ServerEndpoint;
use super::health::HealthChecker;
use super::mdns::MdnsBrowser;
use super::registry::{Candidate, ServerRegistry};
use super::source::{EndpointSource, StaticEndpoints};
use crate::Result;
use crate::config::Config;
use crate::shutdown::Shutdown;

/// How long one mDNS browse listens
const SCAN_WINDOW: Duration = Duration::from_secs(3);

/// Read side of discovery
#[derive(Clone)]
pub struct DiscoveryHandle {
    registry: Arc<RwLock<ServerRegistry>>,
    best: watch::Receiver<Option<ServerEndpoint>>,
}

impl DiscoveryHandle {
    /// Every known server, best first
    pub async fn ranked(&self) -> Vec<Candidate> {
        self.registry.read().await.ranked()
    }

    #[must_use]
    pub fn best(&self) -> Option<ServerEndpoint> {
        self.best.borrow().clone()
    }

    /// Watch the best online server
    #[must_use]
    pub fn subscribe_best(&self) -> watch::Receiver<Option<ServerEndpoint>> {
        self.best.clone()
    }
}

/// Runs endpoint sources and health checks
pub struct Discovery {
    sources: Vec<Box<dyn EndpointSource>>,
    checker: HealthChecker,
    registry: Arc<RwLock<ServerRegistry>>,
    best: watch::Sender<Option<ServerEndpoint>>,
    scan_interval: Duration,
    health_interval: Duration,
}

impl Discovery {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        config: &Config,
        sources: Vec<Box<dyn EndpointSource>>,
    ) -> Result<(Self, DiscoveryHandle)> {
        let registry = Arc::new(RwLock::new(ServerRegistry::new()));
        let (best_tx, best_rx) = watch::channel(None);
        let discovery = &config.discovery;

        let service = Self {
            sources,
            checker: HealthChecker::new(Duration::from_millis(discovery.health_timeout_ms))?,
            registry: Arc::clone(&registry),
            best: best_tx,
            scan_interval: Duration::from_millis(discovery.scan_interval_ms.max(100)),
            health_interval: Duration::from_millis(discovery.health_check_interval_ms.max(100)),
        };
        let handle = DiscoveryHandle {
            registry,
            best: best_rx,
        };
        Ok((service, handle))
    }

    /// Build sources from configuration
    ///
    /// Static endpoints come from `discovery.static_endpoints` and the
    /// `transport.server_host` shortcut. mDNS failures are logged and the
    /// source is skipped.
    ///
    /// # Errors
    ///
    /// Returns error if a static endpoint is malformed
    pub fn from_config(config: &Config) -> Result<(Self, DiscoveryHandle)> {
        let mut sources: Vec<Box<dyn EndpointSource>> = Vec::new();

        let mut entries = config.discovery.static_endpoints.clone();
        if let Some(host) = &config.transport.server_host {
            entries.push(format!(
                "{host}:{}:{}",
                config.transport.audio_port, config.transport.control_port
            ));
        }
        let statics = StaticEndpoints::parse(&entries)?;
        if !statics.is_empty() {
            sources.push(Box::new(statics));
        }

        if config.discovery.mdns {
            match MdnsBrowser::new(&config.transport) {
                Ok(browser) => sources.push(Box::new(browser)),
                Err(e) => tracing::warn!(error = %e, "mDNS browsing unavailable"),
            }
        }

        Self::new(config, sources)
    }

    /// Query every source once, returning how many endpoints were seen
    pub async fn scan(&self) -> usize {
        let mut seen = 0;
        for source in &self.sources {
            match source.scan(SCAN_WINDOW).await {
                Ok(found) => {
                    tracing::debug!(source = source.name(), count = found.len(), "scan complete");
                    seen += found.len();
                    let mut registry = self.registry.write().await;
                    for endpoint in found {
                        registry.upsert(endpoint);
                    }
                }
                Err(e) => tracing::warn!(source = source.name(), error = %e, "scan failed"),
            }
        }
        seen
    }

    /// Probe every known server concurrently
    pub async fn check_health(&self) {
        let endpoints = self.registry.read().await.endpoints();
        let results = join_all(endpoints.iter().map(|e| self.checker.check(e))).await;

        let mut registry = self.registry.write().await;
        for (endpoint, health) in endpoints.iter().zip(results) {
            registry.record_health(&endpoint.key(), health);
        }
    }

    /// One scan and health pass, then publish the best server
    pub async fn refresh(&self) -> Option<ServerEndpoint> {
        self.scan().await;
        self.check_health().await;
        self.publish_best().await
    }

    async fn publish_best(&self) -> Option<ServerEndpoint> {
        let best = self.registry.read().await.best();
        self.best.send_if_modified(|current| {
            let changed = current.as_ref().map(ServerEndpoint::key)
                != best.as_ref().map(ServerEndpoint::key);
            if changed {
                tracing::info!(best = ?best.as_ref().map(ToString::to_string), "best server changed");
            }
            *current = best.clone();
            changed
        });
        best
    }

    /// Scan and check on their intervals until shutdown
    pub async fn run(self, mut shutdown: Shutdown) {
        self.refresh().await;

        let mut scan = tokio::time::interval(self.scan_interval);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        scan.tick().await;
        health.tick().await;

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = scan.tick() => {
                    let before = self.registry.read().await.len();
                    self.scan().await;
                    if self.registry.read().await.len() != before {
                        self.check_health().await;
                    }
                    self.publish_best().await;
                }
                _ = health.tick() => {
                    self.check_health().await;
                    self.publish_best().await;
                }
            }
        }

        tracing::debug!("discovery stopped");
    }

    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

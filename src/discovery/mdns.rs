//! mDNS service advertisement and browsing
//!
//! The terminal advertises itself so servers can find it and browses for
//! servers so it can find them.
//!
//! Advertised type: `_howdyclient._tcp.local.`, instance name is the
//! configured device name.
//!
//! TXT records:
//! - `capabilities`: comma separated feature list
//! - `version`: Crate version
//! - `device`: Device ID
//! - `room`: Configured room

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::RwLock;

use super::endpoint::{EndpointOrigin, ServerEndpoint};
use super::source::EndpointSource;
use crate::config::{DiscoveryConfig, FeedbackConfig, StatusConfig, TransportConfig};
use crate::{Error, Result};

/// mDNS service type the terminal advertises
pub const CLIENT_SERVICE_TYPE: &str = "_howdyclient._tcp.local.";

/// mDNS service type servers advertise
pub const SERVER_SERVICE_TYPE: &str = "_howdytts._tcp.local.";

fn daemon() -> Result<ServiceDaemon> {
    ServiceDaemon::new().map_err(|e| Error::Discovery(format!("failed to create mDNS daemon: {e}")))
}

/// What the terminal advertises about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAdvert {
    pub device_id: String,
    pub device_name: String,
    pub room: String,
    pub capabilities: String,
    /// Port of the local status server
    pub port: u16,
}

impl DeviceAdvert {
    #[must_use]
    pub fn from_config(
        feedback: &FeedbackConfig,
        discovery: &DiscoveryConfig,
        status: &StatusConfig,
    ) -> Self {
        Self {
            device_id: feedback.device_id.clone(),
            device_name: feedback.device_name.clone(),
            room: feedback.room.clone(),
            capabilities: discovery.capabilities.clone(),
            port: status.port,
        }
    }

    fn properties(&self) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        properties.insert("capabilities".to_string(), self.capabilities.clone());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        properties.insert("device".to_string(), self.device_id.clone());
        properties.insert("room".to_string(), self.room.clone());
        properties
    }
}

/// mDNS advertiser for the terminal
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,

    /// Currently registered service (if any)
    registered_service: Arc<RwLock<Option<String>>>,
}

impl MdnsAdvertiser {
    /// Create a new mDNS advertiser
    ///
    /// # Errors
    ///
    /// Returns error if mDNS daemon cannot be created
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: daemon()?,
            registered_service: Arc::new(RwLock::new(None)),
        })
    }

    /// Start advertising the terminal
    ///
    /// # Errors
    ///
    /// Returns error if service cannot be registered
    pub async fn start(&self, advert: &DeviceAdvert) -> Result<()> {
        let hostname = hostname::get()
            .map_or_else(|_| "terminal".to_string(), |h| h.to_string_lossy().to_string());

        let service = ServiceInfo::new(
            CLIENT_SERVICE_TYPE,
            &advert.device_name,
            &format!("{hostname}.local."),
            "",
            advert.port,
            advert.properties(),
        )
        .map_err(|e| Error::Discovery(format!("failed to create service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| Error::Discovery(format!("failed to register mDNS service: {e}")))?;

        *self.registered_service.write().await = Some(fullname);

        tracing::info!(
            service_type = CLIENT_SERVICE_TYPE,
            instance = %advert.device_name,
            port = advert.port,
            "mDNS service registered"
        );

        Ok(())
    }

    /// Stop advertising
    pub async fn stop(&self) {
        let fullname = self.registered_service.write().await.take();

        if let Some(name) = fullname {
            if let Err(e) = self.daemon.unregister(&name) {
                tracing::warn!(error = %e, "failed to unregister mDNS service");
            } else {
                tracing::info!("mDNS service unregistered");
            }
        }
    }

    /// Check if currently advertising
    pub async fn is_advertising(&self) -> bool {
        self.registered_service.read().await.is_some()
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Ok(guard) = self.registered_service.try_read()
            && let Some(name) = guard.as_ref()
        {
            let _ = self.daemon.unregister(name);
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

/// Browses for servers
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    default_audio_port: u16,
}

impl MdnsBrowser {
    /// # Errors
    ///
    /// Returns error if mDNS daemon cannot be created
    pub fn new(transport: &TransportConfig) -> Result<Self> {
        Ok(Self {
            daemon: daemon()?,
            default_audio_port: transport.audio_port,
        })
    }
}

/// Build an endpoint from a resolved server record
///
/// The advertised port is the control port. The datagram port comes from
/// an `audio_port` TXT record when present.
fn endpoint_from_service(info: &ServiceInfo, default_audio_port: u16) -> Option<ServerEndpoint> {
    let addr = pick_address(info.get_addresses().iter().copied())?;
    let audio_port = info
        .get_property_val_str("audio_port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_audio_port);

    Some(ServerEndpoint {
        host: addr.to_string(),
        audio_port,
        control_port: info.get_port(),
        hostname: info.get_hostname().trim_end_matches('.').to_string(),
        version: info.get_property_val_str("version").map(str::to_string),
        origin: EndpointOrigin::Mdns,
        last_seen: Utc::now(),
    })
}

/// Prefer IPv4
fn pick_address(addrs: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

#[async_trait]
impl EndpointSource for MdnsBrowser {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn scan(&self, window: Duration) -> Result<Vec<ServerEndpoint>> {
        let receiver = self
            .daemon
            .browse(SERVER_SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("failed to browse: {e}")))?;

        let mut found: HashMap<String, ServerEndpoint> = HashMap::new();
        let deadline = tokio::time::Instant::now() + window;

        loop {
            let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) | Err(_) => break,
            };

            if let ServiceEvent::ServiceResolved(info) = event {
                match endpoint_from_service(&info, self.default_audio_port) {
                    Some(endpoint) => {
                        tracing::debug!(endpoint = %endpoint, name = info.get_fullname(), "server resolved");
                        found.insert(endpoint.key(), endpoint);
                    }
                    None => tracing::debug!(name = info.get_fullname(), "server has no address"),
                }
            }
        }

        if let Err(e) = self.daemon.stop_browse(SERVER_SERVICE_TYPE) {
            tracing::trace!(error = %e, "stop browse failed");
        }

        Ok(found.into_values().collect())
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

//! Server endpoints and health snapshots

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Error, Result};

/// Where an endpoint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointOrigin {
    Mdns,
    Static,
}

/// A server the terminal can stream to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub audio_port: u16,
    pub control_port: u16,
    /// Advertised name, the host for static entries
    pub hostname: String,
    pub version: Option<String>,
    pub origin: EndpointOrigin,
    pub last_seen: DateTime<Utc>,
}

impl ServerEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, audio_port: u16, control_port: u16) -> Self {
        let host = host.into();
        Self {
            hostname: host.clone(),
            host,
            audio_port,
            control_port,
            version: None,
            origin: EndpointOrigin::Static,
            last_seen: Utc::now(),
        }
    }

    /// Registry key; one entry per host and control port
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// Base URL of the server's HTTP API
    #[must_use]
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.control_port)
    }

    /// Resolve the datagram target
    ///
    /// # Errors
    ///
    /// Returns error if the host does not resolve
    pub fn audio_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.audio_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Discovery(format!("{} did not resolve", self.host)))
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.audio_port, self.control_port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = Error;

    /// Parse `host:audio_port:control_port`
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().rsplitn(3, ':');
        let (Some(control), Some(audio), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidInput(format!(
                "endpoint '{s}' must be host:audio_port:control_port"
            )));
        };

        let port = |p: &str| {
            p.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::InvalidInput(format!("bad port '{p}' in endpoint '{s}'")))
        };

        if host.is_empty() {
            return Err(Error::InvalidInput(format!("endpoint '{s}' has no host")));
        }

        Ok(Self::new(host, port(audio)?, port(control)?))
    }
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerHealth {
    pub online: bool,
    pub response_time_ms: u64,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    pub active_sessions: Option<u32>,
    pub version: Option<String>,
    pub status: String,
    pub checked_at: DateTime<Utc>,
}

impl ServerHealth {
    /// Health record for a server that did not answer
    #[must_use]
    pub fn unreachable(response_time_ms: u64) -> Self {
        Self {
            online: false,
            response_time_ms,
            cpu_usage: None,
            memory_usage: None,
            active_sessions: None,
            version: None,
            status: "unreachable".to_string(),
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_endpoint() {
        let ep: ServerEndpoint = "192.168.1.20:8000:8001".parse().unwrap();
        assert_eq!(ep.host, "192.168.1.20");
        assert_eq!(ep.audio_port, 8000);
        assert_eq!(ep.control_port, 8001);
        assert_eq!(ep.origin, EndpointOrigin::Static);
        assert_eq!(ep.key(), "192.168.1.20:8001");
        assert_eq!(ep.http_base(), "http://192.168.1.20:8001");
        assert_eq!(ep.to_string(), "192.168.1.20:8000:8001");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["server", "server:8000", ":8000:8001", "server:0:8001", "server:x:8001"] {
            assert!(bad.parse::<ServerEndpoint>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_audio_addr_for_ip() {
        let ep = ServerEndpoint::new("127.0.0.1", 9000, 9001);
        assert_eq!(ep.audio_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
    }
}

//! Server discovery and device advertisement
//!
//! Candidate servers come from mDNS browsing and static configuration.
//! Each is health-checked over HTTP and ranked; consumers watch the best
//! online server and decide for themselves when to switch.

mod endpoint;
mod health;
pub mod mdns;
mod registry;
mod service;
mod source;

pub use endpoint::{EndpointOrigin, ServerEndpoint, ServerHealth};
pub use health::HealthChecker;
pub use mdns::{DeviceAdvert, MdnsAdvertiser, MdnsBrowser};
pub use registry::{Candidate, ServerRegistry};
pub use service::{Discovery, DiscoveryHandle};
pub use source::{EndpointSource, StaticEndpoints};

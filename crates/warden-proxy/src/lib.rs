//! Warden proxy - transparent, filtering HTTPS MITM proxy engine.
//!
//! The engine diverts a host's outbound port-80/443 TCP flows to local
//! acceptors, terminates TLS under an in-memory root CA by forging per-host
//! leaf certificates, inspects requests and response payloads against the
//! rules loaded into `warden-core`, and blocks, rewrites, or relays traffic
//! accordingly.
//!
//! ## Architecture
//!
//! ```text
//! outbound TCP :80/:443
//!        │ diverter (netfilter / manual)
//!        ▼
//!   acceptors ── firewall-refused flow ──▶ blind relay to original dest
//!        │ plain / TLS (SNI sniff + forged leaf)
//!        ▼
//!   proxy bridge ── rule store ──▶ block page / 403
//!        │ allowed
//!        ▼
//!   original destination (TLS verified against CA bundle + OS roots)
//!        │ response
//!        ▼
//!   body filters (text triggers, element hiding, classifier) ──▶ client
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - lifecycle facade and embedder API
//! - [`bridge`] - HTTP/1.x relay sessions with filtering hooks
//! - [`ca`] - root CA, leaf forging, forged-context cache
//! - [`tls`] - ClientHello sniffing and replay
//! - [`acceptor`] - plain and TLS accept loops
//! - [`diverter`] - flow diversion and original-destination recovery
//! - [`error`] - proxy error taxonomy

pub mod acceptor;
pub mod bridge;
pub mod ca;
pub mod diverter;
pub mod engine;
pub mod error;
pub mod tls;

pub use ca::{CertificateAuthority, CertificateStore, HostName};
pub use diverter::{DiversionControl, DiverterBackend, FlowRecord, FlowTable, FlowVerdict};
pub use engine::{Engine, EngineConfig};
pub use error::{ProxyError, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn engine_can_be_built() {
        let firewall: warden_core::events::FirewallCheck = Arc::new(|_: &str| true);
        let engine = Engine::new(
            EngineConfig::new(firewall).with_backend(DiverterBackend::Manual),
        )
        .unwrap();
        assert!(!engine.is_running());
    }
}

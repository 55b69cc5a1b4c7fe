//! Flow diversion: getting port-80/443 traffic into the local acceptors and
//! recovering where it was originally headed.
//!
//! The flow table maps a diverted connection's source port to its original
//! destination and originating process. Records are short-lived: they are
//! removed when the acceptor looks them up and expire after a TTL otherwise,
//! so the table stays bounded no matter how flows die.
//!
//! Two backends ship:
//!
//! - `Netfilter` (Linux): installs an nft NAT output chain that rewrites
//!   dport 80/443 to the local listeners. Original destinations come from
//!   `SO_ORIGINAL_DST` on the accepted socket and process attribution from
//!   `/proc`. The engine's own upstream sockets carry a packet mark the
//!   chain exempts, so they are never re-diverted.
//! - `Manual`: no kernel interaction. The embedder (or a test harness)
//!   inserts flow records itself and points clients at the listeners.

#[cfg(target_os = "linux")]
mod linux;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use warden_core::events::FirewallCheck;

use crate::error::{ProxyError, Result};

/// Packet mark carried by engine-originated upstream sockets.
pub const DIVERT_MARK: u32 = 0x5741_5244;

/// How long an unclaimed flow record survives.
const FLOW_TTL: Duration = Duration::from_secs(30);

/// Where a diverted flow was originally going, and who sent it.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub original: SocketAddr,
    pub pid: Option<u32>,
    /// Absolute path of the originating binary, when attribution succeeded.
    pub binary_path: Option<String>,
    inserted_at: Instant,
}

impl FlowRecord {
    pub fn new(original: SocketAddr) -> Self {
        Self {
            original,
            pid: None,
            binary_path: None,
            inserted_at: Instant::now(),
        }
    }

    pub fn with_process(mut self, pid: Option<u32>, binary_path: Option<String>) -> Self {
        self.pid = pid;
        self.binary_path = binary_path;
        self
    }
}

/// Concurrent map of diverted flows keyed by downstream source port.
#[derive(Debug)]
pub struct FlowTable {
    entries: DashMap<u16, FlowRecord>,
    ttl: Duration,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::with_ttl(FLOW_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Records a flow. Expired records are purged opportunistically so the
    /// table never grows without bound.
    pub fn insert(&self, source_port: u16, record: FlowRecord) {
        self.entries
            .retain(|_, r| r.inserted_at.elapsed() < self.ttl);
        self.entries.insert(source_port, record);
    }

    /// Removes and returns the record for `source_port`.
    pub fn take(&self, source_port: u16) -> Option<FlowRecord> {
        let (_, record) = self.entries.remove(&source_port)?;
        (record.inserted_at.elapsed() < self.ttl).then_some(record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Which kernel-facing mechanism diverts flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiverterBackend {
    /// nft NAT redirect rules (Linux, requires privileges).
    #[cfg(target_os = "linux")]
    Netfilter,
    /// Flow records are supplied externally; nothing touches the kernel.
    Manual,
}

/// Outcome of resolving an accepted connection against the diverter.
#[derive(Debug)]
pub enum FlowVerdict {
    /// Terminate, inspect, and filter this flow.
    Intercept(FlowRecord),
    /// The firewall callback refused the originating binary: relay the flow
    /// untouched, with no TLS termination and no session.
    Passthrough(FlowRecord),
}

/// Controls diversion and answers original-destination lookups.
pub struct DiversionControl {
    backend: DiverterBackend,
    table: Arc<FlowTable>,
    firewall: FirewallCheck,
    #[cfg(target_os = "linux")]
    netfilter: Mutex<Option<linux::NftRedirect>>,
    #[cfg(not(target_os = "linux"))]
    netfilter: Mutex<Option<()>>,
}

impl DiversionControl {
    pub fn new(backend: DiverterBackend, firewall: FirewallCheck) -> Self {
        Self {
            backend,
            table: Arc::new(FlowTable::new()),
            firewall,
            netfilter: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> DiverterBackend {
        self.backend
    }

    /// The flow table. Manual-backend embedders insert records here.
    pub fn table(&self) -> Arc<FlowTable> {
        self.table.clone()
    }

    /// Begins diverting flows to the given listener ports. Fatal when the
    /// platform handle cannot be opened.
    pub fn start(&self, http_port: u16, https_port: u16) -> Result<()> {
        match self.backend {
            DiverterBackend::Manual => {
                tracing::info!("diversion in manual mode; no kernel rules installed");
                Ok(())
            }
            #[cfg(target_os = "linux")]
            DiverterBackend::Netfilter => {
                let redirect = linux::NftRedirect::install(http_port, https_port, DIVERT_MARK)?;
                *self.netfilter.lock() = Some(redirect);
                tracing::info!(http_port, https_port, "netfilter diversion active");
                Ok(())
            }
        }
    }

    /// Ceases diverting. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(redirect) = self.netfilter.lock().take() {
            #[cfg(target_os = "linux")]
            redirect.remove();
            #[cfg(not(target_os = "linux"))]
            let _ = redirect;
        }
    }

    /// Resolves the flow behind an accepted downstream connection and runs
    /// the firewall gate. The flow record is consumed: a second lookup for
    /// the same connection fails with `UnknownFlow`.
    pub fn resolve(
        &self,
        peer: SocketAddr,
        stream: &TcpStream,
        require_approval: bool,
    ) -> Result<FlowVerdict> {
        let record = match self.table.take(peer.port()) {
            Some(record) => record,
            None => self.recover_flow(peer, stream)?,
        };

        if require_approval {
            if let Some(path) = record.binary_path.as_deref() {
                if !(self.firewall)(path) {
                    tracing::info!(binary = path, "firewall refused flow; passing through");
                    return Ok(FlowVerdict::Passthrough(record));
                }
            }
        }
        Ok(FlowVerdict::Intercept(record))
    }

    #[cfg(target_os = "linux")]
    fn recover_flow(&self, peer: SocketAddr, stream: &TcpStream) -> Result<FlowRecord> {
        if self.backend != DiverterBackend::Netfilter {
            return Err(ProxyError::UnknownFlow(peer.port()));
        }
        let original = linux::original_destination(stream)?;
        let (pid, binary_path) = linux::process_for_peer(peer);
        Ok(FlowRecord::new(original).with_process(pid, binary_path))
    }

    #[cfg(not(target_os = "linux"))]
    fn recover_flow(&self, peer: SocketAddr, _stream: &TcpStream) -> Result<FlowRecord> {
        Err(ProxyError::UnknownFlow(peer.port()))
    }
}

impl Drop for DiversionControl {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DiversionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiversionControl")
            .field("backend", &self.backend)
            .field("pending_flows", &self.table.len())
            .finish_non_exhaustive()
    }
}

//! Engine facade: lifecycle, worker runtime, and the embedder-facing API.
//!
//! The engine owns everything: the filtering stores, the certificate store,
//! the diverter, and a dedicated multi-threaded runtime that drives the
//! acceptors and proxy sessions. `start()` and `stop()` are synchronous and
//! idempotent; rules, triggers, options, and categories can be manipulated
//! whether or not the engine is running.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use warden_core::events::{ClassifyContent, FirewallCheck};
use warden_core::{EventSink, LoadSummary, ProgramOptions};

use crate::acceptor::run_acceptor;
use crate::bridge::SessionShared;
use crate::ca::CertificateStore;
use crate::diverter::{DiversionControl, DiverterBackend, DIVERT_MARK};
use crate::error::{ProxyError, Result};

/// Grace window for in-flight exchanges after `stop()` before the runtime is
/// torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Engine construction parameters. The firewall callback is mandatory; the
/// rest has working defaults.
pub struct EngineConfig {
    firewall: FirewallCheck,
    ca_bundle: Option<PathBuf>,
    block_page: Option<String>,
    http_port: u16,
    https_port: u16,
    worker_threads: usize,
    backend: DiverterBackend,
    events: EventSink,
    classify: Option<ClassifyContent>,
}

impl EngineConfig {
    /// Creates a configuration with a firewall callback, listening on
    /// ephemeral ports with one worker per logical CPU.
    pub fn new(firewall: FirewallCheck) -> Self {
        Self {
            firewall,
            ca_bundle: None,
            block_page: None,
            http_port: 0,
            https_port: 0,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            backend: default_backend(),
            events: EventSink::default(),
            classify: None,
        }
    }

    /// Path to a PEM CA bundle used (with the OS roots) to verify upstream
    /// servers.
    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    /// HTML served in place of blocked document responses.
    pub fn with_block_page(mut self, html: impl Into<String>) -> Self {
        self.block_page = Some(html.into());
        self
    }

    /// Fixed listener ports; 0 lets the OS pick.
    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    /// Worker thread count for the proxy runtime.
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    /// Diversion backend.
    pub fn with_backend(mut self, backend: DiverterBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Event callbacks.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Optional content-classification callback, consulted for response
    /// bodies the built-in filters pass.
    pub fn with_classifier(mut self, classify: ClassifyContent) -> Self {
        self.classify = Some(classify);
        self
    }
}

fn default_backend() -> DiverterBackend {
    #[cfg(target_os = "linux")]
    {
        DiverterBackend::Netfilter
    }
    #[cfg(not(target_os = "linux"))]
    {
        DiverterBackend::Manual
    }
}

struct Running {
    runtime: tokio::runtime::Runtime,
    shutdown: broadcast::Sender<()>,
}

/// The filtering engine.
pub struct Engine {
    shared: Arc<SessionShared>,
    diverter: Arc<DiversionControl>,
    worker_threads: usize,
    desired_http_port: u16,
    desired_https_port: u16,
    state: Mutex<Option<Running>>,
    running: AtomicBool,
    http_port: AtomicU32,
    https_port: AtomicU32,
}

impl Engine {
    /// Builds an engine: generates the root CA and prepares all shared state.
    /// Nothing listens until `start()`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let certs = CertificateStore::new(config.ca_bundle.as_deref())?;
        let upstream_mark = if matches!(config.backend, DiverterBackend::Manual) {
            None
        } else {
            Some(DIVERT_MARK)
        };

        let shared = Arc::new(SessionShared::new(
            ProgramOptions::new(),
            certs,
            config.events,
            config.classify,
            config.block_page,
            upstream_mark,
        ));
        let diverter = Arc::new(DiversionControl::new(config.backend, config.firewall));

        Ok(Self {
            shared,
            diverter,
            worker_threads: config.worker_threads,
            desired_http_port: config.http_port,
            desired_https_port: config.https_port,
            state: Mutex::new(None),
            running: AtomicBool::new(false),
            http_port: AtomicU32::new(0),
            https_port: AtomicU32::new(0),
        })
    }

    /// Starts diverting and serving traffic. A no-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        self.shared.stopping.store(false, Ordering::SeqCst);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name("warden-proxy")
            .enable_all()
            .build()
            .map_err(|e| ProxyError::Config(format!("building runtime: {e}")))?;

        let (http_listener, https_listener) = runtime.block_on(async {
            let http =
                tokio::net::TcpListener::bind(("127.0.0.1", self.desired_http_port)).await?;
            let https =
                tokio::net::TcpListener::bind(("127.0.0.1", self.desired_https_port)).await?;
            Ok::<_, std::io::Error>((http, https))
        })?;

        let http_port = http_listener.local_addr()?.port();
        let https_port = https_listener.local_addr()?.port();

        // Diversion comes up last so no flow arrives before the listeners.
        if let Err(err) = self.diverter.start(http_port, https_port) {
            drop(http_listener);
            drop(https_listener);
            runtime.shutdown_timeout(Duration::from_millis(100));
            return Err(err);
        }

        let (shutdown, _) = broadcast::channel(1);
        runtime.spawn(run_acceptor(
            http_listener,
            false,
            self.shared.clone(),
            self.diverter.clone(),
            shutdown.subscribe(),
        ));
        runtime.spawn(run_acceptor(
            https_listener,
            true,
            self.shared.clone(),
            self.diverter.clone(),
            shutdown.subscribe(),
        ));

        self.http_port.store(http_port as u32, Ordering::SeqCst);
        self.https_port.store(https_port as u32, Ordering::SeqCst);
        *state = Some(Running { runtime, shutdown });
        self.running.store(true, Ordering::SeqCst);

        self.shared.events.info(&format!(
            "engine started (http {http_port}, https {https_port})"
        ));
        Ok(())
    }

    /// Stops diverting, lets in-flight exchanges finish within a grace
    /// window, then tears the worker runtime down. A no-op when stopped.
    pub fn stop(&self) {
        let Some(Running { runtime, shutdown }) = self.state.lock().take() else {
            return;
        };

        self.diverter.stop();
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = shutdown.send(());

        runtime.shutdown_timeout(SHUTDOWN_GRACE);

        self.running.store(false, Ordering::SeqCst);
        self.http_port.store(0, Ordering::SeqCst);
        self.https_port.store(0, Ordering::SeqCst);
        self.shared.events.info("engine stopped");
    }

    /// Whether the engine is currently diverting and serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound plain-HTTP listener port; 0 when not running.
    pub fn http_port(&self) -> u16 {
        self.http_port.load(Ordering::SeqCst) as u16
    }

    /// Bound TLS listener port; 0 when not running.
    pub fn https_port(&self) -> u16 {
        self.https_port.load(Ordering::SeqCst) as u16
    }

    // ---- options & categories ----

    pub fn set_option(&self, index: usize, enabled: bool) {
        self.shared.options.set(index, enabled);
    }

    pub fn get_option(&self, index: usize) -> bool {
        self.shared.options.get(index)
    }

    pub fn set_category(&self, category: u8, enabled: bool) {
        self.shared.categories.set(category, enabled);
    }

    pub fn get_category(&self, category: u8) -> bool {
        self.shared.categories.get(category)
    }

    // ---- rules & triggers ----

    pub fn load_filters_from_string(
        &self,
        text: &str,
        category: u8,
        flush_existing: bool,
    ) -> Result<LoadSummary> {
        let summary = self
            .shared
            .filters
            .load_from_text(text, category, flush_existing)?;
        self.shared.events.info(&format!(
            "category {category}: loaded {} rules ({} failed)",
            summary.loaded, summary.failed
        ));
        Ok(summary)
    }

    pub fn load_filters_from_file(
        &self,
        path: impl AsRef<std::path::Path>,
        category: u8,
        flush_existing: bool,
    ) -> Result<LoadSummary> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(ProxyError::Io)?;
        self.load_filters_from_string(&text, category, flush_existing)
    }

    pub fn load_triggers_from_string(
        &self,
        text: &str,
        category: u8,
        flush_existing: bool,
    ) -> Result<u32> {
        let loaded = self
            .shared
            .triggers
            .load_from_text(text, category, flush_existing)?;
        self.shared
            .events
            .info(&format!("category {category}: loaded {loaded} text triggers"));
        Ok(loaded)
    }

    pub fn load_triggers_from_file(
        &self,
        path: impl AsRef<std::path::Path>,
        category: u8,
        flush_existing: bool,
    ) -> Result<u32> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(ProxyError::Io)?;
        self.load_triggers_from_string(&text, category, flush_existing)
    }

    pub fn unload_category(&self, category: u8) {
        self.shared.filters.unload_category(category);
    }

    pub fn unload_triggers(&self, category: u8) {
        self.shared.triggers.unload_category(category);
    }

    /// The root certificate in PEM form, stable for the engine's lifetime.
    pub fn root_cert_pem(&self) -> Vec<u8> {
        self.shared.certs.root_pem().as_bytes().to_vec()
    }

    /// The diverter, exposed so manual-backend embedders can feed flow
    /// records.
    pub fn diverter(&self) -> Arc<DiversionControl> {
        self.diverter.clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("http_port", &self.http_port())
            .field("https_port", &self.https_port())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::options::option;

    fn test_engine() -> Engine {
        let firewall: FirewallCheck = Arc::new(|_: &str| true);
        Engine::new(
            EngineConfig::new(firewall)
                .with_backend(DiverterBackend::Manual)
                .with_worker_threads(2),
        )
        .unwrap()
    }

    #[test]
    fn ports_are_zero_until_started() {
        let engine = test_engine();
        assert!(!engine.is_running());
        assert_eq!(engine.http_port(), 0);
        assert_eq!(engine.https_port(), 0);
    }

    #[test]
    fn start_stop_lifecycle() {
        let engine = test_engine();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert_ne!(engine.http_port(), 0);
        assert_ne!(engine.https_port(), 0);

        // Idempotent start.
        engine.start().unwrap();

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.http_port(), 0);

        // Idempotent stop.
        engine.stop();

        // Restartable.
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn root_pem_available_before_start() {
        let engine = test_engine();
        let pem = engine.root_cert_pem();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert_eq!(engine.root_cert_pem(), pem);
    }

    #[test]
    fn option_and_category_facade() {
        let engine = test_engine();
        assert!(engine.get_option(option::FILTER_HTTPS));
        engine.set_option(option::FILTER_HTTPS, false);
        assert!(!engine.get_option(option::FILTER_HTTPS));

        engine.set_category(9, true);
        assert!(engine.get_category(9));
        engine.set_category(0, true);
        assert!(!engine.get_category(0));
    }

    #[test]
    fn rule_loading_facade() {
        let engine = test_engine();
        let summary = engine
            .load_filters_from_string("||ads.test^\n! comment\nbad$mystery\n", 1, true)
            .unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 1);

        let triggers = engine
            .load_triggers_from_string("alpha\nbeta\n", 3, true)
            .unwrap();
        assert_eq!(triggers, 2);

        engine.unload_category(1);
        engine.unload_triggers(3);
    }

    #[test]
    fn file_loading_facade() {
        let engine = test_engine();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "||filefed.test^\n").unwrap();

        let summary = engine.load_filters_from_file(&path, 2, true).unwrap();
        assert_eq!(summary.loaded, 1);

        assert!(engine
            .load_filters_from_file(dir.path().join("missing.txt"), 2, true)
            .is_err());
    }
}

//! End-to-end exercises against a running engine.
//!
//! The engine runs with the manual diversion backend: each test dials the
//! listeners from a pre-bound source port and plants the matching flow record
//! first, standing in for the kernel-level redirect. Clients and upstreams
//! use synchronous sockets so the tests stay independent of the engine's own
//! runtime.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;

use warden_core::events::{EventSink, FirewallCheck};
use warden_core::options::option;
use warden_proxy::diverter::FlowRecord;
use warden_proxy::{DiverterBackend, Engine, EngineConfig};

#[derive(Clone, Default)]
struct BlockEvents {
    hits: Arc<Mutex<Vec<(u8, String, String, u64)>>>,
}

impl BlockEvents {
    fn sink(&self) -> EventSink {
        let hits = self.hits.clone();
        EventSink {
            on_request_blocked: Some(Arc::new(move |category, rule, url, size| {
                hits.lock()
                    .unwrap()
                    .push((category, rule.to_owned(), url.to_owned(), size));
            })),
            ..Default::default()
        }
    }

    fn take(&self) -> Vec<(u8, String, String, u64)> {
        std::mem::take(&mut self.hits.lock().unwrap())
    }
}

fn approve_all() -> FirewallCheck {
    Arc::new(|_: &str| true)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with_events(events: EventSink) -> Engine {
    init_tracing();
    let engine = Engine::new(
        EngineConfig::new(approve_all())
            .with_backend(DiverterBackend::Manual)
            .with_worker_threads(2)
            .with_events(events),
    )
    .unwrap();
    engine.start().unwrap();
    engine
}

/// Dials `dest` from a socket whose source port is known before the SYN, so
/// the flow record can be planted first.
fn connect_with_flow(engine: &Engine, listener_port: u16, original: SocketAddr) -> TcpStream {
    connect_with_record(engine, listener_port, FlowRecord::new(original))
}

fn connect_with_record(engine: &Engine, listener_port: u16, record: FlowRecord) -> TcpStream {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    let source_port = socket
        .local_addr()
        .unwrap()
        .as_socket()
        .unwrap()
        .port();

    engine.diverter().table().insert(source_port, record);

    let dest: SocketAddr = format!("127.0.0.1:{listener_port}").parse().unwrap();
    socket.connect(&dest.into()).unwrap();
    let stream: TcpStream = socket.into();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Serves one connection with a canned HTTP response, returning what the
/// upstream saw.
fn canned_upstream(response: Vec<u8>) -> (SocketAddr, std::thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }
        stream.write_all(&response).unwrap();
        let _ = stream.flush();
        seen
    });
    (addr, handle)
}

/// An upstream that must never be contacted.
fn untouchable_upstream() -> (SocketAddr, std::thread::JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            if listener.accept().is_ok() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    });
    (addr, handle)
}

fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    out
}

#[test]
fn block_rule_match_fires_event_and_skips_upstream() {
    let events = BlockEvents::default();
    let engine = engine_with_events(events.sink());

    engine
        .load_filters_from_string("||ads.example.com^$third-party", 1, true)
        .unwrap();
    engine.set_category(1, true);

    let (upstream, contacted) = untouchable_upstream();
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(
            b"GET /banner.gif HTTP/1.1\r\n\
              Host: ads.example.com\r\n\
              Referer: http://news.example.org/page\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.starts_with("HTTP/1.1 403 Forbidden"), "got: {reply}");

    let hits = events.take();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, 1);
    assert_eq!(hits[0].1, "||ads.example.com^$third-party");
    assert_eq!(hits[0].2, "http://ads.example.com/banner.gif");
    assert_eq!(hits[0].3, 0);

    assert!(!contacted.join().unwrap(), "blocked request reached upstream");
    engine.stop();
}

#[test]
fn exception_rule_overrides_block() {
    let engine = engine_with_events(EventSink::default());
    engine
        .load_filters_from_string(
            "||tracker.example.com^\n@@||tracker.example.com/safe^",
            1,
            true,
        )
        .unwrap();
    engine.set_category(1, true);

    // The whitelisted path is forwarded.
    let (upstream, seen) = canned_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong".to_vec(),
    );
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(
            b"GET /safe/ping HTTP/1.1\r\nHost: tracker.example.com\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "got: {reply}");
    assert!(reply.ends_with("pong"));
    let upstream_saw = String::from_utf8_lossy(&seen.join().unwrap()).into_owned();
    assert!(upstream_saw.starts_with("GET /safe/ping HTTP/1.1"));

    // The sibling path is blocked.
    let (upstream, contacted) = untouchable_upstream();
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(b"GET /bad HTTP/1.1\r\nHost: tracker.example.com\r\nConnection: close\r\n\r\n")
        .unwrap();
    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.starts_with("HTTP/1.1 403 Forbidden"), "got: {reply}");
    assert!(!contacted.join().unwrap());

    engine.stop();
}

#[test]
fn element_hiding_injects_style_into_head() {
    let engine = engine_with_events(EventSink::default());
    engine.load_filters_from_string("##.ad-banner", 2, true).unwrap();
    engine.set_category(2, true);

    let html = b"<html><head></head><body><div class=\"ad-banner\">X</div></body></html>";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        html.len()
    );
    let mut full = response.into_bytes();
    full.extend_from_slice(html);

    let (upstream, _seen) = canned_upstream(full);
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: site.example\r\nConnection: close\r\n\r\n")
        .unwrap();

    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(
        reply.contains(
            "<style type=\"text/css\">.ad-banner{display:none !important;}</style></head>"
        ),
        "got: {reply}"
    );
    engine.stop();
}

#[test]
fn text_trigger_replaces_response_with_block_page() {
    let events = BlockEvents::default();
    let engine = engine_with_events(events.sink());
    engine.load_triggers_from_string("FORBIDDEN", 3, true).unwrap();
    engine.set_category(3, true);

    let mut body = vec![b'a'; 3 * 1024];
    body[1500..1509].copy_from_slice(b"FORBIDDEN");
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);

    let (upstream, _seen) = canned_upstream(response);
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(b"GET /page HTTP/1.1\r\nHost: text.example\r\nConnection: close\r\n\r\n")
        .unwrap();

    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.contains("Request blocked"), "got: {reply}");
    assert!(!reply.contains("FORBIDDEN"));

    let hits = events.take();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, 3);
    assert_eq!(hits[0].1, "forbidden");
    engine.stop();
}

#[test]
fn firewall_denied_flow_is_relayed_untouched() {
    init_tracing();
    let firewall: FirewallCheck = Arc::new(|path: &str| !path.contains("unapproved"));
    let engine = Engine::new(
        EngineConfig::new(firewall)
            .with_backend(DiverterBackend::Manual)
            .with_worker_threads(2),
    )
    .unwrap();
    engine.start().unwrap();

    // Raw, non-HTTP payload: a passthrough must relay it verbatim, proving
    // no proxy session ever parsed it.
    let (upstream, seen) = canned_upstream(b"raw-reply\r\n\r\n".to_vec());
    let record =
        FlowRecord::new(upstream).with_process(Some(99), Some("/opt/unapproved/tool".into()));
    let mut client = connect_with_record(&engine, engine.http_port(), record);

    client.write_all(b"not-http at all\r\n\r\n").unwrap();
    let mut reply = [0u8; 13];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"raw-reply\r\n\r\n");

    let upstream_saw = seen.join().unwrap();
    assert_eq!(upstream_saw, b"not-http at all\r\n\r\n");
    engine.stop();
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let engine = engine_with_events(EventSink::default());

    // One upstream connection serving two exchanges.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for payload in ["one", "two"] {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream
                .write_all(
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{payload}",
                        payload.len()
                    )
                    .as_bytes(),
                )
                .unwrap();
        }
    });

    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    for expected in ["one", "two"] {
        client
            .write_all(b"GET /seq HTTP/1.1\r\nHost: ka.example\r\n\r\n")
            .unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            client.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let mut body = vec![0u8; expected.len()];
        client.read_exact(&mut body).unwrap();
        assert_eq!(body, expected.as_bytes());
    }
    server.join().unwrap();
    engine.stop();
}

#[test]
fn unknown_flow_is_dropped() {
    let engine = engine_with_events(EventSink::default());

    // No flow record for this connection.
    let mut client =
        TcpStream::connect(("127.0.0.1", engine.http_port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x.test\r\n\r\n")
        .unwrap();
    assert!(read_to_end(&mut client).is_empty());
    engine.stop();
}

// ==================== TLS Interception ====================

mod tls_support {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
        KeyUsagePurpose,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

    /// A throwaway CA plus a leaf for `host`, for the fake upstream.
    pub fn upstream_identity(
        host: &str,
    ) -> (String, Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "E2E Upstream CA");
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let ca_pem = ca_cert.pem();
        let ca_der = ca_cert.der().clone();
        let issuer = Issuer::from_ca_cert_pem(&ca_pem, ca_key).unwrap();

        let mut leaf_params = CertificateParams::new(vec![host.to_owned()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        leaf_params.distinguished_name = dn;
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        let key = PrivateKeyDer::try_from(leaf_key.serialize_der()).unwrap();
        (ca_pem, vec![leaf.der().clone(), ca_der], key)
    }

    /// TLS upstream serving one canned HTTP response.
    pub fn tls_upstream(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        response: &'static str,
    ) -> (SocketAddr, std::thread::JoinHandle<()>) {
        let config = Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let conn = rustls::ServerConnection::new(config).unwrap();
            let mut tls = rustls::StreamOwned::new(conn, stream);

            let mut seen = Vec::new();
            let mut buf = [0u8; 2048];
            loop {
                match tls.read(&mut buf) {
                    // Handshake failures (the verify-failure test) land here.
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        seen.extend_from_slice(&buf[..n]);
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            let _ = tls.write_all(response.as_bytes());
            let _ = tls.flush();
        });
        (addr, handle)
    }

    /// Client-side TLS over the engine's forged certificates, trusting the
    /// engine root. A completed handshake proves the forged chain validates
    /// for the requested name.
    pub fn client_tls(
        engine: &Engine,
        stream: TcpStream,
        sni: &str,
    ) -> rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
        let mut roots = rustls::RootCertStore::empty();
        let pem = engine.root_cert_pem();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let conn =
            rustls::ClientConnection::new(config, ServerName::try_from(sni.to_owned()).unwrap())
                .unwrap();
        rustls::StreamOwned::new(conn, stream)
    }
}

#[test]
fn tls_interception_with_trusted_upstream() {
    use tls_support::*;

    init_tracing();
    let (ca_pem, chain, key) = upstream_identity("example.test");
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("upstream-ca.pem");
    std::fs::write(&bundle, ca_pem).unwrap();

    let engine = Engine::new(
        EngineConfig::new(approve_all())
            .with_backend(DiverterBackend::Manual)
            .with_worker_threads(2)
            .with_ca_bundle(&bundle),
    )
    .unwrap();
    engine.start().unwrap();

    let (upstream, served) = tls_upstream(
        chain,
        key,
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecure",
    );

    let tcp = connect_with_flow(&engine, engine.https_port(), upstream);
    let mut tls = client_tls(&engine, tcp, "example.test");
    tls.write_all(b"GET /s HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut reply = Vec::new();
    let _ = tls.read_to_end(&mut reply);
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.ends_with("secure"));

    served.join().unwrap();
    engine.stop();
}

#[test]
fn untrusted_upstream_yields_502() {
    use tls_support::*;

    // Upstream presents a chain the engine has no reason to trust.
    let (_ca_pem, chain, key) = upstream_identity("example.test");
    let engine = engine_with_events(EventSink::default());
    let (upstream, served) = tls_upstream(chain, key, "HTTP/1.1 200 OK\r\n\r\n");

    let tcp = connect_with_flow(&engine, engine.https_port(), upstream);
    let mut tls = client_tls(&engine, tcp, "example.test");
    tls.write_all(b"GET / HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut reply = Vec::new();
    let _ = tls.read_to_end(&mut reply);
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"), "got: {text}");
    assert!(text.contains("X-Fe-Reason: upstream-tls"), "got: {text}");

    served.join().unwrap();
    engine.stop();
}

#[test]
fn engine_restart_reuses_state() {
    init_tracing();
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let firewall: FirewallCheck = Arc::new(|_: &str| {
        COUNTER.fetch_add(1, Ordering::SeqCst);
        true
    });
    let engine = Engine::new(
        EngineConfig::new(firewall)
            .with_backend(DiverterBackend::Manual)
            .with_worker_threads(2),
    )
    .unwrap();

    engine.load_filters_from_string("||persist.test^", 1, true).unwrap();
    engine.set_category(1, true);

    engine.start().unwrap();
    let pem_before = engine.root_cert_pem();
    engine.stop();
    assert!(!engine.is_running());

    engine.start().unwrap();
    assert_eq!(engine.root_cert_pem(), pem_before);

    // Rules survive a restart: a blocked fetch still gets 403.
    let (upstream, contacted) = untouchable_upstream();
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: persist.test\r\nConnection: close\r\n\r\n")
        .unwrap();
    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.starts_with("HTTP/1.1 403"), "got: {reply}");
    assert!(!contacted.join().unwrap());
    engine.stop();
}

#[test]
fn block_page_served_for_documents() {
    let engine = engine_with_events(EventSink::default());
    engine.load_filters_from_string("||docs.example^", 1, true).unwrap();
    engine.set_category(1, true);
    assert!(engine.get_option(option::USE_HTML_BLOCK_PAGE));

    let (upstream, _contacted) = untouchable_upstream();
    let mut client = connect_with_flow(&engine, engine.http_port(), upstream);
    client
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: docs.example\r\n\
              Accept: text/html,application/xhtml+xml\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

    let reply = String::from_utf8_lossy(&read_to_end(&mut client)).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "got: {reply}");
    assert!(reply.contains("Content-Type: text/html"), "got: {reply}");
    assert!(reply.contains("Request blocked"), "got: {reply}");
    engine.stop();
}

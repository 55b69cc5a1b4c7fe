//! The proxy bridge: downstream/upstream HTTP/1.x relay with filtering hooks.
//!
//! Each accepted connection becomes one [`ProxySession`] task that serves
//! requests sequentially: parse the request head, classify it against the
//! rule store, connect to the recovered original destination when allowed,
//! relay the exchange, and filter response payloads where the content type
//! and options call for it. Keep-alive is honored; one request completes
//! before the next is read.

pub mod body;
pub mod http1;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use warden_core::events::ClassifyContent;
use warden_core::options::option;
use warden_core::rules::{style_block, inject_style};
use warden_core::{
    CategorySet, Decision, EventSink, FilterStore, ProgramOptions, RequestContext, ResourceType,
    TriggerStore,
};

use crate::ca::{CertificateStore, HostName};
use crate::error::{ProxyError, Result};

use body::{read_body_raw, relay_body, relay_rest, discard_body, BufferedBody};
use http1::{read_request_head, read_response_head, BodyFraming, HasHeaders, RequestHead};

/// Hard cap on a response body buffered for filtering. Larger bodies are
/// streamed unmodified.
pub const BODY_FILTER_CAP: usize = 5 * 1024 * 1024;

/// Cap on a blocked request's drained body before the connection is dropped
/// instead of kept alive.
const DISCARD_CAP: usize = 1024 * 1024;

const IDLE_KEEP_ALIVE: Duration = Duration::from_secs(60);
const HEADER_RECV: Duration = Duration::from_secs(30);
const UPSTREAM_CONNECT: Duration = Duration::from_secs(15);

/// Fallback block page served when the embedder supplies none.
const DEFAULT_BLOCK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Request blocked</title></head>
<body>
<h1>Request blocked</h1>
<p>This request was blocked by the filtering policy in effect on this device.</p>
</body>
</html>"#;

/// Boxed bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

/// State shared by every session of one engine instance.
pub struct SessionShared {
    pub options: ProgramOptions,
    pub categories: CategorySet,
    pub filters: FilterStore,
    pub triggers: TriggerStore,
    pub certs: CertificateStore,
    pub events: EventSink,
    pub classify: Option<ClassifyContent>,
    pub block_page: String,
    /// Packet mark applied to upstream sockets so the diverter skips them.
    pub upstream_mark: Option<u32>,
    /// Raised by `stop()`; sessions finish the in-flight exchange and close.
    pub stopping: AtomicBool,
    session_ids: AtomicU64,
}

impl SessionShared {
    pub fn new(
        options: ProgramOptions,
        certs: CertificateStore,
        events: EventSink,
        classify: Option<ClassifyContent>,
        block_page: Option<String>,
        upstream_mark: Option<u32>,
    ) -> Self {
        Self {
            options,
            categories: CategorySet::new(),
            filters: FilterStore::new(),
            triggers: TriggerStore::new(),
            certs,
            events,
            classify,
            block_page: block_page.unwrap_or_else(|| DEFAULT_BLOCK_PAGE.to_owned()),
            upstream_mark,
            stopping: AtomicBool::new(false),
            session_ids: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("rule_count", &self.filters.rule_count())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

/// Identity of one accepted downstream connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: u64,
    pub peer: SocketAddr,
    /// The destination the client originally dialed.
    pub original: SocketAddr,
    /// SNI observed on the TLS acceptor.
    pub sni: Option<String>,
    pub tls: bool,
}

/// Connects to the original destination, tagging the socket with the
/// diverter's escape mark so the connection is not re-diverted.
pub async fn connect_original(addr: SocketAddr, mark: Option<u32>) -> Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(target_os = "linux")]
    if let Some(mark) = mark {
        socket2::SockRef::from(&socket)
            .set_mark(mark)
            .map_err(|e| ProxyError::UpstreamConnect(format!("set mark: {e}")))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = mark;

    let stream = timeout(UPSTREAM_CONNECT, socket.connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout("connecting upstream"))?
        .map_err(|e| ProxyError::UpstreamConnect(format!("{addr}: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// What to do with the connection after one exchange.
enum Continuation {
    KeepAlive,
    Close,
}

fn connection_header(keep_alive: bool) -> &'static [u8] {
    if keep_alive {
        b"keep-alive"
    } else {
        b"close"
    }
}

/// One downstream connection being served.
pub struct ProxySession {
    shared: Arc<SessionShared>,
    ctx: SessionContext,
    downstream: Box<dyn AsyncStream>,
    down_buf: BytesMut,
    upstream: Option<Box<dyn AsyncStream>>,
    up_buf: BytesMut,
}

impl ProxySession {
    pub fn new(
        shared: Arc<SessionShared>,
        ctx: SessionContext,
        downstream: Box<dyn AsyncStream>,
    ) -> Self {
        Self {
            shared,
            ctx,
            downstream,
            down_buf: BytesMut::with_capacity(8 * 1024),
            upstream: None,
            up_buf: BytesMut::new(),
        }
    }

    /// Serves requests until the peer closes, an error ends the session, or
    /// the engine begins shutting down.
    pub async fn run(mut self) {
        let id = self.ctx.id;
        loop {
            if self.shared.is_stopping() {
                break;
            }
            let wait = if self.down_buf.is_empty() && self.upstream.is_some() {
                IDLE_KEEP_ALIVE
            } else {
                HEADER_RECV
            };
            let head = match timeout(wait, read_request_head(&mut self.downstream, &mut self.down_buf)).await {
                Ok(Ok(Some(head))) => head,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    self.shared
                        .events
                        .warn(&format!("session {id}: {err}"));
                    break;
                }
                Err(_) => break,
            };

            match self.serve_exchange(head).await {
                Ok(Continuation::KeepAlive) => continue,
                Ok(Continuation::Close) => break,
                Err(err) => {
                    self.shared
                        .events
                        .warn(&format!("session {id}: {err}"));
                    break;
                }
            }
        }
        let _ = self.downstream.shutdown().await;
        tracing::debug!(session = id, "session closed");
    }

    async fn serve_exchange(&mut self, mut req: RequestHead) -> Result<Continuation> {
        let scheme = if self.ctx.tls { "https" } else { "http" };
        let host = self.request_host(&req);
        // The Host header is the authority of record; it carries the port
        // exactly when the client dialed a non-default one.
        let authority = req
            .header_str("host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| host.clone());
        let url = build_url(scheme, &authority, &req.target);
        let req_framing = BodyFraming::for_request(&req)?;

        tracing::debug!(
            session = self.ctx.id,
            method = %req.method,
            %url,
            "request received"
        );

        // CLASSIFY
        let block_third_party = self.shared.options.get(option::BLOCK_THIRD_PARTY);
        let filtering = self.filtering_enabled()
            && (self.shared.categories.any_enabled() || block_third_party);
        if filtering {
            let referer_host = req.header_str("referer").and_then(url_host);
            let resource_type = ResourceType::infer(
                req.header_str("sec-fetch-dest"),
                req.header_str("accept"),
                &req.target,
            );
            let ctx = RequestContext {
                url: &url,
                host: &host,
                referer_host,
                resource_type,
            };
            let decision = self.shared.filters.query_url(&ctx, &self.shared.categories);
            let verdict = match decision {
                Decision::Block { category, rule } => Some((category, rule)),
                // Exceptions also shield third-party requests from the
                // blanket toggle.
                Decision::Allow { .. } => None,
                Decision::None if block_third_party && ctx.is_third_party() => {
                    Some((0, "third-party".to_owned()))
                }
                Decision::None => None,
            };
            if let Some((category, rule)) = verdict {
                self.shared.events.request_blocked(category, &rule, &url, 0);
                let reusable =
                    discard_body(&mut self.downstream, &mut self.down_buf, req_framing, DISCARD_CAP)
                        .await?;
                let document = resource_type == ResourceType::Document;
                self.write_block_response(document, req.keep_alive() && reusable)
                    .await?;
                return Ok(if req.keep_alive() && reusable {
                    Continuation::KeepAlive
                } else {
                    Continuation::Close
                });
            }
        }

        // CONNECT_UPSTREAM
        if self.upstream.is_none() {
            match self.connect_upstream(&host).await {
                Ok(stream) => {
                    self.upstream = Some(stream);
                    self.up_buf.clear();
                }
                Err(err) => {
                    self.shared
                        .events
                        .warn(&format!("session {}: {err}", self.ctx.id));
                    let reason_header = matches!(err, ProxyError::UpstreamTlsVerify(_))
                        .then_some(("X-Fe-Reason", "upstream-tls"));
                    self.write_simple_response(502, "Bad Gateway", reason_header)
                        .await?;
                    return Ok(Continuation::Close);
                }
            }
        }

        // FORWARD_REQUEST
        let may_filter_response = filtering
            && (self.shared.triggers.has_triggers(&self.shared.categories)
                || self.shared.filters.has_cosmetic_rules(&self.shared.categories)
                || self.shared.classify.is_some());
        let expects_continue = req
            .header_str("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
        if expects_continue {
            // Answer the expectation ourselves so the body flows; upstream
            // sees a plain request.
            req.remove_header("expect");
            self.downstream
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await?;
            self.downstream.flush().await?;
        }
        if may_filter_response {
            req.set_header("Accept-Encoding", b"identity");
        }

        let upstream = self.upstream.as_mut().ok_or_else(|| {
            ProxyError::Transient("upstream connection vanished".into())
        })?;
        upstream.write_all(&req.encode()).await?;
        relay_body(&mut self.downstream, upstream, &mut self.down_buf, req_framing).await?;
        upstream.flush().await?;

        // FORWARD_RESPONSE_HEADERS, skipping interim 1xx responses.
        let mut resp = loop {
            let head = timeout(
                HEADER_RECV,
                read_response_head(upstream, &mut self.up_buf),
            )
            .await
            .map_err(|_| ProxyError::Timeout("reading response headers"))??;
            if (100..200).contains(&head.status) {
                if head.status == 101 {
                    break head;
                }
                self.downstream.write_all(&head.encode()).await?;
                continue;
            }
            break head;
        };

        // Protocol switch: forward the head and splice bytes both ways.
        if resp.status == 101 {
            self.downstream.write_all(&resp.encode()).await?;
            self.downstream.flush().await?;
            self.tunnel_remainder().await?;
            return Ok(Continuation::Close);
        }

        let resp_framing = BodyFraming::for_response(&req.method, &resp)?;
        let client_ka = req.keep_alive();
        let server_ka = resp.keep_alive() && resp_framing != BodyFraming::UntilClose;

        // Decide whether this body gets buffered for inspection.
        let content_type = resp
            .content_type()
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        let scan_triggers = filtering
            && self.shared.options.get(option::FILTER_TEXT_TRIGGERS)
            && is_textual(&content_type)
            && self.shared.triggers.has_triggers(&self.shared.categories);
        let hide_selectors = if filtering
            && self.shared.options.get(option::FILTER_ELEMENT_HIDING)
            && content_type == "text/html"
        {
            self.shared
                .filters
                .element_hide_selectors(&host, &self.shared.categories)
        } else {
            Vec::new()
        };
        let classify = filtering.then(|| self.shared.classify.clone()).flatten();
        let wants_buffering = resp_framing.has_body()
            && (scan_triggers || !hide_selectors.is_empty() || classify.is_some());

        if !wants_buffering {
            // STREAM_BODY
            resp.set_header("Connection", connection_header(client_ka && server_ka));
            self.downstream.write_all(&resp.encode()).await?;
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| ProxyError::Transient("upstream connection vanished".into()))?;
            relay_body(upstream, &mut self.downstream, &mut self.up_buf, resp_framing).await?;
            self.downstream.flush().await?;
            return self.finish_exchange(client_ka, server_ka, resp_framing).await;
        }

        // BUFFER_BODY
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| ProxyError::Transient("upstream connection vanished".into()))?;
        let captured = read_body_raw(upstream, &mut self.up_buf, resp_framing, BODY_FILTER_CAP).await;

        match captured? {
            BufferedBody::Overflow { raw, rest } => {
                // Too large to inspect; stream through untouched.
                resp.set_header("Connection", connection_header(client_ka && server_ka));
                self.downstream.write_all(&resp.encode()).await?;
                self.downstream.write_all(&raw).await?;
                let upstream = self
                    .upstream
                    .as_mut()
                    .ok_or_else(|| ProxyError::Transient("upstream connection vanished".into()))?;
                relay_rest(upstream, &mut self.downstream, &mut self.up_buf, rest).await?;
                self.finish_exchange(client_ka, server_ka, resp_framing).await
            }
            BufferedBody::Complete(raw) => {
                let decoded = if resp_framing == BodyFraming::Chunked {
                    http1::dechunk(&raw)?
                } else {
                    raw
                };

                // FILTER_DECISION
                if scan_triggers {
                    let text = String::from_utf8_lossy(&decoded);
                    if let Some(hit) = self.shared.triggers.scan(&text, &self.shared.categories) {
                        self.shared.events.request_blocked(
                            hit.category,
                            &hit.keyword,
                            &url,
                            decoded.len() as u64,
                        );
                        self.write_block_response(true, client_ka).await?;
                        // The upstream body was fully consumed; downstream
                        // stays usable when the client asked to keep it.
                        if !server_ka {
                            self.upstream = None;
                        }
                        return Ok(if client_ka {
                            Continuation::KeepAlive
                        } else {
                            Continuation::Close
                        });
                    }
                }

                if let Some(cb) = classify.as_deref() {
                    let category = cb(&decoded, &content_type);
                    if category != 0 && self.shared.categories.get(category) {
                        self.shared.events.request_blocked(
                            category,
                            "content-classifier",
                            &url,
                            decoded.len() as u64,
                        );
                        self.write_block_response(true, client_ka).await?;
                        if !server_ka {
                            self.upstream = None;
                        }
                        return Ok(if client_ka {
                            Continuation::KeepAlive
                        } else {
                            Continuation::Close
                        });
                    }
                }

                let body = if hide_selectors.is_empty() {
                    decoded
                } else {
                    let all: Vec<String> = hide_selectors
                        .iter()
                        .flat_map(|(_, sels)| sels.iter().cloned())
                        .collect();
                    let style = style_block(&all);
                    let injected = inject_style(&decoded, &style);
                    for (category, sels) in &hide_selectors {
                        self.shared
                            .events
                            .elements_blocked(sels.len() as u32, &url, *category);
                    }
                    injected
                };

                // DELIVER with recomputed framing.
                resp.remove_header("Transfer-Encoding");
                resp.set_header("Content-Length", body.len().to_string().as_bytes());
                resp.set_header("Connection", connection_header(client_ka && server_ka));
                self.downstream.write_all(&resp.encode()).await?;
                self.downstream.write_all(&body).await?;
                self.downstream.flush().await?;
                self.finish_exchange(client_ka, server_ka, BodyFraming::ContentLength(0))
                    .await
            }
        }
    }

    async fn finish_exchange(
        &mut self,
        client_ka: bool,
        server_ka: bool,
        resp_framing: BodyFraming,
    ) -> Result<Continuation> {
        if resp_framing == BodyFraming::UntilClose {
            // Upstream EOF delimits the body; propagate the half-close.
            self.upstream = None;
            let _ = self.downstream.shutdown().await;
            return Ok(Continuation::Close);
        }
        if !server_ka {
            self.upstream = None;
        }
        if client_ka && !self.shared.is_stopping() {
            Ok(Continuation::KeepAlive)
        } else {
            Ok(Continuation::Close)
        }
    }

    /// Blind relay after a 101 protocol switch.
    async fn tunnel_remainder(&mut self) -> Result<()> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| ProxyError::Transient("upstream connection vanished".into()))?;
        if !self.up_buf.is_empty() {
            self.downstream.write_all(&self.up_buf).await?;
            self.up_buf.clear();
        }
        if !self.down_buf.is_empty() {
            upstream.write_all(&self.down_buf).await?;
            self.down_buf.clear();
        }
        tokio::io::copy_bidirectional(&mut self.downstream, upstream).await?;
        Ok(())
    }

    fn filtering_enabled(&self) -> bool {
        if self.ctx.tls {
            self.shared.options.get(option::FILTER_HTTPS)
        } else {
            self.shared.options.get(option::FILTER_PLAIN_HTTP)
        }
    }

    fn request_host(&self, req: &RequestHead) -> String {
        req.host()
            .map(str::to_ascii_lowercase)
            .or_else(|| self.ctx.sni.clone())
            .unwrap_or_else(|| self.ctx.original.ip().to_string())
    }

    async fn connect_upstream(&self, host: &str) -> Result<Box<dyn AsyncStream>> {
        let tcp = connect_original(self.ctx.original, self.shared.upstream_mark).await?;
        if !self.ctx.tls {
            return Ok(Box::new(tcp));
        }

        // Upstream TLS: SNI from the downstream hello (or Host header),
        // verified against the configured roots.
        let sni = self
            .ctx
            .sni
            .as_deref()
            .unwrap_or(host);
        let server_name = HostName::parse(sni)?.server_name()?;
        let connector = TlsConnector::from(self.shared.certs.client_config());
        let stream = timeout(UPSTREAM_CONNECT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::Timeout("upstream TLS handshake"))?
            .map_err(|e| ProxyError::UpstreamTlsVerify(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn write_block_response(&mut self, document: bool, keep_alive: bool) -> Result<()> {
        let use_page = document && self.shared.options.get(option::USE_HTML_BLOCK_PAGE);
        let (status, reason, body, content_type) = if use_page {
            (200u16, "OK", self.shared.block_page.clone(), "text/html; charset=utf-8")
        } else {
            (403u16, "Forbidden", String::new(), "text/plain")
        };

        let mut head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
            body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        )
        .into_bytes();
        head.extend_from_slice(body.as_bytes());
        self.downstream.write_all(&head).await?;
        self.downstream.flush().await?;
        Ok(())
    }

    async fn write_simple_response(
        &mut self,
        status: u16,
        reason: &str,
        extra: Option<(&str, &str)>,
    ) -> Result<()> {
        let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
        if let Some((name, value)) = extra {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
        self.downstream.write_all(head.as_bytes()).await?;
        self.downstream.flush().await?;
        Ok(())
    }
}

/// Builds the full request URL from the transparent-proxy view of the world.
fn build_url(scheme: &str, authority: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_owned();
    }
    format!("{scheme}://{authority}{target}")
}

/// Host portion of an absolute URL, for referer handling.
fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    let host = host.split(':').next()?;
    (!host.is_empty()).then_some(host)
}

/// Content types subject to text-trigger scanning.
fn is_textual(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}

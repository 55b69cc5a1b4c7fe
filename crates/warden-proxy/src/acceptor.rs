//! Accept loops for the plain and TLS listeners.
//!
//! Every accepted socket is resolved against the diverter first. Flows the
//! firewall refused are spliced straight to their original destination with
//! no inspection; intercepted flows become proxy sessions. The TLS acceptor
//! additionally sniffs the ClientHello, forges a matching server context, and
//! finishes the handshake before the session starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use warden_core::options::option;

use crate::bridge::{connect_original, ProxySession, SessionContext, SessionShared};
use crate::ca::HostName;
use crate::diverter::{DiversionControl, FlowRecord, FlowVerdict};
use crate::error::Result;
use crate::tls::{read_client_hello, PrefixedStream};

const TLS_HANDSHAKE: Duration = Duration::from_secs(10);

/// Runs one accept loop until the shutdown signal fires or the listener
/// breaks.
pub async fn run_acceptor(
    listener: TcpListener,
    tls: bool,
    shared: Arc<SessionShared>,
    diverter: Arc<DiversionControl>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let kind = if tls { "https" } else { "http" };
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        let diverter = diverter.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, peer, tls, shared.clone(), diverter).await {
                                shared.events.warn(&format!("{kind} acceptor: {err}"));
                            }
                        });
                    }
                    Err(err) => {
                        shared.events.warn(&format!("{kind} accept failed: {err}"));
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!(kind, "acceptor stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    tls: bool,
    shared: Arc<SessionShared>,
    diverter: Arc<DiversionControl>,
) -> Result<()> {
    let require_approval = shared.options.get(option::REQUIRE_FIREWALL_APPROVAL);
    let record = match diverter.resolve(peer, &stream, require_approval)? {
        FlowVerdict::Passthrough(record) => {
            return passthrough(stream, record, &shared).await;
        }
        FlowVerdict::Intercept(record) => record,
    };

    let ctx = SessionContext {
        id: shared.next_session_id(),
        peer,
        original: record.original,
        sni: None,
        tls,
    };

    if !tls {
        tracing::debug!(session = ctx.id, peer = %peer, original = %record.original, "plain session accepted");
        ProxySession::new(shared, ctx, Box::new(stream)).run().await;
        return Ok(());
    }

    serve_tls(stream, ctx, shared).await
}

async fn serve_tls(
    mut stream: TcpStream,
    mut ctx: SessionContext,
    shared: Arc<SessionShared>,
) -> Result<()> {
    let hello = timeout(TLS_HANDSHAKE, read_client_hello(&mut stream))
        .await
        .map_err(|_| crate::error::ProxyError::Timeout("reading ClientHello"))??;

    // SNI, or the original IP literal when the hello carries none. A reverse
    // DNS query here would stall the handshake, so the literal is the
    // fallback of record.
    let host = match hello.server_name.as_deref() {
        Some(name) => HostName::parse(name)?,
        None => HostName::Ip(ctx.original.ip()),
    };
    ctx.sni = Some(host.to_key());

    let config = shared.certs.context_for(&host).await?;
    let acceptor = TlsAcceptor::from(config);
    let replay = PrefixedStream::new(hello.into_buffered(), stream);
    let tls_stream = timeout(TLS_HANDSHAKE, acceptor.accept(replay))
        .await
        .map_err(|_| crate::error::ProxyError::Timeout("TLS handshake"))??;

    tracing::debug!(
        session = ctx.id,
        host = %host,
        original = %ctx.original,
        "TLS session established"
    );
    ProxySession::new(shared, ctx, Box::new(tls_stream)).run().await;
    Ok(())
}

/// Blind relay for flows the firewall refused to let us terminate.
async fn passthrough(
    mut client: TcpStream,
    record: FlowRecord,
    shared: &SessionShared,
) -> Result<()> {
    let mut upstream = connect_original(record.original, shared.upstream_mark).await?;
    tracing::debug!(original = %record.original, "relaying unapproved flow untouched");
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

//! TLS ClientHello inspection.
//!
//! The TLS acceptor reads the downstream ClientHello into a bounded buffer,
//! extracts the Server Name Indication to pick a forged context, then replays
//! the buffered bytes into the TLS engine through [`PrefixedStream`] and
//! completes the handshake. Reading (rather than peeking) keeps hellos split
//! across TCP segments simple: the loop just keeps reading until the record
//! is complete.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{ProxyError, Result};

/// Upper bound on the buffered ClientHello. A hello larger than this is
/// treated as malformed.
pub const MAX_CLIENT_HELLO: usize = 16 * 1024;

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// A parsed ClientHello together with the raw bytes consumed from the socket.
#[derive(Debug)]
pub struct ClientHello {
    /// Hostname from the SNI extension, if present. Not yet normalized.
    pub server_name: Option<String>,
    buffered: Vec<u8>,
}

impl ClientHello {
    /// The raw bytes to replay into the TLS engine.
    pub fn into_buffered(self) -> Vec<u8> {
        self.buffered
    }
}

/// Reads one complete TLS record from `stream` and parses it as a
/// ClientHello. Malformed records, pre-TLS-1.0 versions, and oversized hellos
/// are protocol errors.
pub async fn read_client_hello<S>(stream: &mut S) -> Result<ClientHello>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(2048);

    // Record header first: content type, legacy version, length.
    while buf.len() < 5 {
        read_some(stream, &mut buf).await?;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(ProxyError::Protocol(format!(
            "expected TLS handshake record, got content type 0x{:02x}",
            buf[0]
        )));
    }
    if buf[1] != 0x03 {
        return Err(ProxyError::Protocol(format!(
            "unsupported TLS record version 0x{:02x}{:02x}",
            buf[1], buf[2]
        )));
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = 5 + record_len;
    if total > MAX_CLIENT_HELLO {
        return Err(ProxyError::Protocol(format!(
            "ClientHello record of {record_len} bytes exceeds limit"
        )));
    }

    while buf.len() < total {
        read_some(stream, &mut buf).await?;
    }

    let server_name = parse_sni(&buf[..total])?;
    Ok(ClientHello {
        server_name,
        buffered: buf,
    })
}

async fn read_some<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 2048];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(ProxyError::Protocol(
            "connection closed during ClientHello".into(),
        ));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Extracts the SNI hostname from a complete handshake record.
fn parse_sni(record: &[u8]) -> Result<Option<String>> {
    let (_, plaintext) = tls_parser::parse_tls_plaintext(record)
        .map_err(|e| ProxyError::Protocol(format!("malformed TLS record: {e:?}")))?;

    let hello = plaintext
        .msg
        .iter()
        .find_map(|msg| match msg {
            tls_parser::TlsMessage::Handshake(
                tls_parser::TlsMessageHandshake::ClientHello(hello),
            ) => Some(hello),
            _ => None,
        })
        .ok_or_else(|| ProxyError::Protocol("record does not contain a ClientHello".into()))?;

    // Legacy hello version: reject anything below TLS 1.0.
    if hello.version.0 < 0x0301 {
        return Err(ProxyError::Protocol(format!(
            "ClientHello version 0x{:04x} below TLS 1.0",
            hello.version.0
        )));
    }

    let Some(ext_data) = hello.ext else {
        return Ok(None);
    };
    let Ok((_, extensions)) = tls_parser::parse_tls_extensions(ext_data) else {
        return Err(ProxyError::Protocol("malformed ClientHello extensions".into()));
    };

    for ext in &extensions {
        if let tls_parser::TlsExtension::SNI(names) = ext {
            for (kind, data) in names {
                if *kind != tls_parser::SNIType::HostName {
                    continue;
                }
                let name = std::str::from_utf8(data).map_err(|_| {
                    ProxyError::Protocol("SNI hostname is not valid UTF-8".into())
                })?;
                return Ok(Some(name.to_owned()));
            }
        }
    }
    Ok(None)
}

/// A stream that yields `prefix` before reading from the inner stream.
/// Writes pass straight through.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, ClientConnection, RootCertStore};

    /// Serializes a real ClientHello for `sni` using rustls.
    fn client_hello_bytes(sni: &str) -> Vec<u8> {
        let config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        );
        let server = ServerName::try_from(sni.to_owned()).unwrap();
        let mut conn = ClientConnection::new(config, server).unwrap();
        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn extracts_sni_from_real_hello() {
        let bytes = client_hello_bytes("example.test");
        let (mut client, mut server) = tokio::io::duplex(32 * 1024);
        client.write_all(&bytes).await.unwrap();

        let hello = read_client_hello(&mut server).await.unwrap();
        assert_eq!(hello.server_name.as_deref(), Some("example.test"));
        assert_eq!(hello.into_buffered(), bytes);
    }

    #[tokio::test]
    async fn hello_split_across_segments_still_parses() {
        let bytes = client_hello_bytes("split.example.test");
        let (mut client, mut server) = tokio::io::duplex(32 * 1024);
        let (first, second) = bytes.split_at(7);

        let first = first.to_vec();
        let second = second.to_vec();
        let writer = tokio::spawn(async move {
            client.write_all(&first).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(&second).await.unwrap();
            client
        });

        let hello = read_client_hello(&mut server).await.unwrap();
        assert_eq!(hello.server_name.as_deref(), Some("split.example.test"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn non_tls_bytes_are_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = read_client_hello(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn ssl2_style_record_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Handshake record claiming version 2.0.
        client
            .write_all(&[0x16, 0x02, 0x00, 0x00, 0x05, 1, 2, 3, 4, 5])
            .await
            .unwrap();

        let err = read_client_hello(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_record_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&[0x16, 0x03, 0x01, 0xff, 0xff])
            .await
            .unwrap();

        let err = read_client_hello(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_hello_is_protocol_error() {
        let bytes = client_hello_bytes("trunc.test");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&bytes[..bytes.len() / 2]).await.unwrap();
        drop(client);

        let err = read_client_hello(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn prefixed_stream_replays_prefix_first() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = PrefixedStream::new(b"hello".to_vec(), server);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}

//! Body transfer: buffered capture for filtering and streaming relay.
//!
//! Bodies that may be filtered are captured in their raw wire encoding up to
//! a hard cap. A body that completes under the cap can be decoded, inspected,
//! and rewritten; one that overflows is flushed as-is and the remainder is
//! streamed untouched. All consumption funnels through the caller's leftover
//! buffer so bytes read past a message head are never lost.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::http1::{BodyFraming, ChunkScanner};

/// Read granularity for relays. Writes complete before the next read is
/// issued, which bounds how far the proxy runs ahead of a slow receiver.
const RELAY_CHUNK: usize = 64 * 1024;

/// Raw body capture result.
pub enum BufferedBody {
    /// The whole body, still in wire encoding.
    Complete(Vec<u8>),
    /// Cap exceeded: what was captured so far plus the state needed to stream
    /// the rest.
    Overflow { raw: Vec<u8>, rest: StreamRest },
}

/// Remaining-body state for streaming after a capture overflow.
pub enum StreamRest {
    Remaining(u64),
    Chunked(ChunkScanner),
    UntilClose,
}

impl StreamRest {
    fn from_framing(framing: BodyFraming) -> Option<Self> {
        match framing {
            BodyFraming::None => None,
            BodyFraming::ContentLength(n) => Some(Self::Remaining(n)),
            BodyFraming::Chunked => Some(Self::Chunked(ChunkScanner::new())),
            BodyFraming::UntilClose => Some(Self::UntilClose),
        }
    }
}

/// How long a body transfer may stall between reads.
const BODY_STALL: std::time::Duration = std::time::Duration::from_secs(30);

/// Ensures `leftover` holds at least one byte, reading from `src` if needed.
/// Returns false on EOF; a read that stalls past the deadline is an error.
async fn fill<S>(src: &mut S, leftover: &mut BytesMut) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    if !leftover.is_empty() {
        return Ok(true);
    }
    let n = tokio::time::timeout(BODY_STALL, src.read_buf(leftover))
        .await
        .map_err(|_| ProxyError::Timeout("waiting for body bytes"))??;
    Ok(n > 0)
}

/// Captures a body in wire encoding, up to `cap` bytes.
pub async fn read_body_raw<S>(
    src: &mut S,
    leftover: &mut BytesMut,
    framing: BodyFraming,
    cap: usize,
) -> Result<BufferedBody>
where
    S: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::None => Ok(BufferedBody::Complete(Vec::new())),
        BodyFraming::ContentLength(total) => {
            let mut raw = Vec::with_capacity((total as usize).min(cap));
            let mut remaining = total;
            while remaining > 0 {
                if raw.len() >= cap {
                    return Ok(BufferedBody::Overflow {
                        raw,
                        rest: StreamRest::Remaining(remaining),
                    });
                }
                if !fill(src, leftover).await? {
                    return Err(ProxyError::Protocol("connection closed mid body".into()));
                }
                let take = (leftover.len() as u64).min(remaining).min((cap - raw.len()) as u64)
                    as usize;
                raw.extend_from_slice(&leftover[..take]);
                leftover.advance(take);
                remaining -= take as u64;
            }
            Ok(BufferedBody::Complete(raw))
        }
        BodyFraming::Chunked => {
            let mut raw = Vec::new();
            let mut scanner = ChunkScanner::new();
            loop {
                if !fill(src, leftover).await? {
                    return Err(ProxyError::Protocol("connection closed mid chunked body".into()));
                }
                let progress = scanner.advance(&leftover[..])?;
                raw.extend_from_slice(&leftover[..progress.consumed]);
                leftover.advance(progress.consumed);
                if progress.done {
                    return Ok(BufferedBody::Complete(raw));
                }
                if raw.len() > cap {
                    return Ok(BufferedBody::Overflow {
                        raw,
                        rest: StreamRest::Chunked(scanner),
                    });
                }
            }
        }
        BodyFraming::UntilClose => {
            let mut raw = Vec::new();
            loop {
                if !fill(src, leftover).await? {
                    return Ok(BufferedBody::Complete(raw));
                }
                raw.extend_from_slice(&leftover[..]);
                let len = leftover.len();
                leftover.advance(len);
                if raw.len() > cap {
                    return Ok(BufferedBody::Overflow {
                        raw,
                        rest: StreamRest::UntilClose,
                    });
                }
            }
        }
    }
}

/// Streams the remainder of a body after an overflow. Returns bytes moved.
pub async fn relay_rest<S, D>(
    src: &mut S,
    dst: &mut D,
    leftover: &mut BytesMut,
    rest: StreamRest,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut moved = 0u64;
    match rest {
        StreamRest::Remaining(mut remaining) => {
            while remaining > 0 {
                if !fill(src, leftover).await? {
                    return Err(ProxyError::Protocol("connection closed mid body".into()));
                }
                let take = (leftover.len() as u64).min(remaining).min(RELAY_CHUNK as u64) as usize;
                dst.write_all(&leftover[..take]).await?;
                leftover.advance(take);
                remaining -= take as u64;
                moved += take as u64;
            }
        }
        StreamRest::Chunked(mut scanner) => {
            while !scanner.is_done() {
                if !fill(src, leftover).await? {
                    return Err(ProxyError::Protocol("connection closed mid chunked body".into()));
                }
                let progress = scanner.advance(&leftover[..])?;
                dst.write_all(&leftover[..progress.consumed]).await?;
                leftover.advance(progress.consumed);
                moved += progress.consumed as u64;
            }
        }
        StreamRest::UntilClose => loop {
            if !fill(src, leftover).await? {
                break;
            }
            let take = leftover.len().min(RELAY_CHUNK);
            dst.write_all(&leftover[..take]).await?;
            leftover.advance(take);
            moved += take as u64;
        },
    }
    dst.flush().await?;
    Ok(moved)
}

/// Streams a whole body from `src` to `dst` without inspecting it.
pub async fn relay_body<S, D>(
    src: &mut S,
    dst: &mut D,
    leftover: &mut BytesMut,
    framing: BodyFraming,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    match StreamRest::from_framing(framing) {
        Some(rest) => relay_rest(src, dst, leftover, rest).await,
        None => Ok(0),
    }
}

/// Reads and discards a body, up to `cap` bytes. Returns false when the body
/// was larger than the cap (the caller should drop the connection instead of
/// keeping it alive).
pub async fn discard_body<S>(
    src: &mut S,
    leftover: &mut BytesMut,
    framing: BodyFraming,
    cap: usize,
) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    match read_body_raw(src, leftover, framing, cap).await? {
        BufferedBody::Complete(_) => Ok(true),
        BufferedBody::Overflow { .. } => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn capture(
        wire: &[u8],
        pre: &[u8],
        framing: BodyFraming,
        cap: usize,
    ) -> Result<BufferedBody> {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(wire).await.unwrap();
        drop(client);
        let mut leftover = BytesMut::from(pre);
        read_body_raw(&mut server, &mut leftover, framing, cap).await
    }

    #[tokio::test]
    async fn content_length_body_complete() {
        let body = capture(b"world", b"hello ", BodyFraming::ContentLength(11), 1024)
            .await
            .unwrap();
        match body {
            BufferedBody::Complete(raw) => assert_eq!(raw, b"hello world"),
            _ => panic!("expected complete body"),
        }
    }

    #[tokio::test]
    async fn content_length_at_cap_is_complete() {
        let body = capture(b"12345", b"", BodyFraming::ContentLength(5), 5)
            .await
            .unwrap();
        assert!(matches!(body, BufferedBody::Complete(raw) if raw == b"12345"));
    }

    #[tokio::test]
    async fn content_length_over_cap_overflows() {
        let body = capture(b"123456", b"", BodyFraming::ContentLength(6), 5)
            .await
            .unwrap();
        match body {
            BufferedBody::Overflow { raw, rest } => {
                assert_eq!(raw, b"12345");
                assert!(matches!(rest, StreamRest::Remaining(1)));
            }
            _ => panic!("expected overflow"),
        }
    }

    #[tokio::test]
    async fn chunked_body_complete_keeps_pipeline_bytes() {
        let wire = b"4\r\nWiki\r\n0\r\n\r\nEXTRA";
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(wire).await.unwrap();
        drop(client);

        let mut leftover = BytesMut::new();
        let body = read_body_raw(&mut server, &mut leftover, BodyFraming::Chunked, 1024)
            .await
            .unwrap();
        match body {
            BufferedBody::Complete(raw) => assert_eq!(raw, b"4\r\nWiki\r\n0\r\n\r\n"),
            _ => panic!("expected complete body"),
        }
        assert_eq!(&leftover[..], b"EXTRA");
    }

    #[tokio::test]
    async fn until_close_body_reads_to_eof() {
        let body = capture(b"streamed", b"", BodyFraming::UntilClose, 1024)
            .await
            .unwrap();
        assert!(matches!(body, BufferedBody::Complete(raw) if raw == b"streamed"));
    }

    #[tokio::test]
    async fn relay_rest_moves_remaining_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"abcdef").await.unwrap();
        drop(client);

        let (mut sink_in, mut sink_out) = tokio::io::duplex(1024);
        let mut leftover = BytesMut::new();
        let moved = relay_rest(
            &mut server,
            &mut sink_in,
            &mut leftover,
            StreamRest::Remaining(6),
        )
        .await
        .unwrap();
        assert_eq!(moved, 6);
        drop(sink_in);

        let mut out = Vec::new();
        sink_out.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn relay_body_streams_chunked() {
        let wire = b"3\r\nabc\r\n0\r\n\r\n";
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(wire).await.unwrap();
        drop(client);

        let (mut sink_in, mut sink_out) = tokio::io::duplex(1024);
        let mut leftover = BytesMut::new();
        let moved = relay_body(&mut server, &mut sink_in, &mut leftover, BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(moved as usize, wire.len());
        drop(sink_in);

        let mut out = Vec::new();
        sink_out.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, wire);
    }

    #[tokio::test]
    async fn discard_respects_cap() {
        assert!(discard_body(
            &mut tokio::io::empty(),
            &mut BytesMut::from(&b"tiny"[..]),
            BodyFraming::ContentLength(4),
            1024
        )
        .await
        .unwrap());

        let big = vec![b'x'; 64];
        assert!(!discard_body(
            &mut tokio::io::empty(),
            &mut BytesMut::from(&big[..]),
            BodyFraming::ContentLength(64),
            16
        )
        .await
        .unwrap());
    }
}

//! Sniffing stream adapter
//!
//! Wraps an accepted connection so the first bytes a client sends can be
//! examined once and then replayed to whichever driver the connection is
//! eventually routed to. The adapter is a small mode machine: `Sniffing`
//! records everything read, `DoneSniffing` consumes the recorded bytes
//! (used while the TLS handshake re-reads the client hello), `Replaying`
//! re-delivers them from the start.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

/// Largest initial read performed while sniffing, one Ethernet MTU.
pub const MTU: usize = 1500;

/// Byte stream a [`SniffStream`] can wrap: the accepted TCP socket, or the
/// cleartext side of an unwrapped TLS session.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sniffing,
    DoneSniffing,
    Replaying,
}

/// A duplex stream that can record and replay its initial bytes.
///
/// Reads behave according to the current mode; writes always pass straight
/// through to the underlying stream. Dropping the stream closes it.
pub struct SniffStream {
    inner: Box<dyn Transport>,
    buffer: Vec<u8>,
    pos: usize,
    mode: Mode,
    uuid: Uuid,
    sequence: AtomicU64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl SniffStream {
    /// Wrap a freshly accepted connection and allocate its identifier.
    pub fn new(inner: Box<dyn Transport>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self::with_identity(inner, Uuid::new_v4(), peer_addr, local_addr)
    }

    /// Wrap a stream while keeping an existing identity. Used when the
    /// ciphertext stream is swapped for its unwrapped cleartext side so one
    /// connection keeps one UUID.
    pub fn with_identity(
        inner: Box<dyn Transport>,
        uuid: Uuid,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
            mode: Mode::Sniffing,
            uuid,
            sequence: AtomicU64::new(0),
            peer_addr,
            local_addr,
        }
    }

    /// Stable identifier allocated at accept time.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Monotonically increasing counter, used by drivers to name the
    /// session captures of one connection.
    pub fn sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Address of the listener that accepted this connection, so drivers
    /// see the real destination port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop recording. Reads consume what is left of the replay buffer and
    /// then pass through; consumed bytes will not be re-emitted.
    pub fn done_sniffing(&mut self) {
        self.mode = Mode::DoneSniffing;
    }

    /// Rewind so every recorded byte is delivered again before reads fall
    /// through to the underlying stream.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.mode = Mode::Replaying;
    }
}

impl AsyncRead for SniffStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Sniffing => {
                let start = buf.filled().len();
                match Pin::new(&mut this.inner).poll_read(cx, buf) {
                    Poll::Ready(Ok(())) => {
                        this.buffer.extend_from_slice(&buf.filled()[start..]);
                        Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
            Mode::DoneSniffing | Mode::Replaying => {
                if this.pos < this.buffer.len() {
                    let n = buf.remaining().min(this.buffer.len() - this.pos);
                    buf.put_slice(&this.buffer[this.pos..this.pos + n]);
                    this.pos += n;
                    Poll::Ready(Ok(()))
                } else {
                    Pin::new(&mut this.inner).poll_read(cx, buf)
                }
            }
        }
    }
}

impl AsyncWrite for SniffStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for SniffStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffStream")
            .field("uuid", &self.uuid)
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .field("pos", &self.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn wrap(stream: tokio::io::DuplexStream) -> SniffStream {
        SniffStream::new(Box::new(stream), test_addr(41000), test_addr(80))
    }

    #[tokio::test]
    async fn replay_matches_original_bytes() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sniffer = wrap(server);

        let (_client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut buf = vec![0u8; MTU];
        let n = sniffer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.0\r\n\r\n");

        // After a reset the driver must see exactly the original bytes.
        sniffer.reset();
        let mut replayed = vec![0u8; n];
        sniffer.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed, b"GET / HTTP/1.0\r\n\r\n");

        // Bytes sent after the sniff fall through from the socket.
        client_wr.write_all(b"tail").await.unwrap();
        let mut tail = [0u8; 4];
        sniffer.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[tokio::test]
    async fn done_sniffing_consumes_replay() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sniffer = wrap(server);

        let (_client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(b"\x16\x03\x01hello").await.unwrap();

        let mut buf = vec![0u8; MTU];
        let n = sniffer.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);

        // Done-sniffing drains the recorded bytes once, like a handshake
        // re-reading the client hello would.
        sniffer.done_sniffing();
        let mut drained = vec![0u8; 8];
        sniffer.read_exact(&mut drained).await.unwrap();
        assert_eq!(&drained, b"\x16\x03\x01hello");

        // A reset afterwards rewinds to the full recording.
        sniffer.reset();
        let mut again = vec![0u8; 8];
        sniffer.read_exact(&mut again).await.unwrap();
        assert_eq!(&again, b"\x16\x03\x01hello");
    }

    #[tokio::test]
    async fn partial_replay_then_passthrough() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sniffer = wrap(server);

        let (_client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(b"abcdef").await.unwrap();

        let mut buf = vec![0u8; MTU];
        let n = sniffer.read(&mut buf).await.unwrap();
        assert_eq!(n, 6);

        sniffer.reset();
        // Drain the replay in small reads; boundaries must not lose bytes.
        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        let n = sniffer.read(&mut chunk).await.unwrap();
        out.extend_from_slice(&chunk[..n]);
        let n = sniffer.read(&mut chunk).await.unwrap();
        out.extend_from_slice(&chunk[..n]);
        assert_eq!(&out, b"abcdef");
    }

    #[tokio::test]
    async fn writes_pass_through_in_every_mode() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sniffer = wrap(server);
        let (mut client_rd, mut client_wr) = tokio::io::split(client);

        sniffer.write_all(b"banner").await.unwrap();
        let mut got = [0u8; 6];
        client_rd.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"banner");

        client_wr.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        sniffer.read_exact(&mut buf).await.unwrap();
        sniffer.reset();
        sniffer.write_all(b"more").await.unwrap();
        let mut got = [0u8; 4];
        client_rd.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"more");
    }

    #[tokio::test]
    async fn sequence_is_monotonic_and_uuid_stable() {
        let (_client, server) = tokio::io::duplex(64);
        let sniffer = wrap(server);
        let uuid = sniffer.uuid();
        assert_eq!(sniffer.sequence(), 1);
        assert_eq!(sniffer.sequence(), 2);
        assert_eq!(sniffer.sequence(), 3);
        assert_eq!(sniffer.uuid(), uuid);
    }
}

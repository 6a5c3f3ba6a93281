//! Length-framed TCP transport for peer-to-peer connections.
//!
//! Every connection, inbound or outbound, goes through the same pipeline:
//! handshake, then an [`OnPeer`] callback to register the peer with whatever
//! owns this transport, then a read loop that decodes frames with a
//! [`Decoder`] and funnels them into a single bounded channel. A decoded
//! frame is either a complete RPC payload or a bare "stream follows" marker;
//! in the latter case the read loop parks itself until the consumer of the
//! channel calls [`TcpPeer::release_stream`], because the bytes that follow
//! belong to the consumer, not to the decoder.

#![warn(missing_docs)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Leading byte of a framed message: a 4-byte big-endian length prefix follows.
pub const FRAME_MESSAGE: u8 = 0x1;
/// Leading byte announcing that raw stream bytes follow, owned by whoever
/// consumes the channel rather than by the decoder.
pub const FRAME_STREAM: u8 = 0x2;

/// Capacity of the channel shared by every connection's read loop and
/// whichever task calls [`Transport::consume`].
pub const RPC_CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// A frame opened with an unrecognized leading byte.
    #[error("unknown frame tag {0:#x}")]
    UnknownFrameTag(u8),
    /// [`Transport::consume`] was called a second time.
    #[error("transport's rpc channel has already been consumed")]
    AlreadyConsumed,
}

/// One decoded unit of work delivered to the channel returned by
/// [`Transport::consume`].
#[derive(Debug, Clone)]
pub struct Rpc {
    /// Address of the peer the frame arrived from.
    pub from: SocketAddr,
    /// Decoded payload. Empty when `stream` is true; the bytes that follow
    /// a stream marker are read directly off the peer by the consumer, not
    /// delivered through this struct.
    pub payload: Vec<u8>,
    /// True if this frame announced that raw bytes follow on the connection.
    pub stream: bool,
}

/// A single decoded frame, before it is addressed to a peer.
#[derive(Debug)]
pub struct DecodedFrame {
    /// Decoded payload, or empty for a stream marker.
    pub payload: Vec<u8>,
    /// True if this frame announced that raw bytes follow.
    pub stream: bool,
}

/// Reads one frame's worth of bytes off a connection.
///
/// Implementations own the wire format; the transport only knows how to
/// route whatever comes back.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decode exactly one frame from `reader`.
    async fn decode(&self, reader: &mut OwnedReadHalf) -> Result<DecodedFrame, Error>;
}

/// The default wire format: [`FRAME_MESSAGE`] followed by a 4-byte
/// big-endian length and that many payload bytes, or a bare [`FRAME_STREAM`]
/// byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

#[async_trait]
impl Decoder for DefaultDecoder {
    async fn decode(&self, reader: &mut OwnedReadHalf) -> Result<DecodedFrame, Error> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag).await?;
        match tag[0] {
            FRAME_MESSAGE => {
                let mut len_buf = [0u8; 4];
                reader.read_exact(&mut len_buf).await?;
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Ok(DecodedFrame { payload, stream: false })
            }
            FRAME_STREAM => Ok(DecodedFrame { payload: Vec::new(), stream: true }),
            other => Err(Error::UnknownFrameTag(other)),
        }
    }
}

/// Negotiates whatever must happen before a connection is usable.
///
/// The default [`NopHandshake`] accepts every connection unconditionally,
/// matching the original system's development-mode behavior; a production
/// deployment would substitute a trait object that verifies node identity.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Run the handshake. An error here drops the connection before
    /// [`OnPeer`] is ever invoked.
    async fn handshake(&self, peer: &TcpPeer) -> Result<(), Error>;
}

/// A handshake that always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &TcpPeer) -> Result<(), Error> {
        Ok(())
    }
}

/// Notified once a peer has handshaked successfully, with the chance to
/// reject it before it is handed to the read loop.
#[async_trait]
pub trait OnPeer: Send + Sync {
    /// Called once per new connection, after [`Handshake::handshake`]
    /// succeeds. Returning an error closes the connection immediately.
    async fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), Error>;
}

/// One TCP connection to a remote node.
///
/// The read and write halves are each behind their own [`AsyncMutex`] so
/// that both the connection's read loop and whatever is consuming a stream
/// handoff can take turns operating on the same socket without the
/// transport needing to arbitrate between them.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    outbound: bool,
    write_half: AsyncMutex<OwnedWriteHalf>,
    read_half: AsyncMutex<OwnedReadHalf>,
    stream_notify: Notify,
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

impl TcpPeer {
    /// Address of the remote end of this connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address of the local end of this connection, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// True if this node dialed the connection; false if it was accepted.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write `buf` to the peer as a single atomic send.
    pub async fn send(&self, buf: &[u8]) -> Result<(), Error> {
        let mut guard = self.write_half.lock().await;
        guard.write_all(buf).await?;
        Ok(())
    }

    /// Lock the read half and read exactly `buf.len()` raw bytes, bypassing
    /// the decoder. Only meaningful after a [`FRAME_STREAM`] frame has been
    /// delivered for this peer and before [`TcpPeer::release_stream`] is
    /// called; calling it at any other time races the connection's own read
    /// loop for control of the socket.
    pub async fn read_stream_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut guard = self.read_half.lock().await;
        guard.read_exact(buf).await?;
        Ok(())
    }

    /// Release a peer parked in [`Transport`]'s read loop after a stream
    /// handoff. Safe to call before the read loop has actually parked:
    /// [`Notify::notify_one`] buffers a single permit for the next
    /// `notified().await`, so there is no lost-wakeup window.
    pub fn release_stream(&self) {
        self.stream_notify.notify_one();
    }
}

/// A length-framed TCP transport.
///
/// Owns the listener and the set of in-flight connection tasks; does not
/// own a peer registry itself, since that is application state that
/// belongs to whoever consumes [`Transport::consume`].
pub struct Transport {
    listen_addr: String,
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    on_peer: Option<Arc<dyn OnPeer>>,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: AsyncMutex<Option<mpsc::Receiver<Rpc>>>,
    cancel: CancellationToken,
    listener_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Build a transport bound to `listen_addr` (not yet listening; call
    /// [`Transport::listen_and_accept`] to start accepting connections).
    pub fn new(
        listen_addr: impl Into<String>,
        handshake: Arc<dyn Handshake>,
        decoder: Arc<dyn Decoder>,
        on_peer: Option<Arc<dyn OnPeer>>,
    ) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        Self {
            listen_addr: listen_addr.into(),
            handshake,
            decoder,
            on_peer,
            rpc_tx,
            rpc_rx: AsyncMutex::new(Some(rpc_rx)),
            cancel: CancellationToken::new(),
            listener_task: AsyncMutex::new(None),
        }
    }

    /// Address this transport is configured to listen on.
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Bind and spawn the accept loop. Each accepted connection is handled
    /// on its own task; the accept loop itself exits once [`Transport::close`]
    /// is called.
    #[instrument(skip(self), fields(listen_addr = %self.listen_addr))]
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for connections");

        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote_addr)) => {
                                let this = Arc::clone(&this);
                                tokio::spawn(async move {
                                    this.handle_connection(stream, remote_addr, false).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });
        *self.listener_task.lock().await = Some(handle);
        Ok(local_addr)
    }

    /// Dial `addr` and run the same connection pipeline as an accepted peer.
    #[instrument(skip(self))]
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), Error> {
        let stream = TcpStream::connect(addr).await?;
        let remote_addr = stream.peer_addr()?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.handle_connection(stream, remote_addr, true).await;
        });
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr, outbound: bool) {
        let local_addr = stream.local_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(TcpPeer {
            remote_addr,
            local_addr,
            outbound,
            write_half: AsyncMutex::new(write_half),
            read_half: AsyncMutex::new(read_half),
            stream_notify: Notify::new(),
        });

        if let Err(e) = self.handshake.handshake(&peer).await {
            warn!(%remote_addr, error = %e, "handshake failed, dropping connection");
            return;
        }

        if let Some(on_peer) = &self.on_peer {
            if let Err(e) = on_peer.on_peer(Arc::clone(&peer)).await {
                warn!(%remote_addr, error = %e, "on_peer callback rejected connection");
                return;
            }
        }

        info!(%remote_addr, outbound, "peer connected");
        self.read_loop(&peer).await;
        info!(%remote_addr, "peer connection closed");
    }

    async fn read_loop(&self, peer: &Arc<TcpPeer>) {
        loop {
            let frame = {
                let mut guard = peer.read_half.lock().await;
                self.decoder.decode(&mut guard).await
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(remote_addr = %peer.remote_addr(), error = %e, "decode failed, closing connection");
                    return;
                }
            };

            let stream = frame.stream;
            let rpc = Rpc { from: peer.remote_addr(), payload: frame.payload, stream };
            if self.rpc_tx.send(rpc).await.is_err() {
                warn!("rpc channel closed, no consumer left; closing connection");
                return;
            }

            if stream {
                peer.stream_notify.notified().await;
            }
        }
    }

    /// Take ownership of the channel every connection's read loop feeds.
    /// May only be called once; subsequent calls return
    /// [`Error::AlreadyConsumed`].
    pub async fn consume(&self) -> Result<mpsc::Receiver<Rpc>, Error> {
        self.rpc_rx.lock().await.take().ok_or(Error::AlreadyConsumed)
    }

    /// Stop accepting new connections and wait for the accept loop to exit.
    /// Already-established connections are not forcibly closed; they wind
    /// down on their own once their peers disconnect.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpStream as RawTcpStream;

    #[tokio::test]
    async fn accepts_and_decodes_a_single_message_frame() {
        let transport = Arc::new(Transport::new(
            "127.0.0.1:0",
            Arc::new(NopHandshake),
            Arc::new(DefaultDecoder),
            None,
        ));
        let addr = transport.listen_and_accept().await.unwrap();
        let mut rx = transport.consume().await.unwrap();

        let mut client = RawTcpStream::connect(addr).await.unwrap();
        client.write_u8(FRAME_MESSAGE).await.unwrap();
        client.write_u32(5).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let rpc = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(!rpc.stream);
        assert_eq!(rpc.payload, b"hello");

        transport.close().await;
    }

    #[tokio::test]
    async fn stream_frame_parks_read_loop_until_released() {
        let transport = Arc::new(Transport::new(
            "127.0.0.1:0",
            Arc::new(NopHandshake),
            Arc::new(DefaultDecoder),
            None,
        ));
        let addr = transport.listen_and_accept().await.unwrap();
        let mut rx = transport.consume().await.unwrap();

        let mut client = RawTcpStream::connect(addr).await.unwrap();
        client.write_u8(FRAME_MESSAGE).await.unwrap();
        client.write_u32(5).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        client.write_u8(FRAME_STREAM).await.unwrap();
        client.write_u64_le(3).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.flush().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(!first.stream);

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(second.stream);

        // A third frame sent now must not be decoded until the stream is released:
        // the read loop is parked inside `notified().await`.
        let recv_more = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(recv_more.is_err(), "read loop kept decoding past an unreleased stream marker");

        transport.close().await;
    }

    struct RecordingOnPeer {
        seen: Arc<AsyncMutex<Vec<SocketAddr>>>,
    }

    #[async_trait]
    impl OnPeer for RecordingOnPeer {
        async fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), Error> {
            self.seen.lock().await.push(peer.remote_addr());
            Ok(())
        }
    }

    #[tokio::test]
    async fn on_peer_runs_for_both_inbound_and_outbound_connections() {
        let seen_a = Arc::new(AsyncMutex::new(Vec::new()));
        let a = Arc::new(Transport::new(
            "127.0.0.1:0",
            Arc::new(NopHandshake),
            Arc::new(DefaultDecoder),
            Some(Arc::new(RecordingOnPeer { seen: Arc::clone(&seen_a) })),
        ));
        let addr_a = a.listen_and_accept().await.unwrap();
        let _rx_a = a.consume().await.unwrap();

        let seen_b = Arc::new(AsyncMutex::new(Vec::new()));
        let b = Arc::new(Transport::new(
            "127.0.0.1:0",
            Arc::new(NopHandshake),
            Arc::new(DefaultDecoder),
            Some(Arc::new(RecordingOnPeer { seen: Arc::clone(&seen_b) })),
        ));
        let _addr_b = b.listen_and_accept().await.unwrap();
        let _rx_b = b.consume().await.unwrap();

        b.dial(&addr_a.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(seen_a.lock().await.len(), 1);
        assert_eq!(seen_b.lock().await.len(), 1);

        a.close().await;
        b.close().await;
    }
}

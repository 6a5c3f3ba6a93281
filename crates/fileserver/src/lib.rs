//! Replicating file server: owns a local [`store::Store`], a [`transport::Transport`],
//! and the peer bookkeeping needed to broadcast writes and fetch missing
//! objects from whichever peers already have them.
//!
//! `Store` and `Get` are the two operations a caller sees; underneath, both
//! ride the same wire protocol as everything else on the connection: a
//! control message (what object, how big) followed by a stream handoff
//! (the ciphertext itself). The control message and its stream arrive as two
//! separate frames, so the server tracks, per peer, which `StoreFile`
//! announcement is still waiting for its bytes.

#![warn(missing_docs)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use transport::{DefaultDecoder, NopHandshake, OnPeer, Rpc, TcpPeer, Transport};

/// How long `Store` waits, after announcing an object to every peer, before
/// starting to stream its ciphertext. Gives peers time to see the
/// announcement and prepare to receive before the bytes arrive.
const PRE_STREAM_DELAY: Duration = Duration::from_millis(500);

/// How long `Get` waits for a peer to respond before giving up.
const GET_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `Get` keeps draining already-queued responses from additional
/// peers once the first response has arrived, before returning.
const GET_DRAIN_GRACE: Duration = Duration::from_millis(50);

/// Errors surfaced by [`FileServer`].
#[derive(Debug, Error)]
pub enum Error {
    /// Local store failure.
    #[error("store: {0}")]
    Store(#[from] store::Error),
    /// Streaming cipher failure.
    #[error("crypto: {0}")]
    Crypto(#[from] crypto::Error),
    /// Transport-level failure.
    #[error("transport: {0}")]
    Transport(#[from] transport::Error),
    /// Control message failed to encode or decode.
    #[error("control message codec: {0}")]
    Codec(#[from] bincode::Error),
    /// Plain I/O failure (reading a source, a dial address, and so on).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// No peer responded to a `GetFile` broadcast within [`GET_TIMEOUT`].
    #[error("get timed out waiting for a peer to respond")]
    Timeout,
    /// A background task panicked or was cancelled before completing.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Tagged control messages exchanged before a stream handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announces that `size` IV-inclusive ciphertext bytes for `key_id` are
    /// about to be streamed on this connection.
    StoreFile {
        /// Hex-encoded node ID of the object's owner.
        owner_id: String,
        /// `crypto::hash_key` of the original key.
        key_id: String,
        /// Ciphertext length, including the 16-byte IV.
        size: u64,
    },
    /// Requests that, if the recipient holds `key_id` for `owner_id`, it
    /// stream it back.
    GetFile {
        /// Hex-encoded node ID of the object's owner.
        owner_id: String,
        /// `crypto::hash_key` of the original key.
        key_id: String,
    },
}

#[derive(Debug, Clone)]
struct PendingStore {
    owner_id: String,
    key_id: String,
    size: u64,
}

/// Construction options for [`FileServer::new`].
pub struct FileServerOpts {
    /// This node's own hex-encoded identifier.
    pub node_id: String,
    /// Shared AES-256 key used to encrypt everything this node stores and
    /// decrypt everything it ingests.
    pub enc_key: [u8; crypto::KEY_SIZE],
    /// Local object store.
    pub store: store::Store,
    /// Address to listen on, e.g. `"0.0.0.0:3000"`.
    pub listen_addr: String,
    /// Peers to dial on startup.
    pub bootstrap_nodes: Vec<String>,
}

/// A running (or not-yet-started) replicating file server.
pub struct FileServer {
    node_id: String,
    enc_key: [u8; crypto::KEY_SIZE],
    store: Arc<store::Store>,
    transport: Arc<Transport>,
    peers: DashMap<SocketAddr, Arc<TcpPeer>>,
    pending_store: DashMap<SocketAddr, PendingStore>,
    pending_get: AsyncMutex<Option<mpsc::Sender<Vec<u8>>>>,
    bootstrap_nodes: Vec<String>,
    quit: CancellationToken,
}

struct OnPeerBridge {
    inner: Weak<FileServer>,
}

#[async_trait]
impl OnPeer for OnPeerBridge {
    async fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), transport::Error> {
        if let Some(fs) = self.inner.upgrade() {
            fs.peers.insert(peer.remote_addr(), peer);
        }
        Ok(())
    }
}

impl FileServer {
    /// Build a file server. Does not start listening or dialing bootstrap
    /// peers; call [`FileServer::start`] for that.
    pub fn new(opts: FileServerOpts) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_peer: Arc<dyn OnPeer> = Arc::new(OnPeerBridge { inner: weak.clone() });
            let transport = Arc::new(Transport::new(
                opts.listen_addr,
                Arc::new(NopHandshake),
                Arc::new(DefaultDecoder),
                Some(on_peer),
            ));
            Self {
                node_id: opts.node_id,
                enc_key: opts.enc_key,
                store: Arc::new(opts.store),
                transport,
                peers: DashMap::new(),
                pending_store: DashMap::new(),
                pending_get: AsyncMutex::new(None),
                bootstrap_nodes: opts.bootstrap_nodes,
                quit: CancellationToken::new(),
            }
        })
    }

    /// This node's own identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Start listening, dial every bootstrap peer, and spawn the main loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, Error> {
        let local_addr = self.transport.listen_and_accept().await?;
        self.bootstrap().await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run().await;
        });
        Ok(local_addr)
    }

    /// Signal the main loop to stop and the transport to stop accepting.
    pub fn stop(&self) {
        self.quit.cancel();
    }

    async fn bootstrap(self: &Arc<Self>) {
        for addr in self.bootstrap_nodes.clone() {
            if addr.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.dial(&addr).await {
                    warn!(%addr, error = %e, "failed to dial bootstrap peer");
                }
            });
        }
    }

    async fn run(self: Arc<Self>) {
        let mut rpc_rx = match self.transport.consume().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "file server main loop could not take transport's rpc channel");
                return;
            }
        };

        loop {
            tokio::select! {
                () = self.quit.cancelled() => {
                    info!("file server stopping");
                    break;
                }
                maybe_rpc = rpc_rx.recv() => {
                    match maybe_rpc {
                        Some(rpc) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.handle_rpc(rpc).await; });
                        }
                        None => break,
                    }
                }
            }
        }
        self.transport.close().await;
    }

    async fn handle_rpc(self: Arc<Self>, rpc: Rpc) {
        if rpc.stream {
            if let Err(e) = self.handle_stream_frame(rpc.from).await {
                warn!(from = %rpc.from, error = %e, "failed to ingest streamed frame");
            }
            return;
        }

        match bincode::deserialize::<ControlMessage>(&rpc.payload) {
            Ok(ControlMessage::StoreFile { owner_id, key_id, size }) => {
                self.pending_store.insert(rpc.from, PendingStore { owner_id, key_id, size });
            }
            Ok(ControlMessage::GetFile { owner_id, key_id }) => {
                if let Err(e) = self.handle_get_file_request(rpc.from, owner_id, key_id).await {
                    warn!(from = %rpc.from, error = %e, "failed to serve get request");
                }
            }
            Err(e) => {
                warn!(from = %rpc.from, error = %e, "failed to decode control message");
            }
        }
    }

    async fn handle_stream_frame(&self, from: SocketAddr) -> Result<(), Error> {
        let peer = match self.peers.get(&from).map(|p| Arc::clone(&p)) {
            Some(peer) => peer,
            None => {
                warn!(%from, "stream frame from an unregistered peer");
                return Ok(());
            }
        };

        if let Some((_, pending)) = self.pending_store.remove(&from) {
            let mut ciphertext = vec![0u8; pending.size as usize];
            peer.read_stream_exact(&mut ciphertext).await?;
            peer.release_stream();

            let store = Arc::clone(&self.store);
            let owner_id = pending.owner_id;
            let key_id = pending.key_id;
            tokio::task::spawn_blocking(move || store.write(&owner_id, &key_id, Cursor::new(ciphertext))).await??;
            return Ok(());
        }

        let mut len_buf = [0u8; 8];
        peer.read_stream_exact(&mut len_buf).await?;
        let size = u64::from_le_bytes(len_buf);
        let mut ciphertext = vec![0u8; size as usize];
        peer.read_stream_exact(&mut ciphertext).await?;
        peer.release_stream();

        let tx = self.pending_get.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(ciphertext).await;
        }
        Ok(())
    }

    async fn handle_get_file_request(&self, from: SocketAddr, owner_id: String, key_id: String) -> Result<(), Error> {
        let store = Arc::clone(&self.store);
        let owner_id_check = owner_id.clone();
        let key_id_check = key_id.clone();
        let has = tokio::task::spawn_blocking(move || store.has(&owner_id_check, &key_id_check)).await?;
        if !has {
            return Ok(());
        }

        let peer = match self.peers.get(&from).map(|p| Arc::clone(&p)) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let store = Arc::clone(&self.store);
        let (size, mut file) = tokio::task::spawn_blocking(move || store.read(&owner_id, &key_id)).await??;
        let mut ciphertext = Vec::with_capacity(size as usize);
        std::io::Read::read_to_end(&mut file, &mut ciphertext)?;

        let mut frame = Vec::with_capacity(1 + 8 + ciphertext.len());
        frame.push(transport::FRAME_STREAM);
        frame.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());
        frame.extend_from_slice(&ciphertext);
        peer.send(&frame).await?;
        Ok(())
    }

    async fn broadcast(&self, frame: &[u8]) {
        for entry in self.peers.iter() {
            if let Err(e) = entry.value().send(frame).await {
                warn!(remote_addr = %entry.key(), error = %e, "failed to send to peer");
            }
        }
    }

    /// Store `reader`'s full contents under `key`, writing it to the local
    /// object store and broadcasting it, encrypted, to every connected peer.
    /// Returns the plaintext byte count written locally.
    #[instrument(skip(self, reader), fields(node_id = %self.node_id))]
    pub async fn store(&self, key: &str, mut reader: impl std::io::Read) -> Result<u64, Error> {
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext)?;

        let store = Arc::clone(&self.store);
        let node_id = self.node_id.clone();
        let key_owned = key.to_string();
        let plaintext_for_store = plaintext.clone();
        let n = tokio::task::spawn_blocking(move || store.write(&node_id, &key_owned, Cursor::new(plaintext_for_store)))
            .await??;

        let key_id = crypto::hash_key(key);
        let enc_key = self.enc_key;
        let plaintext_for_cipher = plaintext;
        let ciphertext = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, crypto::Error> {
            let mut ciphertext = Vec::new();
            crypto::copy_encrypt(&enc_key, plaintext_for_cipher.as_slice(), &mut ciphertext)?;
            Ok(ciphertext)
        })
        .await??;

        let announce = ControlMessage::StoreFile {
            owner_id: self.node_id.clone(),
            key_id,
            size: ciphertext.len() as u64,
        };
        let encoded = bincode::serialize(&announce)?;
        let mut message_frame = Vec::with_capacity(1 + 4 + encoded.len());
        message_frame.push(transport::FRAME_MESSAGE);
        message_frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        message_frame.extend_from_slice(&encoded);
        self.broadcast(&message_frame).await;

        tokio::time::sleep(PRE_STREAM_DELAY).await;

        let mut stream_frame = Vec::with_capacity(1 + ciphertext.len());
        stream_frame.push(transport::FRAME_STREAM);
        stream_frame.extend_from_slice(&ciphertext);
        self.broadcast(&stream_frame).await;

        Ok(n)
    }

    /// Fetch `key`: serve it from the local store if present, otherwise
    /// broadcast a `GetFile` request and ingest whatever peers respond with
    /// before opening the (now locally populated) object.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn get(&self, key: &str) -> Result<(u64, std::fs::File), Error> {
        let store = Arc::clone(&self.store);
        let node_id = self.node_id.clone();
        let key_owned = key.to_string();
        let has = tokio::task::spawn_blocking(move || store.has(&node_id, &key_owned)).await?;
        if has {
            let store = Arc::clone(&self.store);
            let node_id = self.node_id.clone();
            let key_owned = key.to_string();
            return Ok(tokio::task::spawn_blocking(move || store.read(&node_id, &key_owned)).await??);
        }

        let key_id = crypto::hash_key(key);
        let request = ControlMessage::GetFile { owner_id: self.node_id.clone(), key_id: key_id.clone() };
        let encoded = bincode::serialize(&request)?;
        let mut frame = Vec::with_capacity(1 + 4 + encoded.len());
        frame.push(transport::FRAME_MESSAGE);
        frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        frame.extend_from_slice(&encoded);

        let (tx, mut rx) = mpsc::channel(self.peers.len().max(1));
        *self.pending_get.lock().await = Some(tx);
        self.broadcast(&frame).await;

        let ingest = |ciphertext: Vec<u8>, store: Arc<store::Store>, enc_key: [u8; crypto::KEY_SIZE], node_id: String, key: String| async move {
            tokio::task::spawn_blocking(move || store.write_decrypt(&enc_key, &node_id, &key, Cursor::new(ciphertext))).await
        };

        let result = match tokio::time::timeout(GET_TIMEOUT, rx.recv()).await {
            Ok(Some(first)) => {
                ingest(first, Arc::clone(&self.store), self.enc_key, self.node_id.clone(), key.to_string()).await??;
                loop {
                    match tokio::time::timeout(GET_DRAIN_GRACE, rx.recv()).await {
                        Ok(Some(more)) => {
                            let _ = ingest(more, Arc::clone(&self.store), self.enc_key, self.node_id.clone(), key.to_string()).await;
                        }
                        _ => break,
                    }
                }
                Ok(())
            }
            Ok(None) => Err(Error::Timeout),
            Err(_) => Err(Error::Timeout),
        };

        *self.pending_get.lock().await = None;
        result?;

        let store = Arc::clone(&self.store);
        let node_id = self.node_id.clone();
        let key_owned = key.to_string();
        Ok(tokio::task::spawn_blocking(move || store.read(&node_id, &key_owned)).await??)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn opts(listen_addr: &str, bootstrap: Vec<String>) -> (tempfile::TempDir, FileServerOpts) {
        let dir = tempfile::tempdir().unwrap();
        let store = store::Store::new(dir.path()).unwrap();
        let opts = FileServerOpts {
            node_id: crypto::generate_id(),
            enc_key: crypto::new_encryption_key(),
            store,
            listen_addr: listen_addr.to_string(),
            bootstrap_nodes: bootstrap,
        };
        (dir, opts)
    }

    #[tokio::test]
    async fn store_then_get_round_trips_locally() {
        let (_dir, opts) = opts("127.0.0.1:0", vec![]);
        let fs = FileServer::new(opts);
        fs.start().await.unwrap();

        fs.store("greeting", "hello, world".as_bytes()).await.unwrap();
        let (size, mut file) = fs.get("greeting").await.unwrap();
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(size as usize, got.len());
        assert_eq!(got, b"hello, world");

        fs.stop();
    }

    #[tokio::test]
    async fn get_on_missing_key_with_no_peers_times_out() {
        let (_dir, opts) = opts("127.0.0.1:0", vec![]);
        let fs = FileServer::new(opts);
        fs.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), fs.get("nope")).await.unwrap();
        assert!(matches!(result, Err(Error::Timeout)));

        fs.stop();
    }

    #[tokio::test]
    async fn two_nodes_share_an_encryption_key_and_replicate() {
        let shared_key = crypto::new_encryption_key();

        let (_dir_a, mut opts_a) = opts("127.0.0.1:0", vec![]);
        opts_a.enc_key = shared_key;
        let fs_a = FileServer::new(opts_a);
        let addr_a = fs_a.start().await.unwrap();

        let (_dir_b, mut opts_b) = opts("127.0.0.1:0", vec![addr_a.to_string()]);
        opts_b.enc_key = shared_key;
        let fs_b = FileServer::new(opts_b);
        fs_b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fs_a.peer_count(), 1);
        assert_eq!(fs_b.peer_count(), 1);

        let payload = b"peer to peer payload";
        fs_b.store("shared-key", payload.as_slice()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;

        // B's write replicated to A under B's owner id, as ciphertext (IV + payload).
        let key_id = crypto::hash_key("shared-key");
        let (replica_size, _) = fs_a.store.read(fs_b.node_id(), &key_id).unwrap();
        assert_eq!(replica_size as usize, payload.len() + crypto::IV_SIZE);

        // B deletes its local copy, then must recover it from A via `get`.
        fs_b.store.delete(fs_b.node_id(), "shared-key").unwrap();
        assert!(!fs_b.store.has(fs_b.node_id(), "shared-key"));

        let (_size, mut file) = fs_b.get("shared-key").await.unwrap();
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);

        fs_a.stop();
        fs_b.stop();
    }
}

//! Relay node: server to its source, client to its destination.
//!
//! For every accepted connection the node runs the server side of the TPDP
//! handshake, dials the negotiated destination, then pumps bytes in both
//! directions — peeling one cipher layer on the way forward and adding one
//! on the way back. Either pump ending tears the whole session down.

use std::future::Future;
use std::io;
use std::time::Duration;

use ctr::cipher::StreamCipher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::crypto::{self, HopCiphers, HopKey};
use crate::error::{Error, Result};
use crate::index;
use crate::proto;
use crate::types::NodeEndpoint;

/// Chunk size for the forwarding pumps — 16 KiB.
const CHUNK: usize = 16 * 1024;

/// Pause before retrying a failed heartbeat.
const HEARTBEAT_RETRY: Duration = Duration::from_secs(5);

/// A TPDP relay node. Configure with the setters, then `start` the accept
/// loop; each session runs on its own task.
pub struct Node {
    endpoint: NodeEndpoint,
    pool_index: Option<NodeEndpoint>,
    handshake_timeout: Duration,
    log: bool,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Node {
            endpoint: NodeEndpoint::new(host, port),
            pool_index: None,
            handshake_timeout: proto::DEFAULT_HANDSHAKE_TIMEOUT,
            log: true,
        }
    }

    /// Register with a pool index and keep heartbeating to it while serving.
    pub fn set_pool_index(&mut self, host: impl Into<String>, port: u16) {
        self.pool_index = Some(NodeEndpoint::new(host, port));
    }

    /// Toggle per-session info logging.
    pub fn set_log(&mut self, enabled: bool) {
        self.log = enabled;
    }

    /// Override the per-step handshake deadline (default 10 s).
    pub fn set_handshake_timeout(&mut self, deadline: Duration) {
        self.handshake_timeout = deadline;
    }

    /// Bind and serve until the listener fails.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.endpoint.addr()).await?;
        if self.log {
            info!(listen = %self.endpoint, "node listening");
        }

        if let Some(pool_index) = &self.pool_index {
            tokio::spawn(heartbeat_loop(
                pool_index.clone(),
                self.endpoint.clone(),
                self.log,
            ));
        }

        loop {
            let (source, peer) = listener.accept().await?;
            let deadline = self.handshake_timeout;
            let log = self.log;
            tokio::spawn(async move {
                if log {
                    debug!(%peer, "source connected");
                }
                handle_session(source, deadline, log).await;
            });
        }
    }
}

/// Wrap one handshake read in the step deadline and map its failure modes.
async fn step<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::Protocol("unexpected EOF mid-handshake".into()))
        }
        Ok(Err(e)) => Err(Error::Transport(e)),
        Err(_) => Err(Error::Timeout),
    }
}

/// Run one session to completion. Handshake failures are answered with the
/// matching error byte; post-handshake failures just drop both sockets.
async fn handle_session(mut source: TcpStream, deadline: Duration, log: bool) {
    let _ = source.set_nodelay(true);

    let (ciphers, destination, dest_stream) = match serve_handshake(&mut source, deadline).await {
        Ok(session) => session,
        Err(err) => {
            if let Some(byte) = err.wire_byte() {
                let _ = source.write_all(&[byte]).await;
            }
            if log {
                debug!(error = %err, "handshake failed");
            }
            return;
        }
    };

    if log {
        info!(dest = %destination, "session established");
    }
    if let Err(err) = pump(source, dest_stream, ciphers).await {
        debug!(dest = %destination, error = %err, "session ended");
    } else if log {
        debug!(dest = %destination, "session closed");
    }
}

/// Server side of the TPDP handshake, strict ordering. Returns the hop
/// ciphers and the opened destination connection; the caller answers
/// failures on the wire.
async fn serve_handshake(
    source: &mut TcpStream,
    deadline: Duration,
) -> Result<(HopCiphers, NodeEndpoint, TcpStream)> {
    let mut hello = [0u8; proto::HELLO.len()];
    step(deadline, source.read_exact(&mut hello)).await?;
    if &hello != proto::HELLO {
        return Err(Error::Protocol("bad hello".into()));
    }
    step(deadline, source.write_all(proto::HELLO)).await?;

    let (secret, public) = crypto::ephemeral_keypair();
    let mut peer_public = [0u8; proto::PUBLIC_KEY_LEN];
    step(deadline, source.read_exact(&mut peer_public)).await?;
    step(deadline, source.write_all(public.as_bytes())).await?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
    debug!(source_key = %hex::encode(&peer_public[..8]), "key exchange");

    let mut nonce = [0u8; proto::NONCE_LEN];
    step(deadline, source.read_exact(&mut nonce)).await?;
    let mut ciphers = HopKey::derive(&shared, nonce).ciphers();
    step(deadline, source.write_all(&proto::ACK)).await?;

    // From here every byte the source sends is ciphertext, the length
    // prefix included.
    let mut len_bytes = [0u8; 2];
    step(deadline, source.read_exact(&mut len_bytes)).await?;
    ciphers.decrypt(&mut len_bytes);
    let host_len = u16::from_be_bytes(len_bytes) as usize;

    let mut host_bytes = vec![0u8; host_len];
    step(deadline, source.read_exact(&mut host_bytes)).await?;
    ciphers.decrypt(&mut host_bytes);
    let host = String::from_utf8(host_bytes)
        .map_err(|_| Error::Protocol("destination hostname is not UTF-8".into()))?;
    step(deadline, source.write_all(&proto::ACK)).await?;

    let mut port_bytes = [0u8; 2];
    step(deadline, source.read_exact(&mut port_bytes)).await?;
    ciphers.decrypt(&mut port_bytes);
    let destination = NodeEndpoint::new(host, u16::from_be_bytes(port_bytes));

    let dest_stream = match timeout(deadline, TcpStream::connect(destination.addr())).await {
        Ok(Ok(stream)) => stream,
        _ => return Err(Error::DestinationConnection),
    };
    let _ = dest_stream.set_nodelay(true);
    step(deadline, source.write_all(&proto::ETB)).await?;

    Ok((ciphers, destination, dest_stream))
}

/// Bidirectional forwarding.
/// Forward: source → peel one layer → destination.
/// Reverse: destination → add one layer → source.
/// Chunk boundaries carry no meaning; the stream ciphers advance by exactly
/// the bytes processed. Whichever pump finishes first wins the select, the
/// other is cancelled, and dropping both streams closes both sockets.
async fn pump(mut source: TcpStream, mut dest: TcpStream, ciphers: HopCiphers) -> Result<()> {
    let (mut encrypt, mut decrypt) = ciphers.into_parts();
    let (mut source_read, mut source_write) = source.split();
    let (mut dest_read, mut dest_write) = dest.split();

    let forward = async {
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = source_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            decrypt.apply_keystream(&mut buf[..n]);
            dest_write.write_all(&buf[..n]).await?;
        }
        Ok::<_, io::Error>(())
    };

    let reverse = async {
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = dest_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            encrypt.apply_keystream(&mut buf[..n]);
            source_write.write_all(&buf[..n]).await?;
        }
        Ok::<_, io::Error>(())
    };

    tokio::select! {
        res = forward => { res?; }
        res = reverse => { res?; }
    }

    Ok(())
}

/// Register with the pool index at the cadence it requests. Failures are
/// logged and retried; the serving loop never depends on this task.
async fn heartbeat_loop(pool_index: NodeEndpoint, me: NodeEndpoint, log: bool) {
    let mut delay = HEARTBEAT_RETRY;
    loop {
        match index::register(&pool_index, &me).await {
            Ok(requested) => {
                if log {
                    debug!(index = %pool_index, delay = requested, "heartbeat acknowledged");
                }
                delay = Duration::from_secs_f64(requested.max(0.1));
            }
            Err(err) => {
                warn!(index = %pool_index, error = %err, "heartbeat failed");
                delay = HEARTBEAT_RETRY;
            }
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawn a node with a short handshake deadline and wait for its
    /// listener to come up.
    async fn start_node(port: u16, deadline_ms: u64) {
        let mut node = Node::new("127.0.0.1", port);
        node.set_log(false);
        node.set_handshake_timeout(Duration::from_millis(deadline_ms));
        tokio::spawn(async move {
            let _ = node.start().await;
        });
        wait_for_listener(port).await;
    }

    async fn wait_for_listener(port: u16) {
        for _ in 0..80 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("listener on port {} never came up", port);
    }

    async fn read_single_error_byte(stream: &mut TcpStream) -> u8 {
        let mut byte = [0u8; 1];
        timeout(Duration::from_secs(5), stream.read_exact(&mut byte))
            .await
            .expect("node should answer before the test deadline")
            .expect("node should send one error byte before closing");
        // Nothing may follow the error byte.
        let mut rest = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut rest))
            .await
            .expect("node should close before the test deadline")
            .expect("reading the close should succeed");
        assert_eq!(n, 0, "node kept the socket open after the error byte");
        byte[0]
    }

    #[tokio::test]
    async fn test_wrong_case_hello_is_a_protocol_error() {
        start_node(46601, 5_000).await;
        let mut stream = TcpStream::connect(("127.0.0.1", 46601)).await.unwrap();
        stream.write_all(b"HELLO TPDP/0.1\r\n").await.unwrap();
        assert_eq!(read_single_error_byte(&mut stream).await, proto::ERR_PROTOCOL);
    }

    #[tokio::test]
    async fn test_truncated_hello_is_a_protocol_error() {
        start_node(46602, 5_000).await;
        let mut stream = TcpStream::connect(("127.0.0.1", 46602)).await.unwrap();
        stream.write_all(&proto::HELLO[..15]).await.unwrap();
        // Half-close our side so the node sees EOF mid-hello.
        stream.shutdown().await.unwrap();
        let mut byte = [0u8; 1];
        timeout(Duration::from_secs(5), stream.read_exact(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(byte[0], proto::ERR_PROTOCOL);
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        start_node(46603, 200).await;
        let mut stream = TcpStream::connect(("127.0.0.1", 46603)).await.unwrap();
        // Send nothing; the node must give up after its step deadline.
        assert_eq!(read_single_error_byte(&mut stream).await, proto::ERR_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unreachable_destination_reports_error_byte() {
        start_node(46604, 5_000).await;
        let mut stream = TcpStream::connect(("127.0.0.1", 46604)).await.unwrap();

        // Full client side of the handshake, by hand.
        stream.write_all(proto::HELLO).await.unwrap();
        let mut hello = [0u8; 16];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello, proto::HELLO);

        let (secret, public) = crypto::ephemeral_keypair();
        stream.write_all(public.as_bytes()).await.unwrap();
        let mut node_public = [0u8; 32];
        stream.read_exact(&mut node_public).await.unwrap();
        let shared = secret.diffie_hellman(&PublicKey::from(node_public));

        let nonce = crypto::fresh_nonce();
        stream.write_all(&nonce).await.unwrap();
        let mut ack = [0u8; 2];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, proto::ACK);

        // Announce a destination nothing listens on. Port 1 on loopback
        // refuses immediately.
        let mut ciphers = HopKey::derive(&shared, nonce).ciphers();
        let host = b"127.0.0.1";
        let mut announce = Vec::new();
        announce.extend_from_slice(&(host.len() as u16).to_be_bytes());
        announce.extend_from_slice(host);
        ciphers.encrypt(&mut announce);
        stream.write_all(&announce).await.unwrap();
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, proto::ACK);

        let mut port_bytes = 1u16.to_be_bytes().to_vec();
        ciphers.encrypt(&mut port_bytes);
        stream.write_all(&port_bytes).await.unwrap();

        assert_eq!(
            read_single_error_byte(&mut stream).await,
            proto::ERR_DESTINATION
        );
    }
}

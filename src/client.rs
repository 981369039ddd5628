//! Path-building client.
//!
//! The client owns a single TCP connection to the first hop and a stack of
//! per-hop cipher pairs. Outbound bytes are wrapped in every hop's encrypt
//! layer from the last hop inward to the first, so each node on the way can
//! peel exactly one layer; inbound bytes are unwrapped in path order.
//!
//! Path construction is recursive: the key handshake with hop k rides
//! through the layers of hops 1…k-1, so each intermediate node only ever
//! sees a TPDP handshake addressed to "its destination". The newest hop's
//! cipher pair is held pending until that hop has been told where to
//! connect; the final `next_destination` names the real endpoint, which is
//! never handshaken and never sees a TPDP byte.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::crypto::{self, HopCiphers, HopKey};
use crate::error::{Error, Result};
use crate::index;
use crate::proto;
use crate::types::NodeEndpoint;

pub struct Client {
    known_nodes: HashSet<NodeEndpoint>,
    stream: Option<TcpStream>,
    /// Hops whose handshake has fully completed, first hop first.
    path: Vec<HopCiphers>,
    /// Newest hop: key exchange done, destination not yet announced.
    pending: Option<HopCiphers>,
    handshake_timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Client {
            known_nodes: HashSet::new(),
            stream: None,
            path: Vec::new(),
            pending: None,
            handshake_timeout: proto::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the per-step handshake deadline (default 10 s).
    pub fn set_handshake_timeout(&mut self, deadline: Duration) {
        self.handshake_timeout = deadline;
    }

    /// Endpoints learned from pool indexes so far.
    pub fn known_nodes(&self) -> &HashSet<NodeEndpoint> {
        &self.known_nodes
    }

    /// Fetch the listing from a pool index and union it into the local
    /// set. Returns how many previously unknown nodes were added.
    pub async fn sync_nodes_list(&mut self, host: &str, port: u16) -> Result<usize> {
        let pool_index = NodeEndpoint::new(host, port);
        let nodes = index::fetch_nodes(&pool_index).await?;
        let before = self.known_nodes.len();
        self.known_nodes.extend(nodes);
        let added = self.known_nodes.len() - before;
        debug!(index = %pool_index, added, total = self.known_nodes.len(), "synced node list");
        Ok(added)
    }

    /// Forget every known node.
    pub fn purge_nodes_list(&mut self) {
        self.known_nodes.clear();
    }

    /// Open the connection to the first hop and run the key handshake with
    /// it. The hop still needs a destination via `next_destination`.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::PathBuild(
                "already connected; close the current path first".into(),
            ));
        }
        let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        match self.hop_handshake().await {
            Ok(ciphers) => {
                self.pending = Some(ciphers);
                Ok(())
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Extend the path: complete the pending hop's key handshake if one is
    /// outstanding, then announce `(host, port)` as the newest hop's
    /// destination. When the announced endpoint is another node, the next
    /// call will handshake it through the freshly extended tunnel; when it
    /// is the real destination, this call is simply the last one.
    pub async fn next_destination(&mut self, host: &str, port: u16) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::PathBuild("not connected to a first hop".into()));
        }
        match self.extend_path(host, port).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    async fn extend_path(&mut self, host: &str, port: u16) -> Result<()> {
        if self.pending.is_none() {
            let ciphers = self.hop_handshake().await?;
            self.pending = Some(ciphers);
        }

        let host_bytes = host.as_bytes();
        if host_bytes.is_empty() || host_bytes.len() > u16::MAX as usize {
            return Err(Error::PathBuild(format!(
                "destination hostname of {} bytes does not fit the wire",
                host_bytes.len()
            )));
        }

        // Length prefix and hostname, encrypted for the newest hop first,
        // then wrapped in the established layers on the way out.
        let mut announce = Vec::with_capacity(2 + host_bytes.len());
        announce.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
        announce.extend_from_slice(host_bytes);
        self.pending
            .as_mut()
            .expect("pending hop was just ensured")
            .encrypt(&mut announce);
        self.write_layered(&announce).await?;
        self.expect_layered(&proto::ACK, "destination acknowledgement")
            .await?;

        let mut port_bytes = port.to_be_bytes().to_vec();
        self.pending
            .as_mut()
            .expect("pending hop was just ensured")
            .encrypt(&mut port_bytes);
        self.write_layered(&port_bytes).await?;
        self.expect_layered(&proto::ETB, "destination ready signal")
            .await?;

        let ciphers = self
            .pending
            .take()
            .expect("pending hop was just ensured");
        self.path.push(ciphers);
        debug!(dest = %NodeEndpoint::new(host, port), hops = self.path.len(), "path extended");
        Ok(())
    }

    /// Build a chain of `hops` distinct random nodes ending at the real
    /// destination. Fails before opening any socket when too few nodes are
    /// known.
    pub async fn random_path_to_destination(
        &mut self,
        host: &str,
        port: u16,
        hops: usize,
    ) -> Result<()> {
        if hops == 0 {
            return Err(Error::PathBuild("a path needs at least one hop".into()));
        }
        if self.stream.is_some() {
            return Err(Error::PathBuild(
                "already connected; close the current path first".into(),
            ));
        }
        if self.known_nodes.len() < hops {
            return Err(Error::PathBuild(format!(
                "{} hops requested but only {} nodes known",
                hops,
                self.known_nodes.len()
            )));
        }

        let selected: Vec<NodeEndpoint> = {
            let pool: Vec<&NodeEndpoint> = self.known_nodes.iter().collect();
            let mut rng = rand::thread_rng();
            pool.choose_multiple(&mut rng, hops)
                .map(|ep| (*ep).clone())
                .collect()
        };

        self.connect(&selected[0].host, selected[0].port).await?;
        for hop in &selected[1..] {
            self.next_destination(&hop.host, hop.port).await?;
        }
        self.next_destination(host, port).await
    }

    /// Encrypt `data` with every hop's layer, outermost last, and write it
    /// to the first hop.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::PathBuild(
                "path is incomplete: the newest hop has no destination yet".into(),
            ));
        }
        self.write_layered(data).await
    }

    /// Read up to `buffer_size` bytes from the first hop and peel every
    /// layer in path order. An empty buffer means the chain has closed.
    pub async fn receive(&mut self, buffer_size: usize) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::PathBuild("not connected to a first hop".into()))?;
        let mut buf = vec![0u8; buffer_size];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        for hop in self.path.iter_mut() {
            hop.decrypt(&mut buf);
        }
        Ok(buf)
    }

    /// Read exactly `count` decrypted bytes. A connection closing short of
    /// `count` is a transport failure.
    pub async fn receive_exactly(&mut self, count: usize) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::PathBuild("not connected to a first hop".into()))?;
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("chain closed after {} of {} bytes", filled, count),
                )));
            }
            filled += n;
        }
        for hop in self.path.iter_mut() {
            hop.decrypt(&mut buf);
        }
        Ok(buf)
    }

    /// Shut the first-hop socket down; every node downstream observes EOF
    /// and tears its session down in turn.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.path.clear();
        self.pending = None;
    }

    /// Key handshake with the hop at the current end of the tunnel: hello
    /// exchange, X25519, nonce, ACK. Rides through every established
    /// layer; with an empty path this is the plain first-hop handshake.
    async fn hop_handshake(&mut self) -> Result<HopCiphers> {
        self.write_layered(proto::HELLO).await?;
        self.expect_layered(proto::HELLO, "hello reply").await?;

        let (secret, public) = crypto::ephemeral_keypair();
        self.write_layered(public.as_bytes()).await?;
        let mut node_public = [0u8; proto::PUBLIC_KEY_LEN];
        self.read_layered(&mut node_public, "node public key").await?;
        let shared = secret.diffie_hellman(&PublicKey::from(node_public));
        debug!(
            node_key = %hex::encode(&node_public[..8]),
            hops = self.path.len(),
            "hop key exchange complete"
        );

        let nonce = crypto::fresh_nonce();
        self.write_layered(&nonce).await?;
        self.expect_layered(&proto::ACK, "key acknowledgement").await?;

        Ok(HopKey::derive(&shared, nonce).ciphers())
    }

    /// Wrap `data` in the established layers (innermost = last hop) and
    /// write it out, under the same step deadline the reads observe. A peer
    /// that never drains its window must not wedge path construction.
    async fn write_layered(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        for hop in self.path.iter_mut().rev() {
            hop.encrypt(&mut buf);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::PathBuild("not connected to a first hop".into()))?;
        match timeout(self.handshake_timeout, stream.write_all(&buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Transport(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Fill `buf` from the tunnel under the handshake deadline, then peel
    /// the established layers. A single byte followed by EOF is how nodes
    /// report handshake failure, so that byte is mapped to its error kind.
    async fn read_layered(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::PathBuild("not connected to a first hop".into()))?;
            let n = match timeout(self.handshake_timeout, stream.read(&mut buf[filled..])).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::Transport(e)),
                Err(_) => return Err(Error::Timeout),
            };
            if n == 0 {
                for hop in self.path.iter_mut() {
                    hop.decrypt(&mut buf[..filled]);
                }
                if filled == 1 {
                    if let Some(err) = Error::from_wire_byte(buf[0]) {
                        return Err(err);
                    }
                }
                return Err(Error::Protocol(format!(
                    "connection closed while awaiting {}",
                    what
                )));
            }
            filled += n;
        }
        for hop in self.path.iter_mut() {
            hop.decrypt(buf);
        }
        Ok(())
    }

    /// Read a frame that must equal `expected`.
    async fn expect_layered(&mut self, expected: &[u8], what: &str) -> Result<()> {
        let mut buf = vec![0u8; expected.len()];
        self.read_layered(&mut buf, what).await?;
        if buf != expected {
            if let Some(err) = Error::from_wire_byte(buf[0]) {
                return Err(err);
            }
            return Err(Error::Protocol(format!(
                "unexpected bytes while awaiting {}",
                what
            )));
        }
        Ok(())
    }

    /// Abandon the connection and all per-hop state after a failed build.
    fn reset(&mut self) {
        self.stream = None;
        self.path.clear();
        self.pending = None;
    }
}

//! Pool index: a lightweight live-node registry.
//!
//! Wire protocol is JSON lines over TCP — one request object per line, one
//! response line back. Registration doubles as the heartbeat; a background
//! sweep evicts nodes that stayed silent past the deprecation delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::NodeEndpoint;

const DEFAULT_REQUESTED_DELAY: f64 = 30.0;
const DEFAULT_DEPRECATION_DELAY: Duration = Duration::from_secs(90);
const DEFAULT_GC_CYCLE: Duration = Duration::from_secs(30);

type Registry = Arc<Mutex<HashMap<NodeEndpoint, Instant>>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Register { host: String, port: u16 },
    List,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterReply {
    /// Seconds until the index wants the next heartbeat.
    delay: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListReply {
    nodes: Vec<NodeEndpoint>,
}

/// Send one registration/heartbeat for `node` to the index at `pool_index`.
/// Returns the heartbeat delay the index requests, in seconds.
pub async fn register(pool_index: &NodeEndpoint, node: &NodeEndpoint) -> Result<f64> {
    let request = Request::Register {
        host: node.host.clone(),
        port: node.port,
    };
    let reply: RegisterReply = roundtrip(pool_index, &request).await?;
    Ok(reply.delay)
}

/// Fetch the current live-node listing from the index at `pool_index`.
pub async fn fetch_nodes(pool_index: &NodeEndpoint) -> Result<Vec<NodeEndpoint>> {
    let reply: ListReply = roundtrip(pool_index, &Request::List).await?;
    Ok(reply.nodes)
}

async fn roundtrip<R: DeserializeOwned>(pool_index: &NodeEndpoint, request: &Request) -> Result<R> {
    let stream = TcpStream::connect(pool_index.addr()).await?;
    let mut reader = BufReader::new(stream);

    let mut line = serde_json::to_string(request).expect("requests always serialize");
    line.push('\n');
    reader.get_mut().write_all(line.as_bytes()).await?;

    let mut response = String::new();
    if reader.read_line(&mut response).await? == 0 {
        return Err(Error::Protocol("pool index closed without replying".into()));
    }
    serde_json::from_str(response.trim_end())
        .map_err(|e| Error::Protocol(format!("malformed pool index reply: {}", e)))
}

/// The registry service. Configure the delays, then `start` it; the sweep
/// task and every peer connection run on their own tasks, sharing the
/// registry map behind one mutex.
pub struct PoolIndex {
    endpoint: NodeEndpoint,
    requested_delay: f64,
    deprecation_delay: Duration,
    gc_cycle: Duration,
    log: bool,
}

impl PoolIndex {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PoolIndex {
            endpoint: NodeEndpoint::new(host, port),
            requested_delay: DEFAULT_REQUESTED_DELAY,
            deprecation_delay: DEFAULT_DEPRECATION_DELAY,
            gc_cycle: DEFAULT_GC_CYCLE,
            log: true,
        }
    }

    /// Toggle per-request info logging.
    pub fn set_log(&mut self, enabled: bool) {
        self.log = enabled;
    }

    /// Heartbeat cadence handed to registering nodes, in seconds.
    pub fn set_requested_delay(&mut self, seconds: f64) {
        self.requested_delay = seconds;
    }

    /// Maximum silence before an entry is eligible for eviction.
    pub fn set_deprecation_delay(&mut self, seconds: f64) {
        self.deprecation_delay = Duration::from_secs_f64(seconds);
    }

    /// Interval between eviction sweeps.
    pub fn set_garbage_collector_cycle(&mut self, seconds: f64) {
        self.gc_cycle = Duration::from_secs_f64(seconds);
    }

    /// Bind and serve until the listener fails.
    pub async fn start(&self) -> Result<()> {
        if self.gc_cycle > self.deprecation_delay {
            warn!(
                gc_cycle = self.gc_cycle.as_secs_f64(),
                deprecation_delay = self.deprecation_delay.as_secs_f64(),
                "gc cycle exceeds the deprecation delay; eviction will lag"
            );
        }

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let listener = TcpListener::bind(self.endpoint.addr()).await?;
        if self.log {
            info!(listen = %self.endpoint, "pool index listening");
        }

        tokio::spawn(sweep_loop(
            Arc::clone(&registry),
            self.gc_cycle,
            self.deprecation_delay,
            self.log,
        ));

        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = Arc::clone(&registry);
            let requested_delay = self.requested_delay;
            let log = self.log;
            tokio::spawn(async move {
                if let Err(err) = serve_peer(stream, registry, requested_delay, log).await {
                    debug!(%peer, error = %err, "index connection ended");
                }
            });
        }
    }
}

/// Periodically drop every entry whose last heartbeat is older than the
/// deprecation delay.
async fn sweep_loop(registry: Registry, cycle: Duration, deprecation: Duration, log: bool) {
    let mut ticker = tokio::time::interval(cycle);
    loop {
        ticker.tick().await;
        let evicted = {
            let mut nodes = registry.lock().expect("registry mutex poisoned");
            let before = nodes.len();
            nodes.retain(|_, last_seen| last_seen.elapsed() <= deprecation);
            before - nodes.len()
        };
        if evicted > 0 && log {
            info!(evicted, "evicted stale nodes");
        }
    }
}

/// Answer requests from one peer until it disconnects.
async fn serve_peer(
    stream: TcpStream,
    registry: Registry,
    requested_delay: f64,
    log: bool,
) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let request: Request = match serde_json::from_str(line.trim_end()) {
            Ok(request) => request,
            Err(err) => {
                debug!(%peer, error = %err, "dropping peer after malformed request");
                return Ok(());
            }
        };

        let response = match request {
            Request::Register { host, port } => {
                let endpoint = NodeEndpoint::new(host, port);
                registry
                    .lock()
                    .expect("registry mutex poisoned")
                    .insert(endpoint.clone(), Instant::now());
                if log {
                    debug!(node = %endpoint, "heartbeat recorded");
                }
                serde_json::to_string(&RegisterReply {
                    delay: requested_delay,
                })
            }
            Request::List => {
                let nodes: Vec<NodeEndpoint> = registry
                    .lock()
                    .expect("registry mutex poisoned")
                    .keys()
                    .cloned()
                    .collect();
                serde_json::to_string(&ListReply { nodes })
            }
        }
        .expect("replies always serialize");

        let writer = reader.get_mut();
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}

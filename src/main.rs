use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use torpydo::client::Client;
use torpydo::index::PoolIndex;
use torpydo::node::Node;
use torpydo::types::NodeEndpoint;

fn init_logging() {
    let fmt_layer = fmt::layer().with_target(true);

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[derive(Parser)]
#[command(name = "torpydo")]
#[command(about = "Peer-to-peer onion-routing overlay (TPDP/0.1)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a relay node
    Node {
        /// Address to accept TPDP connections on
        #[arg(long, default_value = "127.0.0.1:6001")]
        listen: NodeEndpoint,

        /// Pool index to register with
        #[arg(long)]
        index: Option<NodeEndpoint>,

        /// Per-step handshake deadline in seconds
        #[arg(long, default_value_t = 10.0)]
        handshake_timeout: f64,

        /// Suppress per-session logging
        #[arg(long)]
        quiet: bool,
    },
    /// Run a pool index
    Index {
        /// Address to serve the registry on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: NodeEndpoint,

        /// Heartbeat cadence handed to nodes, in seconds
        #[arg(long, default_value_t = 30.0)]
        requested_delay: f64,

        /// Silence after which a node is evicted, in seconds
        #[arg(long, default_value_t = 90.0)]
        deprecation_delay: f64,

        /// Interval between eviction sweeps, in seconds
        #[arg(long, default_value_t = 30.0)]
        gc_cycle: f64,

        /// Suppress per-request logging
        #[arg(long)]
        quiet: bool,
    },
    /// Fetch and print the live-node listing from a pool index
    Nodes {
        /// Pool index to query
        #[arg(long)]
        index: NodeEndpoint,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Node {
            listen,
            index,
            handshake_timeout,
            quiet,
        } => {
            let mut node = Node::new(listen.host.clone(), listen.port);
            if let Some(pool_index) = index {
                node.set_pool_index(pool_index.host.clone(), pool_index.port);
            }
            node.set_handshake_timeout(Duration::from_secs_f64(handshake_timeout));
            node.set_log(!quiet);
            node.start()
                .await
                .with_context(|| format!("node on {} terminated", listen))?;
        }
        Command::Index {
            listen,
            requested_delay,
            deprecation_delay,
            gc_cycle,
            quiet,
        } => {
            let mut pool_index = PoolIndex::new(listen.host.clone(), listen.port);
            pool_index.set_requested_delay(requested_delay);
            pool_index.set_deprecation_delay(deprecation_delay);
            pool_index.set_garbage_collector_cycle(gc_cycle);
            pool_index.set_log(!quiet);
            pool_index
                .start()
                .await
                .with_context(|| format!("pool index on {} terminated", listen))?;
        }
        Command::Nodes { index } => {
            let mut client = Client::new();
            client
                .sync_nodes_list(&index.host, index.port)
                .await
                .with_context(|| format!("could not list nodes from {}", index))?;
            let mut nodes: Vec<NodeEndpoint> = client.known_nodes().iter().cloned().collect();
            nodes.sort_by_key(|ep| ep.addr());
            for node in nodes {
                println!("{}", node);
            }
        }
    }

    Ok(())
}

//! sdn-node — the Space Data Network node binary.
//!
//! Startup sequence:
//!   1. Load (or generate) the node identity seed
//!   2. Load configuration, apply CLI overrides
//!   3. Start the node: store, trust, auth, tip queue, swarm
//!   4. Advertise the identity CID on the DHT and serve until interrupted

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use sdn_core::ChannelSink;
use sdn_crypto::NodeSigner;
use sdn_node::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "sdn-node",
    version,
    about = "Space Data Network node — signed, schema-validated space-data exchange"
)]
struct Args {
    /// Directory for databases and the identity seed.
    #[arg(long, default_value = "~/.sdn/data")]
    data_dir: PathBuf,

    /// Path to a JSON config file (policies, trust entries, tuning).
    #[arg(long)]
    config: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/4001")]
    listen: String,

    /// Bootstrap peer multiaddresses (comma-separated).
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Topic and protocol-id prefix.
    #[arg(long, default_value = "spacedata")]
    prefix: String,

    /// Treat schema validation leniently (well-formedness only).
    #[arg(long)]
    lenient: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sdn=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let mut config = load_config(args.config.as_deref())?;
    config.data_dir = data_dir.clone();
    config.listen_addrs = vec![args.listen.clone()];
    if !args.bootstrap.is_empty() {
        config.bootstrap_peers = args.bootstrap.clone();
    }
    config.topic_prefix = args.prefix.clone();
    if args.lenient {
        config.strict_validation = false;
    }

    let signer = load_or_generate_identity(&data_dir)?;
    info!(peer = %signer.peer_id(), "node identity loaded");

    // Observer tap: log the event stream.
    let (sink, mut event_rx) = ChannelSink::new(1024);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            tracing::debug!(?event, "node event");
        }
    });

    let node = Node::start(config, signer, sink as Arc<dyn sdn_core::EventSink>).await?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("interrupt received");
    node.shutdown().await;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let Some(path) = path else { return Ok(NodeConfig::default()) };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    serde_json::from_str(&json).context("parsing config JSON")
}

/// Load the 32-byte identity seed from `identity.key`, or generate and
/// persist a fresh one on first run.
fn load_or_generate_identity(data_dir: &Path) -> anyhow::Result<NodeSigner> {
    let key_path = data_dir.join("identity.key");
    if key_path.exists() {
        let hex_text = std::fs::read_to_string(&key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        let bytes = hex::decode(hex_text.trim()).context("identity seed is not hex")?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity seed must be 32 bytes"))?;
        return Ok(NodeSigner::from_seed(seed));
    }
    warn!("no identity found — generating a new one");
    let signer = NodeSigner::generate();
    std::fs::write(&key_path, hex::encode(signer.seed_bytes()))
        .with_context(|| format!("writing {}", key_path.display()))?;
    Ok(signer)
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

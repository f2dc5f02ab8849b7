//! MerkleKV node binary: load configuration, open storage, connect the
//! MQTT transport, and run the node until terminated.
//!
//! Logging verbosity is controlled through `RUST_LOG`, e.g.
//! `RUST_LOG=info merklekv --config config.toml`.

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use merklekv::node::{open_storage, Node};
use merklekv::transport::MqttTransport;
use merklekv::Config;

#[derive(Parser, Debug)]
#[command(name = "merklekv", about = "Distributed key-value store node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured node identity.
    #[arg(long)]
    node_id: Option<String>,

    /// Override the configured storage engine (memory or sled).
    #[arg(long)]
    engine: Option<String>,

    /// Override the configured storage path.
    #[arg(long)]
    storage_path: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    if let Some(storage_path) = args.storage_path {
        config.storage_path = storage_path;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let storage = open_storage(&config)?;
        let transport = Arc::new(MqttTransport::connect(config.client_id(), &config.mqtt));
        info!(
            "starting node {} against mqtt://{}:{}",
            config.node_id, config.mqtt.broker, config.mqtt.port
        );
        let node = Node::new(config, transport, storage).await?;
        node.run().await
    })
}

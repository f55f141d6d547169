//! Node daemon: one kernel, both gateways, and optionally a demo program.

use std::fs;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferry::demo;
use ferry::{Node, NodeConfig};
use kern::{ProgramRegistry, WallClock};

#[derive(Parser, Debug)]
#[command(name = "ferryd", about = "environment migration node")]
struct Args {
    /// JSON node config; flags below override nothing when this is given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for the server gateway.
    #[arg(long, default_value = "127.0.0.1:7007")]
    listen: SocketAddrV4,

    /// Peer this node ships migrating environments to.
    #[arg(long)]
    peer: Option<SocketAddrV4>,

    /// Spawn a demo program after boot: "hello" or "shuttle".
    #[arg(long)]
    demo: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<NodeConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => {
            let peer = match args.peer {
                Some(p) => p,
                // A lone node may still receive leases; ship-outs loop back.
                None => args.listen,
            };
            NodeConfig {
                addr: *args.listen.ip(),
                serv_port: args.listen.port(),
                lease_to: peer,
                gc_time_ms: ferry::GCTIME,
                retries: ferry::RETRIES,
            }
        }
    };

    let mut programs = ProgramRegistry::new();
    demo::register_demos(&mut programs);

    let node = Node::start(cfg, programs, Arc::new(WallClock::new()))?;
    info!("ferryd serving on {}", node.serv_addr());

    if let Some(name) = &args.demo {
        let entry = match name.as_str() {
            "hello" => demo::HELLO,
            "shuttle" => demo::SHUTTLE_PARENT,
            other => bail!("unknown demo {other:?}"),
        };
        let id = node
            .spawn(entry)
            .map_err(|e| anyhow::anyhow!("spawning demo: {e}"))?;
        info!("spawned demo {name} as environment {id}");
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    node.shutdown();
    Ok(())
}

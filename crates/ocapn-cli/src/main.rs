//! `ocapn`: run an OCapN node serving greeter objects, or fetch one from
//! another node.

mod cli;

use anyhow::{anyhow, Context};
use clap::Parser;
use cli::{Cli, Commands};
use ocapn_wire::{eventual, load_config, Location, NodeConfig, OcapnNode, Passable, Promise};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// How long `fetch` waits for each remote answer.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// A local object answering `greet` with "{greeting}, {name}".
fn greeter(greeting: String) -> Passable {
    Passable::from_fn(move |method, args| match method {
        "greet" => {
            let name = args
                .first()
                .and_then(Passable::as_str)
                .unwrap_or("world");
            Ok(Passable::from(format!("{greeting}, {name}").as_str()))
        }
        other => Err(Passable::error(format!("Unknown greeter method: {other}"))),
    })
}

async fn settle(promise: &Promise) -> anyhow::Result<Passable> {
    match tokio::time::timeout(FETCH_TIMEOUT, promise.settled()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Passable::Error(reason))) => Err(anyhow!("broken promise: {reason}")),
        Ok(Err(other)) => Err(anyhow!("broken promise: {other:?}")),
        Err(_) => Err(anyhow!("timed out after {}s", FETCH_TIMEOUT.as_secs())),
    }
}

async fn serve(mut config: NodeConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    let sturdyrefs = config.sturdyrefs.clone();
    let (node, accept) = OcapnNode::start(config)
        .await
        .context("failed to start node")?;

    for (swissnum, greeting) in sturdyrefs {
        node.register_sturdyref(swissnum.as_bytes(), greeter(greeting));
        println!("sturdyref: {} {}", node.location(), swissnum);
    }
    println!("listening: {}", node.location());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down");
    node.shutdown();
    accept.abort();
    Ok(())
}

async fn fetch(mut config: NodeConfig, address: &str, swissnum: &str, name: &str) -> anyhow::Result<()> {
    // A client only needs an ephemeral listener for the peer's replies.
    config.listen_addr.set_port(0);
    let (node, _accept) = OcapnNode::start(config)
        .await
        .context("failed to start node")?;

    let remote = Location::tcp(address);
    let object = node
        .enliven_sturdyref(&remote, swissnum.as_bytes())
        .await
        .with_context(|| format!("failed to reach {remote}"))?;
    let object = settle(&object)
        .await
        .with_context(|| format!("fetch of {swissnum} failed"))?;
    let reply = settle(&eventual::send(&object, "greet", vec![Passable::from(name)]))
        .await
        .context("greet failed")?;

    match reply.as_str() {
        Some(text) => println!("{text}"),
        None => println!("{reply:?}"),
    }
    node.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing(config.log_json);

    match cli.command {
        Commands::Serve { listen } => serve(config, listen).await,
        Commands::Fetch {
            address,
            swissnum,
            name,
        } => fetch(config, &address, &swissnum, &name).await,
    }
}

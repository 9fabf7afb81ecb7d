//! Identifies one peer on the public network and prints what it reports.
//!
//! Usage: `cargo run --example identify_peer -- <peer-id | multiaddr>`

use anyhow::{anyhow, Context, Result};
use libp2p::Multiaddr;
use peer_identify::{
    config::{self, WorkflowConfig, DEFAULT_BOOTSTRAP_PEERS},
    IdentifyWorkflow, PeerManager, ProgressQueue, TransportConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    config::init_tracing()?;

    let input = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: identify_peer <peer-id | multiaddr>"))?;

    let bootstrap_peers = DEFAULT_BOOTSTRAP_PEERS
        .iter()
        .map(|addr| addr.parse::<Multiaddr>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid default bootstrap peer")?;

    let (manager, handle) = PeerManager::new(TransportConfig::new(false), bootstrap_peers)
        .context("failed to initialize peer manager")?;
    let task = tokio::spawn(async move { manager.run().await });

    let workflow = IdentifyWorkflow::new(handle, WorkflowConfig::from_env()?);
    println!("Local peer id: {}", workflow.node().local_peer_id());

    println!("Waiting for peers...");
    let peers = workflow.await_readiness().await?;
    println!("Connected to {peers} peer(s)");

    let mut queue = ProgressQueue::new();
    let sender = queue.sender();
    let run = workflow.run_identify(&input, &sender);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            biased;
            Some(event) = queue.recv() => println!("{event}"),
            result = &mut run => break result,
        }
    };
    while let Some(event) = queue.try_dequeue() {
        println!("{event}");
    }

    match result {
        Ok(record) => println!("{}", record.to_json_pretty()?),
        Err(err) => eprintln!("identify failed: {err}"),
    }

    workflow
        .node()
        .shutdown()
        .await
        .context("failed to request shutdown")?;
    task.await
        .context("failed to join peer manager task")?
        .context("peer manager exited with error")
}

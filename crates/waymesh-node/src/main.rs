//! Waymesh Node binary
//!
//! A peer mesh node sharing avatar presence with other nodes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waymesh_node::{NodeConfig, WaymeshNode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waymesh_node=info,waymesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Waymesh Node");

    let config = NodeConfig::from_env()?;

    // Create and run node. Embedders attach discovery with
    // `WaymeshNode::with_rendezvous`; the stock binary runs without it.
    let node = WaymeshNode::new(config)?;
    node.run().await?;

    Ok(())
}

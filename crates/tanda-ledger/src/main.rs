//! Tanda Node binary
//!
//! Serves the pool ledger over HTTP and the admin socket.

use tanda_ledger::{LedgerConfig, LedgerNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tanda_node=info,tanda_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tanda Node");

    let config = LedgerConfig::from_env()?;

    // Create and run node
    let node = LedgerNode::new(config).await?;
    node.run().await?;

    Ok(())
}

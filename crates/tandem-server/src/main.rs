//! Main entry point for a Tandem node.

use tandem_server::{
    Configuration,
    startup::{self, Node},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let node = Node::start(&configuration)?;
    info!("Tandem node {} ready", node.node_id());

    startup::wait_for_shutdown_signal().await?;
    node.shutdown();
    Ok(())
}

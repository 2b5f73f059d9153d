pub mod crawl;
pub mod fetch;
pub mod init;

use anyhow::{Context, Result};
use sharecrawl_core::CrawlerConfig;
use sharecrawl_smb::{LoopbackConnector, LoopbackServer, SmbClient};
use std::sync::Arc;
use tracing::{info, warn};

/// Build a client over the loopback backend described by `[loopback]`.
pub fn build_client(config: &CrawlerConfig) -> Result<Arc<SmbClient>> {
    let server = LoopbackServer::new(config.loopback.clone()).context("Invalid loopback configuration")?;
    info!(
        shares = config.loopback.shares.len(),
        domain = %server.config().domain_name,
        "Loopback backend ready"
    );
    let connector = Arc::new(LoopbackConnector::new(Arc::new(server)));
    let client = SmbClient::new(config, connector).context("Failed to create SMB client")?;
    Ok(Arc::new(client))
}

/// Cancel every request in flight when Ctrl-C arrives.
pub fn cancel_on_ctrl_c(client: &Arc<SmbClient>) {
    let interrupt = client.interrupt().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling requests in flight");
            interrupt.cancel();
        }
    });
}

use anyhow::{Context, Result, bail};
use sharecrawl_core::{CrawlerConfig, SmbUrl};
use sharecrawl_smb::{CrawlResult, SmbClient};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{build_client, cancel_on_ctrl_c};
use crate::output::Record;

#[derive(Debug, Default)]
struct CrawlSummary {
    documents: usize,
    directories: usize,
    not_found: usize,
    skipped: usize,
    failed: usize,
}

/// Walk the tree under `url`, printing one record per address.
///
/// Requests run on the blocking pool, at most `concurrency` at a time.
pub async fn run(
    config: &CrawlerConfig,
    url: String,
    max_depth: Option<usize>,
    concurrency: usize,
) -> Result<()> {
    let start = SmbUrl::parse(&url)
        .context("Invalid start address")?
        .into_canonical();
    let client = build_client(config)?;
    cancel_on_ctrl_c(&client);

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut seen = HashSet::new();
    let mut tasks = JoinSet::new();
    let mut summary = CrawlSummary::default();

    info!(url = %start, concurrency, "Starting crawl");
    seen.insert(start.to_string());
    spawn_request(&mut tasks, &client, &permits, start.to_string(), 0).await?;

    while let Some(joined) = tasks.join_next().await {
        let (url, depth, outcome) = joined?;
        match outcome {
            Ok(result) => {
                Record::from_result(&result).print()?;
                let children = match result {
                    CrawlResult::Directory { children, .. } => children,
                    CrawlResult::NotFound(_) => {
                        summary.not_found += 1;
                        continue;
                    }
                    CrawlResult::File(_) => {
                        summary.documents += 1;
                        continue;
                    }
                };
                summary.directories += 1;
                if max_depth.is_some_and(|max| depth >= max) {
                    debug!(url = %url, depth, "Depth limit reached");
                    continue;
                }
                for child in children {
                    let child = child.to_string();
                    if seen.insert(child.clone()) {
                        spawn_request(&mut tasks, &client, &permits, child, depth + 1).await?;
                    }
                }
            }
            Err(e) if e.should_skip() => {
                summary.skipped += 1;
                info!(url = %url, error = %e, "Skipping document");
            }
            Err(e) => {
                summary.failed += 1;
                Record::error(&url, &e).print()?;
                if e.is_fatal() || client.interrupt().is_cancelled() {
                    tasks.abort_all();
                    client.close();
                    bail!("Crawl aborted at {}: {}", url, e);
                }
                warn!(url = %url, error = %e, "Request failed");
            }
        }
    }

    client.close();
    info!(
        documents = summary.documents,
        directories = summary.directories,
        not_found = summary.not_found,
        skipped = summary.skipped,
        failed = summary.failed,
        "Crawl finished"
    );
    Ok(())
}

type Outcome = (String, usize, sharecrawl_smb::Result<CrawlResult>);

async fn spawn_request(
    tasks: &mut JoinSet<Outcome>,
    client: &Arc<SmbClient>,
    permits: &Arc<Semaphore>,
    url: String,
    depth: usize,
) -> Result<()> {
    let permit = Arc::clone(permits).acquire_owned().await?;
    let client = Arc::clone(client);
    tasks.spawn_blocking(move || {
        let outcome = client.get(&url);
        drop(permit);
        (url, depth, outcome)
    });
    Ok(())
}

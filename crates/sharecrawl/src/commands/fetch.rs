use anyhow::{Context, Result};
use sharecrawl_core::CrawlerConfig;
use sharecrawl_smb::{CrawlResult, ResponseData, SmbClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{build_client, cancel_on_ctrl_c};
use crate::output::Record;

/// GET each address in turn. A fatal error stops the run; anything else is
/// reported and the next address is tried.
pub async fn get(config: &CrawlerConfig, urls: Vec<String>, save_dir: Option<&Path>) -> Result<()> {
    let client = build_client(config)?;
    cancel_on_ctrl_c(&client);
    if let Some(dir) = save_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    for url in urls {
        let worker = Arc::clone(&client);
        let request = url.clone();
        let outcome = tokio::task::spawn_blocking(move || worker.get(&request)).await?;
        match outcome {
            Ok(CrawlResult::File(data)) => {
                let mut record = Record::from_response(&data);
                if let Some(dir) = save_dir {
                    if let Some(path) = save_body(&data, dir).await? {
                        record = record.with_saved_to(path);
                    }
                }
                record.print()?;
            }
            Ok(result) => Record::from_result(&result).print()?,
            Err(e) => {
                Record::error(&url, &e).print()?;
                if e.is_fatal() || client.interrupt().is_cancelled() {
                    client.close();
                    return Err(e).with_context(|| format!("Request for {} failed", url));
                }
                warn!(url = %url, error = %e, "Request failed");
            }
        }
    }

    client.close();
    Ok(())
}

pub async fn head(config: &CrawlerConfig, urls: Vec<String>) -> Result<()> {
    let client = build_client(config)?;
    cancel_on_ctrl_c(&client);

    for url in urls {
        let worker = Arc::clone(&client);
        let request = url.clone();
        let outcome = tokio::task::spawn_blocking(move || worker.head(&request)).await?;
        match outcome {
            Ok(Some(data)) => Record::from_response(&data).print()?,
            Ok(None) => info!(url = %url, "Directory, nothing to report for HEAD"),
            Err(e) => {
                Record::error(&url, &e).print()?;
                if e.is_fatal() {
                    client.close();
                    return Err(e).with_context(|| format!("Request for {} failed", url));
                }
            }
        }
    }

    client.close();
    Ok(())
}

async fn save_body(data: &ResponseData, dir: &Path) -> Result<Option<PathBuf>> {
    if data.body.is_empty() {
        return Ok(None);
    }
    let name = data
        .url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("index");
    let target = dir.join(name);
    match data.body.file_path() {
        Some(source) => {
            tokio::fs::copy(source, &target).await?;
        }
        None => {
            let bytes = data.body.to_bytes()?;
            tokio::fs::write(&target, &bytes).await?;
        }
    }
    Ok(Some(target))
}

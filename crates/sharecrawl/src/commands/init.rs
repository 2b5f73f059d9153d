use anyhow::{Result, bail};
use sharecrawl_core::{CrawlerConfig, SmbAuthentication};
use std::path::Path;

use crate::config;

pub async fn init_config(config_path: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(config_path).await? {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut default_config = CrawlerConfig::default();
    default_config.credentials.push(SmbAuthentication {
        server: "fileserver".to_string(),
        port: 445,
        domain: "WORKGROUP".to_string(),
        username: "crawler".to_string(),
        password: String::new(),
    });
    config::save_config(config_path, &default_config).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review the credentials and shares before crawling.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        init_config(&path, false).await.unwrap();
        assert!(init_config(&path, false).await.is_err());
        init_config(&path, true).await.unwrap();

        let loaded = config::load_config(&path).await.unwrap();
        assert_eq!(loaded.credentials.len(), 1);
        assert_eq!(loaded.credentials[0].server, "fileserver");
    }
}

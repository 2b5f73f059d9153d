use anyhow::{Context, Result, bail};
use sharecrawl_core::CrawlerConfig;
use std::path::Path;
use tokio::fs;

pub async fn load_config(path: &Path) -> Result<CrawlerConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

    CrawlerConfig::from_toml_str(&contents).context("Failed to parse configuration file")
}

pub async fn save_config(path: &Path, config: &CrawlerConfig) -> Result<()> {
    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = config
        .to_toml_string()
        .context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}

/// Apply `key=value` overrides from the command line.
pub fn apply_overrides(config: &mut CrawlerConfig, options: &[String]) -> Result<()> {
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{}'", option);
        };
        config
            .apply_property(key.trim(), value.trim())
            .with_context(|| format!("Invalid override '{}'", option))?;
    }
    Ok(())
}

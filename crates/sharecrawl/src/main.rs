mod commands;
mod config;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use sharecrawl_core::LogFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sharecrawl")]
#[command(about = "Crawl SMB shares through a pooled, authenticated client", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sharecrawl/config.toml")]
    config: PathBuf,

    /// Override a setting, e.g. `-o pool.max_total=4`
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch documents and print their crawl records as JSON
    Get {
        /// smb:// or smb3:// addresses
        #[arg(required = true)]
        urls: Vec<String>,

        /// Write each fetched body into this directory
        #[arg(short, long)]
        save_dir: Option<PathBuf>,
    },

    /// Fetch metadata only
    Head {
        /// smb:// or smb3:// addresses
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Walk a share from a starting address
    Crawl {
        /// Starting address
        url: String,

        /// Maximum directory depth below the start (unbounded if omitted)
        #[arg(short = 'd', long)]
        max_depth: Option<usize>,

        /// Concurrent requests
        #[arg(short = 'j', long, default_value = "4")]
        concurrency: usize,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        other => Err(format!("unknown log format '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { force } = cli.command {
        return commands::init::init_config(&cli.config, force).await;
    }

    let mut config = config::load_config(&cli.config).await?;
    config::apply_overrides(&mut config, &cli.options)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(file) = cli.log_file {
        config.logging.file = Some(file);
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = logging::init(&config.logging);

    match cli.command {
        Commands::Get { urls, save_dir } => {
            commands::fetch::get(&config, urls, save_dir.as_deref()).await?;
        }
        Commands::Head { urls } => {
            commands::fetch::head(&config, urls).await?;
        }
        Commands::Crawl {
            url,
            max_depth,
            concurrency,
        } => {
            commands::crawl::run(&config, url, max_depth, concurrency).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

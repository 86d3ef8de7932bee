mod config;
mod ethereum;
mod server;

use anyhow::Result;
use clap::{Arg, Command};
use config::Config;
use server::ContractExplorerServer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP stream, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let matches = Command::new("contract-explorer")
        .version("0.1.0")
        .about("MCP server for exploring smart contracts through a bytecode analysis service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("api-url")
                .short('u')
                .long("api-url")
                .value_name("URL")
                .help("Base URL of the analysis service"),
        )
        .arg(
            Arg::new("allow-writes")
                .long("allow-writes")
                .help("Allow state-changing calls")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("settle-delay-ms")
                .long("settle-delay-ms")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .help("Wait after a write before reading state back"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("save-config")
                .long("save-config")
                .help("Write the effective configuration (file, env and flags) to the config file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("generate-config") {
        println!("{}", Config::generate_sample());
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let mut config = Config::load_or_default(config_path).await;

    if let Some(url) = matches.get_one::<String>("api-url") {
        config.service.base_url = url.clone();
    }

    if let Some(delay) = matches.get_one::<u64>("settle-delay-ms") {
        config.orchestrator.settle_delay_ms = *delay;
    }

    if matches.get_flag("allow-writes") {
        config.security.allow_write_operations = true;
    }

    if matches.get_flag("save-config") {
        let path = match config_path {
            Some(path) => std::path::PathBuf::from(path),
            None => Config::default_config_path()?,
        };
        config.save_to_file(&path).await?;
        println!("{}", path.display());
        return Ok(());
    }

    info!("Analysis service: {}", config.service.base_url);
    info!(
        "Write operations allowed: {}",
        config.security.allow_write_operations
    );

    let server = ContractExplorerServer::new(config)?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}

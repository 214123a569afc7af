use anteater_c2::external::{CurlStager, LogNotifier, ShellProbe};
use anteater_c2::{Context, ServerConfig, TcpServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "anteater_c2")]
#[command(about = "Anteater C2 listener - Authorized Security Testing Only")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Host to listen on (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accept encrypted termite agents instead of plain reverse shells
    #[arg(short, long)]
    encrypted: bool,

    /// Fingerprint format template (overrides config)
    #[arg(long)]
    hash_format: Option<String>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.generate_config {
        let config = ServerConfig::default();
        config.save_to_file(&path)?;
        println!("Default configuration written to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(path) = cli.config {
        ServerConfig::from_file(&path)?
    } else {
        ServerConfig::default()
    };

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.encrypted {
        config.encrypted = true;
    }
    if let Some(hash_format) = cli.hash_format {
        config.hash_format = hash_format;
    }

    anteater_c2::logging::init_logging(&config.logging, cli.log_level.as_deref());

    tracing::info!("Anteater C2 starting");
    tracing::info!("Listener: {}:{}", config.host, config.port);
    tracing::info!("Encrypted: {}", config.encrypted);

    let ctx = Context::new(
        Arc::new(LogNotifier),
        Arc::new(ShellProbe::new(config.probe_timeout())),
        Arc::new(CurlStager),
    );

    let server = TcpServer::create(&ctx, &config).await?;
    let run_handle = tokio::spawn(server.clone().run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await;
    run_handle.await??;

    tracing::info!("Anteater C2 shutdown complete");
    Ok(())
}

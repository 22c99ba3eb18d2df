use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use buddy_gateway::{Config, ProviderSet, Recorder, SessionManager, StaticProfiles};

/// Buddy - real-time voice companion backend for smart toys
#[derive(Parser)]
#[command(name = "buddy", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "BUDDY_API_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,buddy_gateway=info",
        1 => "info,buddy_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }

    tracing::info!(
        port = config.api_server.port,
        sample_rate = config.audio.sample_rate,
        frame_ms = config.audio.frame_ms,
        "starting buddy gateway"
    );

    let providers = ProviderSet::from_config(&config.providers);
    let recorder = Recorder::from_config(config.recorder_url.as_deref());
    let profiles = Arc::new(StaticProfiles::new());

    let port = config.api_server.port;
    let manager = Arc::new(SessionManager::new(config, providers, profiles, recorder));
    let _sweeper = SessionManager::spawn_idle_sweeper(&manager);

    buddy_gateway::api::serve(port, manager).await?;
    Ok(())
}

//! mediad CLI - runs the daemon or talks to a running one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediad::daemon::{main_cmd, PROTOCOL_VERSION, VERSION};
use mediad::ipc::{BindPolicy, IpcClient, ObjectId, TypedValue};
use mediad::{Config, Daemon};

#[derive(Parser)]
#[command(name = "mediad")]
#[command(version = VERSION)]
#[command(about = "Media daemon control-protocol server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Start {
        /// Endpoints to listen on (`;`-separated), overrides the config
        #[arg(long)]
        ipc_socket: Option<String>,
        /// all_or_nothing or best_effort
        #[arg(long)]
        bind_policy: Option<BindPolicy>,
    },
    /// Say hello to a running daemon and print its stats
    Ping {
        /// Endpoints to try (`;`-separated), overrides the config
        #[arg(long)]
        ipc_socket: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("MEDIAD_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

async fn start(ipc_socket: Option<String>, bind_policy: Option<BindPolicy>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(policy) = bind_policy {
        config.bind_policy = policy;
    }

    let daemon = Daemon::new(config, ipc_socket)?;
    let count = daemon.start()?;
    println!("mediad v{VERSION} listening on {count} endpoint(s)");
    daemon.run().await
}

async fn ping(ipc_socket: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let spec = ipc_socket.unwrap_or(config.ipc_socket);

    let mut client = IpcClient::connect_spec(&spec)
        .await
        .with_context(|| format!("Could not connect to mediad at '{spec}'"))?;

    let protocol = client
        .call(
            ObjectId::Main,
            main_cmd::HELLO,
            &[
                TypedValue::UInt32(PROTOCOL_VERSION),
                TypedValue::from(config.client_name.as_str()),
            ],
        )
        .await
        .context("hello failed")?;
    let stats = client
        .call(ObjectId::Main, main_cmd::STATS, &[])
        .await
        .context("stats failed")?;

    println!("Connected to {} (protocol {protocol:?})", client.endpoint());
    if let Some(stats) = stats.as_dict() {
        for (key, value) in stats {
            println!("  {key}: {value:?}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            ipc_socket,
            bind_policy,
        } => start(ipc_socket, bind_policy).await?,
        Commands::Ping { ipc_socket } => ping(ipc_socket).await?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

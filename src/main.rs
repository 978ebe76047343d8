use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use switchboard::credentials::{CredentialStore, FileCredentialStore};
use switchboard::logging::{self, LogConfig};
use switchboard::{AppConfig, AppContext, Server};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Chat and remote function dispatch server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./switchboard.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Credential file (defaults to ./database.txt)
    #[arg(long = "credentials", global = true)]
    credentials_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServeArgs),
    /// Register a login directly in the credential file
    AddUser { login: String, password: String },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize, Default)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    listen: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    credentials_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    dispatch_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = match cli.command {
        Commands::Serve(ref args) => ServeArgs {
            listen: args.listen,
            credentials_path: cli.credentials_path.clone(),
            dispatch_timeout_secs: args.dispatch_timeout_secs,
            verbose: args.verbose,
            log_json: args.log_json,
            log_file: args.log_file.clone(),
        },
        _ => ServeArgs {
            credentials_path: cli.credentials_path.clone(),
            ..ServeArgs::default()
        },
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve(_) => run_server(config).await.context("Server failed")?,
        Commands::AddUser { login, password } => add_user(&config, &login, &password).await?,
        Commands::Config => print_config(&config)?,
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    logging::init(LogConfig::from(&config))?;
    tracing::info!(
        credentials = %config.credentials_path.display(),
        "Starting server"
    );

    let server = Arc::new(Server::bind(AppContext::new(config)).await?);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await
}

async fn add_user(config: &AppConfig, login: &str, password: &str) -> Result<()> {
    let store = FileCredentialStore::new(config.credentials_path.clone());
    let added = store
        .check_or_register(login, password, true)
        .await
        .context("Failed to update credential file")?;

    if !added {
        anyhow::bail!("login {login:?} is already taken or invalid");
    }
    println!("Added {login} to {}", store.path().display());
    Ok(())
}

fn print_config(config: &AppConfig) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{content}");
    Ok(())
}

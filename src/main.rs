//! kaitd - the KAIT daemon
//!
//! Runs the ingest surface, pipeline, stores, and background loops as one
//! long-lived process. `status` and `token` subcommands are thin clients
//! for operating a running daemon.

use anyhow::Result;
use clap::{Parser, Subcommand};
use kait::config::KaitConfig;
use kait::errors::KaitError;
use kait::runtime::Runtime;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kaitd", version, about = "Self-improving advisory engine daemon")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Query a running daemon's /status endpoint
    Status,
    /// Print the bearer token path and value, creating it if needed
    Token,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match KaitConfig::load(cli.config.as_deref().map(std::path::Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kaitd: configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config),
        Command::Status => show_status(&config),
        Command::Token => show_token(config),
    };

    if let Err(e) = result {
        match e.downcast_ref::<KaitError>() {
            Some(kait_error) => {
                eprintln!("kaitd: {}", kait_error);
                std::process::exit(kait_error.exit_code());
            }
            None => {
                eprintln!("kaitd: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_daemon(config: KaitConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let daemon = Arc::new(Runtime::new(config)?);

        let shutdown = daemon.shutdown_handle();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::info!("Shutdown signal received");
            let _ = shutdown.send(true);
        });

        daemon.run().await?;
        Ok(())
    })
}

fn show_status(config: &KaitConfig) -> Result<()> {
    let url = format!(
        "http://{}:{}/status",
        config.daemon.bind, config.daemon.port
    );
    let body = reqwest::blocking::get(&url)?.text()?;
    println!("{}", body);
    Ok(())
}

fn show_token(config: KaitConfig) -> Result<()> {
    let paths = config.paths();
    std::fs::create_dir_all(&paths.root)?;
    let token = kait::ingest::resolve_token(&config, &paths)?;
    println!("{}", paths.token_file().display());
    println!("{}", token);
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use etude_core::Server;
use etude_core::logging::{init_logging_json, init_logging_with_level};
use std::path::PathBuf;
use std::process::ExitCode;

mod settings;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Serve a directory over HTTP/1.1 from an epoll reactor and a worker pool")]
#[command(version)]
pub(crate) struct Cli {
    /// Port to listen on
    pub port: u16,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Document root
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Worker threads
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Capacity of the request queue
    #[arg(long, value_name = "N")]
    pub max_requests: Option<usize>,

    /// Seconds between idle-connection sweeps
    #[arg(long, value_name = "SECS")]
    pub timeslot: Option<u64>,

    /// TOML file with server settings; flags override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.json_logs {
        init_logging_json(&cli.log_level);
    } else {
        init_logging_with_level(&cli.log_level);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("etude: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let config = settings::resolve(cli, |key| std::env::var(key).ok())?;
    let port = config.port;
    let server = Server::bind(config).with_context(|| format!("cannot start on port {port}"))?;
    server.run().context("server stopped with an error")
}

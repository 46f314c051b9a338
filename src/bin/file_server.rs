use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use dme_chat::file_service::FileService;

/// The external file server: a trivial single-lock append/read service the
/// chat room's critical section talks to.
#[derive(Parser, Debug)]
#[command(name = "file-server", about = "Append-only chat log server")]
struct Cli {
    /// Interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 50000)]
    port: u16,

    /// Path to the append-only log file.
    #[arg(long, default_value = "chat_log.txt")]
    log_file: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    tracing::info!(%addr, log_file = %cli.log_file, "starting file server");

    let service = Arc::new(FileService::new(cli.log_file));
    let listener = std::net::TcpListener::bind(addr)?;
    service.serve(listener)
}

use std::{io::Write, net::SocketAddr, time::Duration};

use clap::Parser;
use dme_chat::{
    chat::{handle_post, handle_view, parse_repl_line, Cli, ReplCommand},
    lamport_mutex::DmeMutex,
};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    let peers = cli.peer_map();
    if peers.is_empty() {
        warn!("no peers specified; DME will be trivial (lock acquired instantly)");
    }
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], cli.dme_port));
    let mutex = DmeMutex::new(cli.node_id.clone(), peers, bind_addr)?;

    ctrlc::set_handler(|| {
        info!("sigint received, shutting down");
        println!("\nGoodbye!");
        std::process::exit(0);
    })?;

    println!("\nWelcome, {}.", cli.node_id);
    println!("Your commands are: 'view', 'post <message>', or 'exit'.");

    let server = cli.server.0;
    let hold = Duration::from_millis(cli.hold_millis);
    let stdin = std::io::stdin();

    loop {
        print!("{}_machine> ", cli.node_id);
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            info!("eof on stdin, shutting down");
            println!("\nGoodbye!");
            break;
        }

        match parse_repl_line(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::View => {
                info!("user issued 'view'");
                println!("\nFetching chat log from server...");
                let content = handle_view(server);
                println!("\n--- Chat Log ---\n{content}\n----------------\n");
            }
            ReplCommand::Post(text) => {
                info!(len = text.len(), "user issued 'post'");
                println!("Waiting for write access (DME)...");
                let response = handle_post(&cli.node_id, server, &mutex, &text, hold);
                println!("Server response: {response}");
                println!("Post complete. Lock released.\n");
            }
            ReplCommand::PostMissingText => {
                println!("Usage: post <your message here>");
            }
            ReplCommand::Exit => {
                info!("user exiting");
                println!("Goodbye!");
                break;
            }
            ReplCommand::Unknown(cmd) => {
                println!("Unknown command: '{cmd}'");
            }
        }
    }
    Ok(())
}

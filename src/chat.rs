//! The App Shell: an interactive REPL over a [`DmeMutex`] and a File
//! Service client. `view` talks to the File Service directly (reads are
//! non-exclusive by design); `post` wraps the write in a critical section.

use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

use chrono::Local;
use clap::Parser;
use tracing::info;

use crate::{
    error::{EndpointError, PeerSpecError},
    lamport_mutex::DmeMutex,
    net::roundtrip,
};

const FILE_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HOLD_MILLIS: u64 = 2000;

/// A resolved `HOST:PORT` endpoint, as given on the command line.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint(pub SocketAddr);

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingColon(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|err| EndpointError::BadPort(s.to_string(), err))?;
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| EndpointError::Unresolvable(s.to_string()))?
            .next()
            .ok_or_else(|| EndpointError::Unresolvable(s.to_string()))?;
        Ok(Endpoint(addr))
    }
}

/// A `--peer ID:HOST:PORT` argument.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub node_id: String,
    pub endpoint: Endpoint,
}

impl FromStr for PeerSpec {
    type Err = PeerSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, rest) = s
            .split_once(':')
            .ok_or_else(|| PeerSpecError::WrongFieldCount(s.to_string()))?;
        if node_id.is_empty() || !rest.contains(':') {
            return Err(PeerSpecError::WrongFieldCount(s.to_string()));
        }
        Ok(PeerSpec {
            node_id: node_id.to_string(),
            endpoint: rest.parse()?,
        })
    }
}

/// Distributed chat room client: `view`/`post`/`exit` over a Ricart-Agrawala
/// mutex and a shared append-only log.
#[derive(Parser, Debug)]
#[command(name = "chat-node", about = "Distributed chat room client")]
pub struct Cli {
    /// This node's unique id, e.g. "Joel". Must not contain '|'.
    pub node_id: String,

    /// Local port this node listens on for DME peer traffic.
    pub dme_port: u16,

    /// File server's address, e.g. "1.2.3.4:50000".
    #[arg(long)]
    pub server: Endpoint,

    /// A peer's id and address, e.g. "Jina:5.6.7.8:50001". Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<PeerSpec>,

    /// How long to hold the critical section after posting, to make
    /// contention observable in a demo.
    #[arg(long, default_value_t = DEFAULT_HOLD_MILLIS)]
    pub hold_millis: u64,
}

impl Cli {
    /// Validates cross-field constraints `clap` can't express: no '|' in
    /// node ids (the wire frame's field separator) and no duplicate peer
    /// ids or self-reference.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.node_id.contains('|'),
            "node_id {:?} must not contain '|'",
            self.node_id
        );
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            anyhow::ensure!(
                !peer.node_id.contains('|'),
                "peer id {:?} must not contain '|'",
                peer.node_id
            );
            anyhow::ensure!(
                peer.node_id != self.node_id,
                "peer id {:?} collides with this node's own id",
                peer.node_id
            );
            anyhow::ensure!(
                seen.insert(peer.node_id.clone()),
                "peer id {:?} specified more than once",
                peer.node_id
            );
        }
        Ok(())
    }

    pub fn peer_map(&self) -> HashMap<String, SocketAddr> {
        self.peers
            .iter()
            .map(|peer| (peer.node_id.clone(), peer.endpoint.0))
            .collect()
    }
}

/// Talks to the File Service: sends `request` and returns the decoded
/// response, or a synthesized `ERROR: ...` string on a transport failure, so
/// a server hiccup never crashes the REPL.
pub fn talk_to_server(server: SocketAddr, request: &str) -> String {
    match roundtrip(
        server,
        request.as_bytes(),
        crate::file_service::MAX_RESPONSE_LEN,
        FILE_SERVICE_TIMEOUT,
    ) {
        Ok(buf) => String::from_utf8_lossy(&buf).to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
            "ERROR: Server timed out".to_string()
        }
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            "ERROR: Server connection refused".to_string()
        }
        Err(err) => format!("ERROR: {err}"),
    }
}

/// Handles the `view` command: non-exclusive, no DME involvement.
pub fn handle_view(server: SocketAddr) -> String {
    talk_to_server(server, "VIEW")
}

/// Handles the `post` command: acquires the critical section, posts a
/// timestamped line, holds briefly, releases. Returns the server's
/// response.
pub fn handle_post(node_id: &str, server: SocketAddr, mutex: &DmeMutex, text: &str, hold: Duration) -> String {
    info!(node_id, "waiting for write access (dme)");
    let _guard = mutex.acquire();
    info!(node_id, "critical section acquired");

    let timestamp = Local::now().format("%d %b %I:%M%p").to_string();
    let line = format!("{timestamp} {node_id}: {text}");
    let response = talk_to_server(server, &format!("POST {line}"));

    std::thread::sleep(hold);
    response
    // `_guard` drops here, releasing the critical section and sending any
    // deferred replies.
}

/// One parsed REPL line.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    View,
    Post(String),
    PostMissingText,
    Exit,
    Empty,
    Unknown(String),
}

pub fn parse_repl_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let mut parts = line.splitn(2, ' ');
    match parts.next().unwrap() {
        "view" => ReplCommand::View,
        "post" => match parts.next() {
            Some(text) if !text.is_empty() => ReplCommand::Post(text.to_string()),
            _ => ReplCommand::PostMissingText,
        },
        "exit" => ReplCommand::Exit,
        other => ReplCommand::Unknown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_host_and_port() {
        let endpoint: Endpoint = "127.0.0.1:50000".parse().unwrap();
        assert_eq!(endpoint.0.port(), 50000);
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        assert!(matches!(
            "127.0.0.1".parse::<Endpoint>(),
            Err(EndpointError::MissingColon(_))
        ));
    }

    #[test]
    fn endpoint_reports_unresolvable_host_distinctly_from_missing_colon() {
        // Has a colon and a valid port, but the host half isn't a
        // resolvable name — this must not be reported as "missing colon".
        let err = "this host has spaces:1234".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, EndpointError::Unresolvable(_)));
    }

    #[test]
    fn peer_spec_parses_id_host_port() {
        let peer: PeerSpec = "Jina:127.0.0.1:50001".parse().unwrap();
        assert_eq!(peer.node_id, "Jina");
        assert_eq!(peer.endpoint.0.port(), 50001);
    }

    #[test]
    fn peer_spec_rejects_missing_fields() {
        assert!("Jina".parse::<PeerSpec>().is_err());
    }

    #[test]
    fn repl_parses_commands() {
        assert_eq!(parse_repl_line(""), ReplCommand::Empty);
        assert_eq!(parse_repl_line("  "), ReplCommand::Empty);
        assert_eq!(parse_repl_line("view"), ReplCommand::View);
        assert_eq!(
            parse_repl_line("post hello there"),
            ReplCommand::Post("hello there".to_string())
        );
        assert_eq!(parse_repl_line("post"), ReplCommand::PostMissingText);
        assert_eq!(parse_repl_line("exit"), ReplCommand::Exit);
        assert_eq!(
            parse_repl_line("frobnicate"),
            ReplCommand::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn cli_validate_rejects_pipe_in_node_id() {
        let cli = Cli {
            node_id: "bad|id".to_string(),
            dme_port: 1,
            server: "127.0.0.1:1".parse().unwrap(),
            peers: vec![],
            hold_millis: 0,
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn cli_validate_rejects_self_referencing_peer() {
        let cli = Cli {
            node_id: "A".to_string(),
            dme_port: 1,
            server: "127.0.0.1:1".parse().unwrap(),
            peers: vec!["A:127.0.0.1:2".parse().unwrap()],
            hold_millis: 0,
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn cli_validate_rejects_duplicate_peer_ids() {
        let cli = Cli {
            node_id: "A".to_string(),
            dme_port: 1,
            server: "127.0.0.1:1".parse().unwrap(),
            peers: vec![
                "B:127.0.0.1:2".parse().unwrap(),
                "B:127.0.0.1:3".parse().unwrap(),
            ],
            hold_millis: 0,
        };
        assert!(cli.validate().is_err());
    }
}

//! The File Service: a trivial append/read server over a one-line-per-post
//! text log. Its own local lock only prevents torn reads/writes within this
//! process — it is not, and must not be confused with, the distributed
//! mutex; callers are expected to wrap `POST` with `request_cs`/`release_cs`
//! themselves (the App Shell does this; `view` deliberately does not).

use std::{
    fs,
    io::Write,
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::Mutex,
    thread,
};

use tracing::{error, info, warn};

use crate::{error::FileServiceError, net::read_frame};

/// Max request length accepted from a client.
pub const MAX_REQUEST_LEN: usize = 4096;
/// Max response length a `VIEW` reply is truncated to on the way out — a
/// known, preserved limitation for very long logs.
pub const MAX_RESPONSE_LEN: usize = 4096;

const EMPTY_ROOM: &str = "[Chat room is empty]";
const NO_MESSAGES: &str = "[No messages yet]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    View,
    Post(String),
}

/// Truncates `response` to at most `max_len` bytes on a UTF-8 char boundary,
/// so a multi-byte character straddling the cut point is dropped whole
/// rather than panicking `String::truncate` on a non-boundary index.
fn truncate_response(mut response: String, max_len: usize) -> String {
    if response.len() > max_len {
        let cut = (0..=max_len)
            .rev()
            .find(|&i| response.is_char_boundary(i))
            .unwrap_or(0);
        response.truncate(cut);
    }
    response
}

/// Parses a request line of the form `VIEW` or `POST <text>`.
pub fn parse_command(line: &str) -> Result<Command, FileServiceError> {
    let mut parts = line.splitn(2, ' ');
    match parts.next().unwrap_or("") {
        "VIEW" => Ok(Command::View),
        "POST" => match parts.next() {
            Some(text) if !text.is_empty() => Ok(Command::Post(text.to_string())),
            _ => Err(FileServiceError::MissingMessage),
        },
        _ => Err(FileServiceError::UnknownCommand),
    }
}

/// Owns the chat log file and the local lock that serializes access to it.
pub struct FileService {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Applies one command and returns the exact wire response.
    pub fn handle(&self, command: Command) -> String {
        let _guard = self.lock.lock().unwrap();
        match command {
            Command::View => match fs::read_to_string(&self.path) {
                Ok(content) if content.is_empty() => NO_MESSAGES.to_string(),
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => EMPTY_ROOM.to_string(),
                Err(err) => {
                    error!("file service: failed to read log: {err}");
                    format!("ERROR: {err}")
                }
            },
            Command::Post(text) => match self.append(&text) {
                Ok(()) => "OK: Message posted".to_string(),
                Err(err) => {
                    error!("file service: failed to append: {err}");
                    format!("ERROR: {err}")
                }
            },
        }
    }

    fn append(&self, text: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{text}")
    }

    /// Runs the accept loop, handling one request/response exchange per
    /// connection, until the listener is dropped or accept errors out.
    pub fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "file service listening");
        for incoming in listener.incoming() {
            let mut stream = match incoming {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("file service: accept error: {err}");
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            let response = match read_frame(&mut stream, MAX_REQUEST_LEN) {
                Ok(buf) => {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    info!(%peer, %line, "file service: request");
                    match parse_command(&line) {
                        Ok(command) => truncate_response(self.handle(command), MAX_RESPONSE_LEN),
                        Err(err) => {
                            warn!(%peer, "file service: {err}");
                            err.to_wire()
                        }
                    }
                }
                Err(err) => {
                    error!(%peer, "file service: read failed: {err}");
                    continue;
                }
            };
            if let Err(err) = (&stream).write_all(response.as_bytes()) {
                error!(%peer, "file service: write failed: {err}");
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    /// Binds `addr` and serves on a dedicated thread, returning immediately.
    pub fn spawn(self: std::sync::Arc<Self>, addr: SocketAddr) -> anyhow::Result<thread::JoinHandle<()>> {
        let listener = TcpListener::bind(addr)?;
        Ok(thread::Builder::new()
            .name("file-service".to_string())
            .spawn(move || {
                if let Err(err) = self.serve(listener) {
                    warn!("file service stopped: {err}");
                }
            })?)
    }
}

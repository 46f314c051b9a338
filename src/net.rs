//! Small blocking TCP primitives shared by the DME listener, the File
//! Service, and the App Shell's file-service client.
//!
//! Every protocol this crate speaks is "one short-lived connection per
//! message (or per request/response pair)": the sender writes its frame,
//! half-closes its write half, and the receiver reads until EOF or until a
//! length cap is hit. None of these helpers assume the underlying channel is
//! FIFO across connections — see `lamport_mutex` for why that doesn't matter.

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

/// Recommended bound on a single outbound connect attempt. Aborts only this
/// attempt, not the caller's round.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads up to `max_len` bytes from `stream`, stopping at EOF. Longer
/// payloads are truncated rather than rejected, matching the File Service's
/// documented (if unfortunate) behavior on very long chat logs.
pub fn read_frame(stream: &mut TcpStream, max_len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let take = chunk[..n].len().min(max_len.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..take]);
        if buf.len() >= max_len {
            break;
        }
    }
    Ok(buf)
}

/// Connects, writes `payload`, then half-closes the write side so the peer
/// observes a clean EOF after a single frame. Does not wait for a response;
/// used for the DME REQUEST/REPLY fire-and-forget protocol.
pub fn send_oneway(addr: SocketAddr, payload: &[u8], timeout: Duration) -> std::io::Result<()> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    (&stream).write_all(payload)?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// Connects, writes `payload`, half-closes, then reads back a bounded
/// response. Used for the File Service's request/response protocol.
pub fn roundtrip(
    addr: SocketAddr,
    payload: &[u8],
    max_response: usize,
    timeout: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_read_timeout(Some(timeout))?;
    (&stream).write_all(payload)?;
    stream.shutdown(Shutdown::Write)?;
    read_frame(&mut stream, max_response)
}

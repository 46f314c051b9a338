// Ricart-Agrawala distributed mutual exclusion, built on the logical clock
// from Lamport's "Time, Clocks, and the Ordering of Events in a Distributed
// System" (Commun. ACM'78). IR2 (a): a sent message is timestamped with the
// sender's clock at the sending event. IR2 (b): on receipt, a process's
// clock is advanced to be greater than both its present value and the
// message's timestamp. Priority between two outstanding requests is the
// pair `(timestamp, node_id)` compared lexicographically, which totally
// orders any two distinct requests since node ids are unique.
use std::{
    collections::{HashMap, HashSet},
    net::{SocketAddr, TcpListener},
    sync::{Arc, Condvar, Mutex},
    thread,
};

use tracing::{debug, info, warn};

use crate::{
    error::FrameError,
    net::{self, CONNECT_TIMEOUT},
};

/// `(timestamp, node_id)`. Lower is higher priority. Node ids are assumed
/// distinct, so two requests never compare equal.
pub type RequestId = (u64, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsState {
    Released,
    Wanted,
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
}

/// A single DME wire frame: `TYPE|TIMESTAMP|SENDER_ID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub timestamp: u64,
    pub sender_id: String,
}

/// Max DME frame length.
pub const MAX_FRAME_LEN: usize = 1024;

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let kind = match self.kind {
            MessageKind::Request => "REQUEST",
            MessageKind::Reply => "REPLY",
        };
        format!("{kind}|{}|{}", self.timestamp, self.sender_id).into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLong { max: MAX_FRAME_LEN });
        }
        let text = std::str::from_utf8(buf)?;
        let mut fields = text.splitn(3, '|');
        let (Some(kind), Some(timestamp), Some(sender_id)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(FrameError::FieldCount(text.matches('|').count() + 1));
        };
        if fields.next().is_some() {
            return Err(FrameError::FieldCount(4));
        }
        let kind = match kind {
            "REQUEST" => MessageKind::Request,
            "REPLY" => MessageKind::Reply,
            other => return Err(FrameError::UnknownKind(other.to_string())),
        };
        let timestamp = timestamp
            .parse()
            .map_err(|_| FrameError::InvalidTimestamp(timestamp.to_string()))?;
        if sender_id.contains('|') {
            return Err(FrameError::SenderIdHasSeparator(sender_id.to_string()));
        }
        Ok(Self {
            kind,
            timestamp,
            sender_id: sender_id.to_string(),
        })
    }
}

/// The mutable heart of one node's view of the protocol. Guarded by a single
/// coarse lock: four fine-grained locks invite lock-ordering mistakes, and
/// one lock, never held across a network send, is both simpler and
/// sufficient.
struct State {
    clock: u64,
    phase: CsState,
    our_request: Option<RequestId>,
    replies_needed: HashSet<String>,
    deferred_replies: HashSet<String>,
}

impl State {
    fn new() -> Self {
        Self {
            clock: 0,
            phase: CsState::Released,
            our_request: None,
            replies_needed: HashSet::new(),
            deferred_replies: HashSet::new(),
        }
    }
}

struct Shared {
    node_id: String,
    peers: HashMap<String, SocketAddr>,
    local_addr: SocketAddr,
    state: Mutex<State>,
    /// Signalled whenever `replies_needed` shrinks to empty, so `request_cs`
    /// never busy-polls.
    replies_complete: Condvar,
}

/// A node's handle onto the Ricart-Agrawala protocol. Construction binds the
/// listening port and spawns its accept loop; the handle can then be shared
/// (it is `Clone`, cheaply, via an inner `Arc`) between the application
/// thread and anything else that wants to observe it.
#[derive(Clone)]
pub struct DmeMutex {
    shared: Arc<Shared>,
}

impl DmeMutex {
    /// Binds `bind_addr` for incoming peer connections and starts the
    /// listener thread. `peers` excludes this node and is fixed for the
    /// lifetime of the mutex; peers can't join or leave at runtime.
    pub fn new(
        node_id: impl Into<String>,
        peers: HashMap<String, SocketAddr>,
        bind_addr: SocketAddr,
    ) -> anyhow::Result<Self> {
        let node_id = node_id.into();
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        info!(node_id, %local_addr, peers = peers.len(), "dme listener bound");
        let shared = Arc::new(Shared {
            node_id,
            peers,
            local_addr,
            state: Mutex::new(State::new()),
            replies_complete: Condvar::new(),
        });
        let mutex = Self { shared };
        mutex.spawn_listener(listener);
        Ok(mutex)
    }

    fn spawn_listener(&self, listener: TcpListener) {
        let mutex = self.clone();
        thread::Builder::new()
            .name(format!("{}-dme-listener", mutex.shared.node_id))
            .spawn(move || {
                for incoming in listener.incoming() {
                    let mut stream = match incoming {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("dme listener accept error: {err}");
                            continue;
                        }
                    };
                    let mutex = mutex.clone();
                    thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| "<unknown>".to_string());
                        match net::read_frame(&mut stream, MAX_FRAME_LEN) {
                            Ok(buf) if !buf.is_empty() => mutex.handle_frame(&buf),
                            Ok(_) => debug!("dme: empty frame from {peer}, ignored"),
                            Err(err) => warn!("dme: read from {peer} failed: {err}"),
                        }
                    });
                }
            })
            .expect("failed to spawn dme listener thread");
    }

    /// Decodes and applies one inbound frame. A parse failure drops the
    /// connection and leaves state untouched.
    fn handle_frame(&self, buf: &[u8]) {
        let message = match Message::decode(buf) {
            Ok(message) => message,
            Err(err) => {
                warn!("dme: malformed frame: {err}");
                return;
            }
        };
        debug!(node_id = %self.shared.node_id, ?message, "dme: received");

        let mut notify = false;
        let reply_to = {
            let mut state = self.shared.state.lock().unwrap();
            // IR2 (b): advance the clock before any decision based on this message.
            state.clock = state.clock.max(message.timestamp) + 1;
            match message.kind {
                MessageKind::Request => {
                    let sender_req = (message.timestamp, message.sender_id.clone());
                    let defer = match state.phase {
                        CsState::Held => true,
                        CsState::Wanted => {
                            let ours = state
                                .our_request
                                .clone()
                                .expect("WANTED implies our_request is set");
                            ours < sender_req
                        }
                        CsState::Released => false,
                    };
                    if defer {
                        state.deferred_replies.insert(message.sender_id.clone());
                        debug!(
                            node_id = %self.shared.node_id,
                            from = %message.sender_id,
                            phase = ?state.phase,
                            "dme: deferring reply"
                        );
                        None
                    } else {
                        Some(message.sender_id.clone())
                    }
                }
                MessageKind::Reply => {
                    if state.replies_needed.remove(&message.sender_id) {
                        notify = state.replies_needed.is_empty();
                    } else {
                        debug!(
                            node_id = %self.shared.node_id,
                            from = %message.sender_id,
                            "dme: stale reply discarded"
                        );
                    }
                    None
                }
            }
        };
        if notify {
            self.shared.replies_complete.notify_all();
        }
        if let Some(target) = reply_to {
            self.send_message(&target, MessageKind::Reply, None);
        }
    }

    /// Sends one message to `target_id`. `request_timestamp` overrides the
    /// clock-derived timestamp for REQUEST broadcasts, which always carry
    /// the timestamp minted at `request_cs` entry rather than a fresh
    /// per-send value — clock still advances on every send regardless.
    fn send_message(&self, target_id: &str, kind: MessageKind, request_timestamp: Option<u64>) {
        let Some(&addr) = self.shared.peers.get(target_id) else {
            warn!(node_id = %self.shared.node_id, peer = target_id, "dme: unknown peer");
            return;
        };
        let timestamp = {
            let mut state = self.shared.state.lock().unwrap();
            state.clock += 1;
            request_timestamp.unwrap_or(state.clock)
        };
        let message = Message {
            kind,
            timestamp,
            sender_id: self.shared.node_id.clone(),
        };
        if let Err(err) = net::send_oneway(addr, &message.encode(), CONNECT_TIMEOUT) {
            warn!(
                node_id = %self.shared.node_id,
                peer = target_id,
                %addr,
                ?kind,
                "dme: send failed (dropped, not retried): {err}"
            );
        }
    }

    /// Blocks until this node may enter the critical section.
    ///
    /// # Panics
    /// Panics if called while this node already holds or is waiting for the
    /// critical section — reentrant `request_cs` is a programmer-contract
    /// violation, not a recoverable error.
    pub fn request_cs(&self) {
        let timestamp = {
            let mut state = self.shared.state.lock().unwrap();
            assert!(
                matches!(state.phase, CsState::Released),
                "request_cs called while state = {:?} (reentrant or unreleased request)",
                state.phase
            );
            state.clock += 1;
            let timestamp = state.clock;
            state.our_request = Some((timestamp, self.shared.node_id.clone()));
            state.phase = CsState::Wanted;
            state.replies_needed = self.shared.peers.keys().cloned().collect();
            timestamp
        };
        info!(
            node_id = %self.shared.node_id,
            timestamp,
            peers = self.shared.peers.len(),
            "request_cs: broadcasting REQUEST"
        );
        let peer_ids: Vec<String> = self.shared.peers.keys().cloned().collect();
        for peer_id in &peer_ids {
            self.send_message(peer_id, MessageKind::Request, Some(timestamp));
        }

        let mut state = self.shared.state.lock().unwrap();
        while !state.replies_needed.is_empty() {
            state = self.shared.replies_complete.wait(state).unwrap();
        }
        state.phase = CsState::Held;
        info!(node_id = %self.shared.node_id, timestamp, "request_cs: all replies in, entering CS");
    }

    /// Releases the critical section and answers every deferred peer.
    ///
    /// # Panics
    /// Panics if this node does not currently hold the critical section.
    pub fn release_cs(&self) {
        let deferred: Vec<String> = {
            let mut state = self.shared.state.lock().unwrap();
            assert!(
                matches!(state.phase, CsState::Held),
                "release_cs called while state = {:?} (no held critical section)",
                state.phase
            );
            state.phase = CsState::Released;
            state.our_request = None;
            std::mem::take(&mut state.deferred_replies)
                .into_iter()
                .collect()
        };
        info!(
            node_id = %self.shared.node_id,
            deferred = deferred.len(),
            "release_cs: sending deferred replies"
        );
        for peer_id in deferred {
            self.send_message(&peer_id, MessageKind::Reply, None);
        }
    }

    /// Calls `request_cs`, returning a guard that calls `release_cs` on
    /// drop — including on an unwind, so a panic inside the critical
    /// section body can never leave peers blocked forever.
    pub fn acquire(&self) -> CsGuard<'_> {
        self.request_cs();
        CsGuard { mutex: self }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// The address this node's listener actually bound to. Mainly useful in
    /// tests that bind to port 0 and need to hand the resolved address to
    /// peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Current phase, for tests and diagnostics that want to observe
    /// progress without racing `acquire`/`release_cs`.
    pub fn phase_snapshot(&self) -> CsState {
        self.shared.state.lock().unwrap().phase
    }

    #[cfg(test)]
    fn clock(&self) -> u64 {
        self.shared.state.lock().unwrap().clock
    }
}

/// RAII guard returned by [`DmeMutex::acquire`]. Dropping it releases the
/// critical section unconditionally, including during unwinding.
pub struct CsGuard<'a> {
    mutex: &'a DmeMutex,
}

impl Drop for CsGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release_cs();
    }
}

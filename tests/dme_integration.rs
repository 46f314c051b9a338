//! Process-level integration tests for the Ricart-Agrawala DME mutex,
//! exercising real loopback sockets across real threads (S1-S6).

use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener},
    sync::mpsc,
    thread,
    time::Duration,
};

use dme_chat::{
    file_service::{Command, FileService},
    lamport_mutex::{CsState, DmeMutex, Message, MessageKind},
    net::send_oneway,
};

/// Reserves an ephemeral loopback port by binding then immediately
/// releasing it, so peer maps can be built before any `DmeMutex` exists.
fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn node(id: &str, port: u16, peers: HashMap<String, SocketAddr>) -> DmeMutex {
    DmeMutex::new(id, peers, SocketAddr::from(([127, 0, 0, 1], port))).unwrap()
}

fn peer_map(pairs: &[(&str, u16)]) -> HashMap<String, SocketAddr> {
    pairs
        .iter()
        .map(|(id, port)| (id.to_string(), SocketAddr::from(([127, 0, 0, 1], *port))))
        .collect()
}

/// Fabricates a wire frame from a peer outside the node's own peer map and
/// sends it directly, so the node's logical clock advances to
/// `max(clock, timestamp) + 1` per the receive discipline before its own
/// first `request_cs`. Used to model a node whose clock has already
/// diverged from 0, as SPEC_FULL.md's staggered-timestamp scenario (S4)
/// assumes without specifying how that divergence came about.
fn prime_clock(addr: SocketAddr, timestamp: u64) {
    let message = Message {
        kind: MessageKind::Reply,
        timestamp,
        sender_id: "clock-primer".to_string(),
    };
    send_oneway(addr, &message.encode(), Duration::from_secs(5)).unwrap();
    // Give the listener thread time to process the frame before the caller
    // proceeds to mint a timestamp off the now-updated clock.
    thread::sleep(Duration::from_millis(50));
}

// Scenario S1: a node with no peers enters and leaves the CS with no
// network I/O at all.
#[test]
fn s1_trivial_single_node_is_immediate() {
    let a = node("A", free_port(), HashMap::new());
    assert_eq!(a.phase_snapshot(), CsState::Released);
    a.request_cs();
    assert_eq!(a.phase_snapshot(), CsState::Held);
    a.release_cs();
    assert_eq!(a.phase_snapshot(), CsState::Released);
}

// Scenario S2: two nodes, no contention. A requests; B (idle) replies
// immediately; A enters and releases without B ever deferring.
#[test]
fn s2_two_nodes_no_contention() {
    let (port_a, port_b) = (free_port(), free_port());
    let a = node("A", port_a, peer_map(&[("B", port_b)]));
    let b = node("B", port_b, peer_map(&[("A", port_a)]));

    a.request_cs();
    assert_eq!(a.phase_snapshot(), CsState::Held);
    a.release_cs();

    // B never had to contend, so it should still be able to enter promptly.
    b.request_cs();
    assert_eq!(b.phase_snapshot(), CsState::Held);
    b.release_cs();
}

// Scenario S3: both nodes race to request at (almost) the same moment,
// both minting timestamp 1. A's id is lexicographically smaller, so A's
// (1,"A") has the higher priority: A must win the tie-break and enter
// first, every time, not just "in some order".
#[test]
fn s3_simultaneous_request_resolves_by_priority() {
    use std::sync::Arc;
    use std::sync::Barrier;

    let (port_a, port_b) = (free_port(), free_port());
    let a = node("A", port_a, peer_map(&[("B", port_b)]));
    let b = node("B", port_b, peer_map(&[("A", port_a)]));

    let (order_tx, order_rx) = mpsc::channel();
    // Synchronizes both threads' entry into `request_cs` so each broadcasts
    // its own REQUEST before it can have received the other's, forcing the
    // tie-break (rather than plain first-come-first-served sequencing) to
    // be what decides the order.
    let start = Arc::new(Barrier::new(2));

    let a_tx = order_tx.clone();
    let a_start = start.clone();
    let a_handle = thread::spawn(move || {
        a_start.wait();
        a.request_cs();
        a_tx.send("A").unwrap();
        thread::sleep(Duration::from_millis(20));
        a.release_cs();
    });
    let b_tx = order_tx;
    let b_start = start;
    let b_handle = thread::spawn(move || {
        b_start.wait();
        b.request_cs();
        b_tx.send("B").unwrap();
        thread::sleep(Duration::from_millis(20));
        b.release_cs();
    });

    let first = order_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = order_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(first, second, "both nodes must enter, in some order");
    assert_eq!(first, "A", "A's (1,\"A\") outranks B's (1,\"B\"); A must enter first");
    assert_eq!(second, "B");

    a_handle.join().unwrap();
    b_handle.join().unwrap();
}

// Scenario S4: three nodes contend concurrently with staggered priorities
// — requests (5,A), (3,B), (7,C) — so the CS order must be deterministic:
// B (lowest timestamp), then A, then C. At no point do two CS windows
// overlap (checked via a shared tracepoint counter).
#[test]
fn s4_three_nodes_enter_in_staggered_priority_order() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let ports = [free_port(), free_port(), free_port()];
    let ids = ["A", "B", "C"];
    // request_cs mints timestamp = clock + 1 after priming advances clock
    // to `primed_timestamp + 1`; solving for the desired request timestamp
    // D gives a priming frame timestamp of D - 2.
    let target_request_timestamp = [5u64, 3, 7];

    let nodes: Vec<DmeMutex> = (0..3)
        .map(|i| {
            let pairs: Vec<(&str, u16)> = (0..3)
                .filter(|&j| j != i)
                .map(|j| (ids[j], ports[j]))
                .collect();
            node(ids[i], ports[i], peer_map(&pairs))
        })
        .collect();

    for (i, mutex) in nodes.iter().enumerate() {
        prime_clock(mutex.local_addr(), target_request_timestamp[i] - 2);
    }

    let in_cs = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let (order_tx, order_rx) = mpsc::channel();
    // Synchronizes all three threads' entry into `request_cs` so every
    // REQUEST is broadcast before any REPLY can have returned, forcing the
    // staggered priorities (not call order) to decide who enters first.
    let start = Arc::new(Barrier::new(3));

    let handles: Vec<_> = nodes
        .into_iter()
        .zip(ids)
        .map(|(mutex, id)| {
            let in_cs = in_cs.clone();
            let max_concurrent = max_concurrent.clone();
            let order_tx = order_tx.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let _guard = mutex.acquire();
                order_tx.send(id).unwrap();
                let now = in_cs.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                in_cs.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    let entry_order: Vec<&str> = (0..3)
        .map(|_| order_rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(
        entry_order,
        vec!["B", "A", "C"],
        "requests (5,A), (3,B), (7,C) must enter in priority order B, A, C"
    );
}

// Scenario S5: `view` never involves the DME layer, so it completes
// regardless of whether another node holds the critical section.
#[test]
fn s5_view_is_non_exclusive() {
    let mutex = node("A", free_port(), HashMap::new());
    let _guard = mutex.acquire();
    assert_eq!(mutex.phase_snapshot(), CsState::Held);

    let path = std::env::temp_dir().join("dme-chat-s5-view.txt");
    let _ = std::fs::remove_file(&path);
    let service = FileService::new(&path);
    let response = service.handle(Command::View);
    assert_eq!(response, "[Chat room is empty]");
    let _ = std::fs::remove_file(&path);
}

// Scenario S6: a peer's port is never bound (closed). `request_cs` must
// still be blocking well past a generous wait, rather than silently
// proceeding without that peer's REPLY.
#[test]
fn s6_unreachable_peer_blocks_request_cs() {
    let port_a = free_port();
    let unreachable_port = free_port(); // never bound by anyone
    let a = node("A", port_a, peer_map(&[("ghost", unreachable_port)]));

    let handle = thread::spawn(move || {
        a.request_cs();
    });
    thread::sleep(Duration::from_millis(200));
    assert!(
        !handle.is_finished(),
        "request_cs must not return while a peer is unreachable"
    );
    // Don't join: the thread is deliberately left blocked forever, matching
    // the documented liveness trade-off for crash failures.
}

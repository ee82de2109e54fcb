//! Two tunnels talking to each other without sockets
//!
//! Datagrams are shuttled by hand so that loss, reordering and timing are
//! fully under the test's control.

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::{peer, settings, LoopbackChannel, TAG_RECORD};
use litany_core::message::RETRY_INTERVAL;
use litany_core::tunnel::{OFFLINE_NOTICE, OFFLINE_TIMEOUT};
use litany_core::{MessageCategory, Transcript, Transmit, Tunnel, TunnelEvent};

// ============================================================================
// Harness
// ============================================================================

struct Pair {
    alice: Tunnel<LoopbackChannel>,
    bob: Tunnel<LoopbackChannel>,
    now: Instant,
}

impl Pair {
    fn new() -> Self {
        let cathedral: SocketAddr = "127.0.0.1:4500".parse().unwrap();
        let alice = Tunnel::new(&settings(1, cathedral), peer(2), None, LoopbackChannel::new())
            .unwrap();
        let bob = Tunnel::new(&settings(2, cathedral), peer(1), None, LoopbackChannel::new())
            .unwrap();

        let mut pair = Self {
            alice,
            bob,
            now: Instant::now(),
        };
        pair.drain_events();
        pair
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Peer-bound records from `from`, dropping cathedral traffic.
    fn records(from: &mut Tunnel<LoopbackChannel>) -> Vec<Transmit> {
        std::iter::from_fn(|| from.poll_transmit())
            .filter(|t| t.data.first() == Some(&TAG_RECORD))
            .collect()
    }

    /// Deliver everything alice wrote to bob. Returns how many were delivered.
    fn alice_to_bob(&mut self) -> usize {
        let records = Self::records(&mut self.alice);
        for t in &records {
            self.bob.handle_datagram(&t.data, self.now).unwrap();
        }
        records.len()
    }

    fn bob_to_alice(&mut self) -> usize {
        let records = Self::records(&mut self.bob);
        for t in &records {
            self.alice.handle_datagram(&t.data, self.now).unwrap();
        }
        records.len()
    }

    fn drop_bob_output(&mut self) {
        while self.bob.poll_transmit().is_some() {}
    }

    fn drain_events(&mut self) -> (Vec<TunnelEvent>, Vec<TunnelEvent>) {
        (
            std::iter::from_fn(|| self.alice.poll_event()).collect(),
            std::iter::from_fn(|| self.bob.poll_event()).collect(),
        )
    }
}

fn texts(events: &[TunnelEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TunnelEvent::Message { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Delivery
// ============================================================================

/// Text reaches the peer once and the ack clears the sender's registry
#[test]
fn test_text_is_delivered_and_acked() {
    let mut pair = Pair::new();
    let now = pair.now;

    let id = pair.alice.send_text(b"hello bob", now).unwrap();
    assert_eq!(pair.alice.pending().len(), 1);

    assert_eq!(pair.alice_to_bob(), 1);
    assert_eq!(pair.bob_to_alice(), 1, "bob should ack");

    assert!(pair.alice.pending().is_empty());

    let (_, bob_events) = pair.drain_events();
    assert_eq!(texts(&bob_events), vec!["hello bob".to_string()]);
    assert!(bob_events.iter().any(|e| matches!(
        e,
        TunnelEvent::Message { id: got, .. } if *got == id
    )));
}

/// Ids on one tunnel strictly increase
#[test]
fn test_message_ids_increase() {
    let mut pair = Pair::new();
    let now = pair.now;

    let first = pair.alice.send_text(b"one", now).unwrap();
    let second = pair.alice.send_text(b"two", now).unwrap();
    let third = pair.alice.send_text(b"three", now).unwrap();

    assert!(first < second && second < third);
    assert_eq!(pair.alice.pending().len(), 3);
}

/// Conversation in both directions keeps both registries clean
#[test]
fn test_both_directions() {
    let mut pair = Pair::new();
    let now = pair.now;

    pair.alice.send_text(b"ping", now).unwrap();
    pair.bob.send_text(b"pong", now).unwrap();

    // Each side delivers its text, then the other side's ack
    pair.alice_to_bob();
    pair.bob_to_alice();
    pair.alice_to_bob();

    assert!(pair.alice.pending().is_empty());
    assert!(pair.bob.pending().is_empty());

    let (alice_events, bob_events) = pair.drain_events();
    assert_eq!(texts(&alice_events), vec!["pong".to_string()]);
    assert_eq!(texts(&bob_events), vec!["ping".to_string()]);
}

// ============================================================================
// Loss and retransmission
// ============================================================================

/// A lost ack causes a retransmission the receiver shows only once
#[test]
fn test_lost_ack_is_retransmitted_and_deduplicated() {
    let mut pair = Pair::new();
    let now = pair.now;

    pair.alice.send_text(b"are you there", now).unwrap();
    pair.alice_to_bob();
    pair.drop_bob_output();

    // Not yet due
    pair.advance(Duration::from_secs(1));
    pair.alice.resend_pending(pair.now).unwrap();
    assert_eq!(pair.alice_to_bob(), 0);

    pair.advance(RETRY_INTERVAL);
    pair.alice.resend_pending(pair.now).unwrap();
    assert_eq!(pair.alice_to_bob(), 1, "should retransmit");
    assert_eq!(pair.bob_to_alice(), 1, "retransmission is acked again");
    assert!(pair.alice.pending().is_empty());

    let (_, bob_events) = pair.drain_events();
    assert_eq!(texts(&bob_events).len(), 2, "the tunnel reports both copies");

    let mut transcript = Transcript::new();
    for event in &bob_events {
        transcript.apply(event);
    }
    let received: Vec<_> = transcript
        .lines()
        .iter()
        .filter(|line| line.category == MessageCategory::Received)
        .collect();
    assert_eq!(received.len(), 1, "the transcript shows it once");
    assert_eq!(received[0].text, "<< are you there");
}

/// A lost text is retried until it gets through
#[test]
fn test_lost_text_keeps_retrying() {
    let mut pair = Pair::new();
    let now = pair.now;

    pair.alice.send_text(b"lost", now).unwrap();
    assert_eq!(Pair::records(&mut pair.alice).len(), 1);

    for _ in 0..3 {
        pair.advance(RETRY_INTERVAL);
        pair.alice.resend_pending(pair.now).unwrap();
        assert_eq!(Pair::records(&mut pair.alice).len(), 1);
        assert_eq!(pair.alice.pending().len(), 1);
    }

    pair.advance(RETRY_INTERVAL);
    pair.alice.resend_pending(pair.now).unwrap();
    pair.alice_to_bob();
    pair.bob_to_alice();
    assert!(pair.alice.pending().is_empty());
}

// ============================================================================
// Liveness
// ============================================================================

/// Heartbeats keep the peer online; silence takes it offline once
#[test]
fn test_heartbeats_and_offline() {
    let mut pair = Pair::new();

    pair.alice.manage(pair.now).unwrap();
    pair.alice_to_bob();

    let (_, bob_events) = pair.drain_events();
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, TunnelEvent::PeerOnline { .. })));
    assert!(pair.bob.is_alive());

    // Alice keeps beating for a while
    for _ in 0..30 {
        pair.advance(Duration::from_millis(500));
        pair.alice.manage(pair.now).unwrap();
        pair.alice_to_bob();
        pair.bob.manage(pair.now).unwrap();
    }
    assert!(pair.bob.is_alive());

    // Then goes quiet
    for _ in 0..30 {
        pair.advance(Duration::from_millis(500));
        pair.bob.manage(pair.now).unwrap();
    }
    assert!(!pair.bob.is_alive());

    let (_, bob_events) = pair.drain_events();
    let offline = bob_events
        .iter()
        .filter(|e| matches!(e, TunnelEvent::PeerOffline { .. }))
        .count();
    assert_eq!(offline, 1);
    assert!(bob_events.iter().any(|e| matches!(
        e,
        TunnelEvent::System { text, .. } if text == OFFLINE_NOTICE
    )));

    // Alice comes back
    pair.alice.send_heartbeat(pair.now).unwrap();
    pair.alice_to_bob();
    assert!(pair.bob.is_alive());
}

/// Offline is reported exactly at the timeout, not before
#[test]
fn test_offline_timeout_boundary() {
    let mut pair = Pair::new();

    pair.alice.send_heartbeat(pair.now).unwrap();
    pair.alice_to_bob();
    pair.drain_events();

    pair.advance(OFFLINE_TIMEOUT - Duration::from_millis(1));
    pair.bob.manage(pair.now).unwrap();
    assert!(pair.bob.is_alive());

    pair.advance(Duration::from_millis(1));
    pair.bob.manage(pair.now).unwrap();
    assert!(!pair.bob.is_alive());
}

// ============================================================================
// Addressing
// ============================================================================

/// Records go to the cathedral until a peer address is discovered
#[test]
fn test_records_start_at_cathedral() {
    let mut pair = Pair::new();
    let cathedral = pair.alice.cathedral();
    let now = pair.now;

    pair.alice.send_text(b"hi", now).unwrap();
    let records = Pair::records(&mut pair.alice);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].dest, cathedral);
    assert_eq!(pair.alice.peer_addr(), cathedral);
}

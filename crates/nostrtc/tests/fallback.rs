//! Relay fallback traffic as seen on the wire

use nostr_sdk::Keys;
use nostrtc::{
    encode_payload, turn_address, ChunkMessage, Coordinator, CoordinatorOptions, Faults,
    MockNetwork, RtcEvent,
};
use nostrtc_config::TurnSettings;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RELAY: &str = "wss://relay.test";

struct Node {
    id: String,
    coord: Coordinator,
    events: broadcast::Receiver<RtcEvent>,
}

async fn pair(network: &MockNetwork, turn: TurnSettings) -> (Node, Node) {
    let channel = Keys::generate();
    let mut nodes = Vec::new();
    for _ in 0..2 {
        let coord = Coordinator::new(
            Arc::new(network.bus()),
            Keys::generate(),
            channel.clone(),
            CoordinatorOptions {
                signaling_relays: vec![RELAY.to_string()],
                use_relay_stun: false,
                use_relay_fallback: false,
                turn: turn.clone(),
                ..Default::default()
            },
        );
        let events = coord.subscribe();
        coord.start().await.unwrap();
        nodes.push(Node {
            id: coord.local_public_key().to_string(),
            coord,
            events,
        });
    }
    let mut b = nodes.pop().unwrap();
    let mut a = nodes.pop().unwrap();
    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    next_matching(&mut a, |e| matches!(e, RtcEvent::Connected(p) if p.pubkey == b_id)).await;
    next_matching(&mut b, |e| matches!(e, RtcEvent::Connected(p) if p.pubkey == a_id)).await;
    (a, b)
}

async fn next_matching(node: &mut Node, want: impl Fn(&RtcEvent) -> bool) -> RtcEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(300), node.events.recv())
            .await
            .expect("timed out waiting for event");
        match event {
            Ok(event) if want(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

async fn next_data(node: &mut Node) -> Vec<u8> {
    match next_matching(node, |e| matches!(e, RtcEvent::Data { .. })).await {
        RtcEvent::Data { data, .. } => data,
        _ => unreachable!(),
    }
}

/// Deterministic bytes that compress poorly
fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Chunk messages published by `author` on a connection's fallback address
fn chunk_messages(network: &MockNetwork, connection_id: &str, author: &str) -> Vec<ChunkMessage> {
    network
        .wire_with_d_tag(&turn_address(connection_id))
        .into_iter()
        .filter(|r| r.event.pubkey == author)
        .filter_map(|r| MockNetwork::peek(&r.event.content))
        .map(|plaintext| serde_json::from_str(&plaintext).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_payload_is_chunked_and_each_chunk_acked_once() {
    let network = MockNetwork::new();
    let turn = TurnSettings {
        chunk_length: 64,
        ..Default::default()
    };
    let (a, mut b) = pair(&network, turn).await;

    let payload = noise(1500);
    a.coord.send(&b.id, &payload).await.unwrap();
    assert_eq!(next_data(&mut b).await, payload);

    let expected_chunks = encode_payload(&payload).unwrap().len().div_ceil(64);
    let connection_id = a
        .coord
        .connection(&b.id)
        .await
        .unwrap()
        .connection_id()
        .to_string();

    let packets: Vec<_> = chunk_messages(&network, &connection_id, &a.id)
        .into_iter()
        .filter_map(|m| match m {
            ChunkMessage::Packet(p) => Some(p),
            ChunkMessage::Ack(_) => None,
        })
        .collect();
    assert_eq!(packets.len(), expected_chunks);
    assert!(packets.iter().all(|p| p.n_chunks == expected_chunks && p.packet_id == 0));

    let mut acks = BTreeMap::new();
    for message in chunk_messages(&network, &connection_id, &b.id) {
        if let ChunkMessage::Ack(ack) = message {
            *acks.entry((ack.packet_id, ack.chunk_id)).or_insert(0) += 1;
        }
    }
    assert_eq!(acks.len(), expected_chunks);
    assert!(acks.values().all(|n| *n == 1));
    assert!(a.coord.connection(&b.id).await.unwrap().is_using_fallback().await);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_relays_still_deliver_in_order_once() {
    let network = MockNetwork::new();
    let turn = TurnSettings {
        chunk_length: 16,
        packet_timeout_ms: 60_000,
        ..Default::default()
    };
    let (a, mut b) = pair(&network, turn).await;

    network.set_faults(Faults {
        drop_every: Some(4),
        duplicate: true,
    });

    let messages: Vec<Vec<u8>> = (0..5)
        .map(|i| format!("message {} ", i).repeat(8).into_bytes())
        .collect();
    for message in &messages {
        a.coord.send(&b.id, message).await.unwrap();
    }
    for message in &messages {
        assert_eq!(&next_data(&mut b).await, message);
    }

    // Nothing is delivered twice
    let extra = tokio::time::timeout(Duration::from_secs(30), next_data(&mut b)).await;
    assert!(extra.is_err());
    assert!(network.wire().iter().any(|r| !r.delivered));
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_packet_closes_connection() {
    let network = MockNetwork::new();
    let (mut a, b) = pair(&network, TurnSettings::default()).await;
    let b_id = b.id.clone();

    // The peer vanishes without a word
    b.coord.stop().await;

    a.coord.send(&b_id, b"into the void").await.unwrap();
    let closed = next_matching(&mut a, |e| matches!(e, RtcEvent::Closed { peer, .. } if peer.pubkey == b_id)).await;
    match closed {
        RtcEvent::Closed { reason, .. } => assert!(reason.is_some_and(|r| r.is_error())),
        _ => unreachable!(),
    }
    assert!(a.coord.connection(&b_id).await.is_none());
}

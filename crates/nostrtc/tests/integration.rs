//! Integration tests against public Nostr relays
//!
//! These need network access and working relays, so they are ignored by
//! default. Run with `cargo test -- --ignored`.

use nostr_sdk::Keys;
use nostrtc::{
    Coordinator, CoordinatorOptions, DirectTransportFactory, NostrBus, RtcEvent,
    WebRtcTransportFactory,
};
use nostrtc_config::DEFAULT_RELAYS;
use std::sync::Arc;
use std::time::Duration;

fn relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn node(channel: &Keys, direct: bool) -> Coordinator {
    let options = CoordinatorOptions {
        signaling_relays: relays(),
        direct: direct.then(|| Arc::new(WebRtcTransportFactory::new()) as Arc<dyn DirectTransportFactory>),
        ..Default::default()
    };
    Coordinator::new(Arc::new(NostrBus::new()), Keys::generate(), channel.clone(), options)
}

#[tokio::test]
#[ignore = "needs public relays"]
async fn test_start_and_announce() {
    let coordinator = node(&Keys::generate(), false);
    let result = coordinator.start().await;
    assert!(result.is_ok(), "Failed to start: {:?}", result.err());

    coordinator.announce().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    coordinator.stop().await;
}

#[tokio::test]
#[ignore = "needs public relays"]
async fn test_exchange_over_relays() {
    let channel = Keys::generate();
    let a = node(&channel, true);
    let b = node(&channel, true);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start().await.expect("a failed to start");
    b.start().await.expect("b failed to start");

    let b_id = b.local_public_key().to_string();
    let connected = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match a_events.recv().await {
                Ok(RtcEvent::Connected(peer)) if peer.pubkey == b_id => break,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await;

    if connected.is_err() {
        a.stop().await;
        b.stop().await;
        println!("Warning: peers did not connect (network/relay issue)");
        return;
    }

    // The acceptor may lag the initiator by one round trip
    tokio::time::sleep(Duration::from_secs(2)).await;
    a.send(&b_id, b"Hello over nostrtc").await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match b_events.recv().await {
                Ok(RtcEvent::Data { data, .. }) => return data,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await;

    a.stop().await;
    b.stop().await;

    match received {
        Ok(data) => assert_eq!(data, b"Hello over nostrtc"),
        Err(_) => println!("Warning: data did not arrive in time"),
    }
}

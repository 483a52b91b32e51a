mod common;

use common::{attach_with, start_host};

#[tokio::test]
async fn handshake_over_the_wire_yields_a_shared_key() {
    let (hub, _host) = start_host().await;
    let alice = attach_with(&hub, "term-alice", |c| {
        c.private_key = Some("alice-secret".to_string());
    })
    .await;
    let bob = attach_with(&hub, "term-bob", |c| {
        c.private_key = Some("bob-secret".to_string());
    })
    .await;

    bob.handshake("term-alice").await.unwrap();
    assert!(bob.keyring().has_key("term-alice"));
    assert!(alice.keyring().has_key("term-bob"));

    let sealed = bob.keyring().seal("term-alice", b"fill BTC 0.5").unwrap();
    let opened = alice.keyring().open("term-bob", &sealed).unwrap();
    assert_eq!(opened, b"fill BTC 0.5");

    // and the other direction with the same key material
    let sealed = alice.keyring().seal("term-bob", b"ack").unwrap();
    let opened = bob.keyring().open("term-alice", &sealed).unwrap();
    assert_eq!(opened, b"ack");
}

#[tokio::test]
async fn handshake_against_a_plain_terminal_fails() {
    let (hub, _host) = start_host().await;
    let _plain = attach_with(&hub, "term-plain", |_| {}).await;
    let bob = attach_with(&hub, "term-bob", |c| {
        c.private_key = Some("bob-secret".to_string());
    })
    .await;

    let err = bob.handshake("term-plain").await.unwrap_err();
    let text = err.to_string();
    assert!(!bob.keyring().has_key("term-plain"), "no key stored: {text}");
}

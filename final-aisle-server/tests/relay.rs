//! Roster and movement relay between live clients.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{recv, TestServer};
use final_aisle::network::protocol::{ClientRequest, RelayEvent, ServerMessage};
use final_aisle::SessionId;

fn connected_id(message: ServerMessage) -> SessionId {
    match message {
        ServerMessage::PlayerConnected(summary) => summary.session,
        other => panic!("expected PlayerConnected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_movement_reaches_others_tagged_with_sender() {
    let server = TestServer::start().await;
    server.create_account("a@b.com", "alice", "password1").await;
    server.create_account("b@b.com", "bob", "password1").await;
    server.create_account("c@b.com", "carol", "password1").await;

    let mut alice = server.login("alice", "password1").await;
    let mut bob = server.login("bob", "password1").await;
    let bob_id = connected_id(recv(&mut alice).await);

    bob.send(&ClientRequest::PostConnect).await.unwrap();
    let alice_id = connected_id(recv(&mut bob).await);
    assert_ne!(alice_id, bob_id);

    let input = RelayEvent::Input { x: 1.0, y: 0.0 };
    alice.send(&ClientRequest::Relay(input)).await.unwrap();
    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::Relayed { sender: alice_id, event: input }
    );

    // Alice's next message is Carol arriving, not an echo of her own input.
    let _carol = server.login("carol", "password1").await;
    let carol_id = connected_id(recv(&mut alice).await);
    assert_eq!(connected_id(recv(&mut bob).await), carol_id);

    bob.send(&ClientRequest::Relay(RelayEvent::Jump)).await.unwrap();
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::Relayed { sender: bob_id, event: RelayEvent::Jump }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_movement_is_dropped() {
    let server = TestServer::start().await;
    server.create_account("a@b.com", "alice", "password1").await;

    let mut alice = server.login("alice", "password1").await;
    let mut stranger = server.connect().await;
    stranger
        .send(&ClientRequest::Relay(RelayEvent::Position { x: 1.0, y: 2.0, z: 3.0 }))
        .await
        .unwrap();

    // Anything Alice receives next must come from a later event.
    server.create_account("b@b.com", "bob", "password1").await;
    let _bob = server.login("bob", "password1").await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::PlayerConnected(_)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_post_connect_is_repeatable_and_private() {
    let server = TestServer::start().await;
    for (email, name) in [("a@b.com", "alice"), ("b@b.com", "bob"), ("c@b.com", "carol")] {
        server.create_account(email, name, "password1").await;
    }

    let mut alice = server.login("alice", "password1").await;
    let _bob = server.login("bob", "password1").await;
    let mut carol = server.login("carol", "password1").await;
    recv(&mut alice).await;
    recv(&mut alice).await;

    for _ in 0..2 {
        carol.send(&ClientRequest::PostConnect).await.unwrap();
        let mut names = vec![];
        for _ in 0..2 {
            match recv(&mut carol).await {
                ServerMessage::PlayerConnected(summary) => names.push(summary.name),
                other => panic!("unexpected {other:?}"),
            }
        }
        names.sort();
        assert_eq!(names, ["alice's character", "bob's character"]);
    }

    // Alice saw none of Carol's roster requests.
    carol.send(&ClientRequest::Relay(RelayEvent::ToggleProne(true))).await.unwrap();
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::Relayed { event: RelayEvent::ToggleProne(true), .. }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_broadcasts() {
    let server = TestServer::start().await;
    server.create_account("a@b.com", "alice", "password1").await;
    server.create_account("b@b.com", "bob", "password1").await;

    let mut alice = server.login("alice", "password1").await;
    let bob = server.login("bob", "password1").await;
    let bob_id = connected_id(recv(&mut alice).await);

    drop(bob);
    assert_eq!(recv(&mut alice).await, ServerMessage::PlayerDisconnected(bob_id));
    assert_eq!(server.server.online_count().await, 1);

    // Bob can log in again once his old session is gone.
    let _bob = server.login("bob", "password1").await;

    server.shutdown().await;
}

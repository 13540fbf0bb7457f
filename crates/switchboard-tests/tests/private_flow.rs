use serde_json::json;
use std::time::Duration;
use switchboard_protocol::{ErrorCode, MessageType};
use switchboard_tests::harness::client::TestClient;
use switchboard_tests::harness::server::TestServer;

#[tokio::test]
async fn private_message_reaches_public_recipient_and_confirms_sender() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", true).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    server.wait_online(&bob, true).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    server.wait_online(&alice, true).await?;

    alice_ws
        .send_json(json!({ "type": "private_message", "to": bob.id, "content": "  hello bob " }))
        .await?;

    let received = bob_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(received.from, alice.id);
    assert_eq!(received.to, Some(bob.id));
    assert_eq!(received.content.as_deref(), Some("hello bob"));
    let message_id = received.message_id.expect("stored message has an id");
    assert!(message_id > 0);
    assert!(received.data.is_none());

    let confirmation = alice_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(confirmation.message_id, Some(message_id));
    let record = &confirmation.data.as_ref().expect("confirmation carries the record")["message"];
    assert_eq!(record["id"], message_id);
    assert_eq!(record["sender_id"], alice.id);
    assert_eq!(record["recipient_id"], bob.id);

    server.shutdown().await
}

#[tokio::test]
async fn spoofed_sender_is_replaced_by_principal() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let bob = server.user("bob", true).await?;
    let mallory = server.user("mallory", false).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    server.wait_online(&bob, true).await?;
    let mut mallory_ws = TestClient::connect(&server, &mallory).await?;

    mallory_ws
        .send_json(json!({ "type": "private_message", "from": alice.id, "to": bob.id, "content": "it's alice" }))
        .await?;
    let received = bob_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(received.from, mallory.id);

    server.shutdown().await
}

#[tokio::test]
async fn private_profile_without_follow_is_forbidden() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let carol = server.user("carol", false).await?;

    let mut carol_ws = TestClient::connect(&server, &carol).await?;
    server.wait_online(&carol, true).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;

    alice_ws
        .send_json(json!({ "type": "private_message", "to": carol.id, "content": "hi" }))
        .await?;
    let error = alice_ws.next_of(MessageType::Error).await?;
    assert_eq!(error.error_code(), Some(ErrorCode::Forbidden));
    carol_ws.expect_silence(Duration::from_millis(200)).await?;

    // A pending follow request does not open the gate; an accepted one does.
    server.store().follow(alice.id, carol.id, false).await?;
    alice_ws
        .send_json(json!({ "type": "private_message", "to": carol.id, "content": "hi" }))
        .await?;
    let error = alice_ws.next_of(MessageType::Error).await?;
    assert_eq!(error.error_code(), Some(ErrorCode::Forbidden));

    server.store().follow(carol.id, alice.id, true).await?;
    alice_ws
        .send_json(json!({ "type": "private_message", "to": carol.id, "content": "hi" }))
        .await?;
    let received = carol_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(received.from, alice.id);

    server.shutdown().await
}

#[tokio::test]
async fn invalid_frames_get_error_envelopes_and_keep_the_socket() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let bob = server.user("bob", true).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;

    let cases = [
        (json!({ "type": "private_message", "to": bob.id, "content": "   " }), ErrorCode::EmptyContent),
        (
            json!({ "type": "private_message", "to": bob.id, "content": "x".repeat(2001) }),
            ErrorCode::ContentTooLong,
        ),
        (json!({ "type": "private_message", "content": "hi" }), ErrorCode::MissingTarget),
        (json!({ "type": "private_message", "to": alice.id, "content": "me" }), ErrorCode::Forbidden),
        (json!({ "type": "user_online" }), ErrorCode::UnknownType),
        (json!({ "type": "teleport" }), ErrorCode::UnknownType),
    ];
    for (frame, expected) in cases {
        alice_ws.send_json(frame.clone()).await?;
        let error = alice_ws.next_of(MessageType::Error).await?;
        assert_eq!(error.error_code(), Some(expected), "frame {frame}");
    }

    alice_ws.send_raw("{not json").await?;
    let error = alice_ws.next_of(MessageType::Error).await?;
    assert_eq!(error.error_code(), Some(ErrorCode::InvalidMessage));

    // Still usable afterwards.
    alice_ws.send_json(json!({ "type": "ping" })).await?;
    alice_ws.next_of(MessageType::Pong).await?;

    server.shutdown().await
}

#[tokio::test]
async fn exactly_max_chars_is_accepted() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let bob = server.user("bob", true).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;

    let content = "é".repeat(2000);
    alice_ws
        .send_json(json!({ "type": "private_message", "to": bob.id, "content": content }))
        .await?;
    let confirmation = alice_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(confirmation.content.as_deref().map(|c| c.chars().count()), Some(2000));

    server.shutdown().await
}

#[tokio::test]
async fn offline_messages_replay_on_connect_until_read() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", true).await?;

    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    server.wait_online(&alice, true).await?;
    for text in ["first", "second"] {
        alice_ws
            .send_json(json!({ "type": "private_message", "to": bob.id, "content": text }))
            .await?;
        alice_ws.next_of(MessageType::PrivateMessage).await?;
    }

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    let first = bob_ws.next_of(MessageType::PrivateMessage).await?;
    let second = bob_ws.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(first.content.as_deref(), Some("first"));
    assert_eq!(second.content.as_deref(), Some("second"));
    assert_eq!(first.data_bool("backlog"), Some(true));
    assert!(first.message_id < second.message_id);

    bob_ws
        .send_json(json!({ "type": "read_status", "to": alice.id }))
        .await?;
    let receipt = alice_ws.next_of(MessageType::ReadStatus).await?;
    assert_eq!(receipt.from, bob.id);
    assert_eq!(receipt.data.as_ref().expect("receipt data")["count"], 2);

    bob_ws.close().await?;
    server.wait_online(&bob, false).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    bob_ws.expect_silence(Duration::from_millis(300)).await?;

    server.shutdown().await
}

#[tokio::test]
async fn second_connection_supersedes_the_first() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let bob = server.user("bob", true).await?;

    let mut first = TestClient::connect(&server, &bob).await?;
    server.wait_online(&bob, true).await?;
    let mut second = TestClient::connect_with_query(&server, &bob.token).await?;

    assert_eq!(first.close_code().await?, Some(4000));
    server.wait_online(&bob, true).await?;

    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    alice_ws
        .send_json(json!({ "type": "private_message", "to": bob.id, "content": "which one?" }))
        .await?;
    let received = second.next_of(MessageType::PrivateMessage).await?;
    assert_eq!(received.content.as_deref(), Some("which one?"));

    server.shutdown().await
}

#[tokio::test]
async fn shutdown_closes_clients_with_going_away() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", true).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    server.wait_online(&alice, true).await?;

    let shutdown = tokio::spawn(server.shutdown());
    assert_eq!(alice_ws.close_code().await?, Some(1001));
    shutdown.await??;
    Ok(())
}

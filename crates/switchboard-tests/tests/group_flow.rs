use serde_json::json;
use std::time::Duration;
use switchboard_protocol::{ErrorCode, MessageType};
use switchboard_tests::harness::client::TestClient;
use switchboard_tests::harness::server::TestServer;

const GROUP: i64 = 7;

#[tokio::test]
async fn group_message_fans_out_to_every_other_member() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;
    let carol = server.user("carol", false).await?;
    let outsider = server.user("dave", false).await?;
    for member in [&alice, &bob, &carol] {
        server.store().join_group(GROUP, member.id).await?;
    }

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    let mut carol_ws = TestClient::connect(&server, &carol).await?;
    let mut outsider_ws = TestClient::connect(&server, &outsider).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    for user in [&alice, &bob, &carol, &outsider] {
        server.wait_online(user, true).await?;
    }

    alice_ws
        .send_json(json!({ "type": "group_message", "group_id": GROUP, "content": "standup?" }))
        .await?;

    for ws in [&mut bob_ws, &mut carol_ws] {
        let received = ws.next_of(MessageType::GroupMessage).await?;
        assert_eq!(received.from, alice.id);
        assert_eq!(received.group_id, Some(GROUP));
        assert_eq!(received.content.as_deref(), Some("standup?"));
    }

    let confirmation = alice_ws.next_of(MessageType::GroupMessage).await?;
    assert!(confirmation.data.is_some());
    alice_ws.expect_silence(Duration::from_millis(200)).await?;
    outsider_ws.expect_silence(Duration::from_millis(200)).await?;

    let online = server.get_json(&format!("/api/groups/{GROUP}/online")).await?;
    let mut expected = vec![alice.id, bob.id, carol.id];
    expected.sort();
    assert_eq!(online["users"], json!(expected));

    server.shutdown().await
}

#[tokio::test]
async fn membership_is_fixed_at_connect() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;
    server.store().join_group(GROUP, alice.id).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    server.wait_online(&bob, true).await?;
    server.store().join_group(GROUP, bob.id).await?;

    bob_ws
        .send_json(json!({ "type": "group_message", "group_id": GROUP, "content": "let me in" }))
        .await?;
    let error = bob_ws.next_of(MessageType::Error).await?;
    assert_eq!(error.error_code(), Some(ErrorCode::NotGroupMember));

    bob_ws.close().await?;
    server.wait_online(&bob, false).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    bob_ws
        .send_json(json!({ "type": "group_message", "group_id": GROUP, "content": "in now" }))
        .await?;
    let confirmation = bob_ws.next_of(MessageType::GroupMessage).await?;
    assert_eq!(confirmation.group_id, Some(GROUP));

    server.shutdown().await
}

#[tokio::test]
async fn group_typing_skips_the_sender() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;
    for member in [&alice, &bob] {
        server.store().join_group(GROUP, member.id).await?;
    }

    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    server.wait_online(&alice, true).await?;
    server.wait_online(&bob, true).await?;

    alice_ws
        .send_json(json!({ "type": "typing", "group_id": GROUP, "data": { "is_typing": false } }))
        .await?;
    let typing = bob_ws.next_of(MessageType::Typing).await?;
    assert_eq!(typing.from, alice.id);
    assert_eq!(typing.group_id, Some(GROUP));
    assert_eq!(typing.data_bool("is_typing"), Some(false));
    alice_ws.expect_silence(Duration::from_millis(200)).await?;

    server.shutdown().await
}

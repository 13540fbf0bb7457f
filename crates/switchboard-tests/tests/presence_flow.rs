use serde_json::json;
use std::time::Duration;
use switchboard_protocol::MessageType;
use switchboard_tests::harness::client::TestClient;
use switchboard_tests::harness::server::{NOTIFY_TOKEN, TestServer};

#[tokio::test]
async fn contacts_see_each_other_come_and_go() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;
    let stranger = server.user("eve", true).await?;
    server.befriend(&alice, &bob).await?;

    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    let mut stranger_ws = TestClient::connect(&server, &stranger).await?;
    server.wait_online(&bob, true).await?;
    server.wait_online(&stranger, true).await?;

    let alice_ws = TestClient::connect(&server, &alice).await?;
    let online = bob_ws.next_of(MessageType::UserOnline).await?;
    assert_eq!(online.from, alice.id);

    alice_ws.close().await?;
    let offline = bob_ws.next_of(MessageType::UserOffline).await?;
    assert_eq!(offline.from, alice.id);

    stranger_ws.expect_silence(Duration::from_millis(200)).await?;
    server.shutdown().await
}

#[tokio::test]
async fn online_endpoints_track_connections() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;

    let health = server.get_json("/healthz").await?;
    assert_eq!(health, json!({ "status": "ok", "online": 0, "connections": 0 }));

    let bob_ws = TestClient::connect(&server, &bob).await?;
    let _alice_ws = TestClient::connect(&server, &alice).await?;
    server.wait_online(&alice, true).await?;
    server.wait_online(&bob, true).await?;

    let mut expected = vec![alice.id, bob.id];
    expected.sort();
    assert_eq!(server.get_json("/api/online").await?["users"], json!(expected));
    assert_eq!(
        server.get_json(&format!("/api/online/{}", bob.id)).await?,
        json!({ "user_id": bob.id, "online": true })
    );

    bob_ws.close().await?;
    server.wait_online(&bob, false).await?;
    assert_eq!(server.get_json("/api/online").await?["users"], json!([alice.id]));
    assert_eq!(server.get_json("/healthz").await?["online"], 1);

    server.shutdown().await
}

#[tokio::test]
async fn notifications_reach_online_users() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let mut alice_ws = TestClient::connect(&server, &alice).await?;
    server.wait_online(&alice, true).await?;

    let payload = json!({ "kind": "follow_request", "from": 42 });
    let request = json!({ "user_id": alice.id, "payload": payload });

    let (status, _) = server.post_json("/api/notifications", &request).await?;
    assert_eq!(status, 401);
    let (status, _) = server
        .post_json_bearer("wrong", "/api/notifications", &request)
        .await?;
    assert_eq!(status, 401);
    let (status, _) = server
        .post_json_as(&alice, "/api/notifications", &request)
        .await?;
    assert_eq!(status, 401);

    let (status, _) = server
        .post_json_bearer(NOTIFY_TOKEN, "/api/notifications", &request)
        .await?;
    assert_eq!(status, 202);

    let notification = alice_ws.next_of(MessageType::Notification).await?;
    assert_eq!(notification.from, 0);
    assert_eq!(notification.to, Some(alice.id));
    assert_eq!(notification.data.as_ref().expect("payload")["payload"], payload);

    // Offline targets are accepted and silently dropped.
    let (status, _) = server
        .post_json_bearer(
            NOTIFY_TOKEN,
            "/api/notifications",
            &json!({ "user_id": 9999, "payload": {} }),
        )
        .await?;
    assert_eq!(status, 202);

    // Only the authorized request got through.
    alice_ws.expect_silence(Duration::from_millis(200)).await?;
    server.shutdown().await
}

#[tokio::test]
async fn notifications_disabled_without_a_token() -> anyhow::Result<()> {
    let server = TestServer::spawn_with(|config| config.notify_token = None).await?;
    let alice = server.user("alice", false).await?;

    let (status, _) = server
        .post_json_bearer(
            NOTIFY_TOKEN,
            "/api/notifications",
            &json!({ "user_id": alice.id, "payload": {} }),
        )
        .await?;
    assert_eq!(status, 403);

    server.shutdown().await
}

#[tokio::test]
async fn typing_endpoint_applies_the_gate() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let bob = server.user("bob", false).await?;
    let mut bob_ws = TestClient::connect(&server, &bob).await?;
    server.wait_online(&bob, true).await?;

    let request = json!({ "kind": "private", "target_id": bob.id });

    // The sender comes from the session, never the body.
    let (status, _) = server.post_json("/api/typing", &request).await?;
    assert_eq!(status, 401);
    let spoofed = json!({ "user_id": alice.id, "kind": "private", "target_id": bob.id });
    let (status, _) = server.post_json("/api/typing", &spoofed).await?;
    assert_eq!(status, 401);
    bob_ws.expect_silence(Duration::from_millis(200)).await?;

    let (status, body) = server.post_json_as(&alice, "/api/typing", &request).await?;
    assert_eq!(status, 403);
    assert_eq!(body["code"], "forbidden");

    server.befriend(&alice, &bob).await?;
    let (status, body) = server.post_json_as(&alice, "/api/typing", &request).await?;
    assert_eq!(status, 202);
    assert_eq!(body["delivered"], 1);
    let typing = bob_ws.next_of(MessageType::Typing).await?;
    assert_eq!(typing.from, alice.id);
    assert_eq!(typing.data_bool("is_typing"), Some(true));

    let (status, body) = server
        .post_json_as(
            &alice,
            "/api/typing",
            &json!({ "kind": "group", "target_id": 5 }),
        )
        .await?;
    assert_eq!(status, 403);
    assert_eq!(body["code"], "not_group_member");

    server.shutdown().await
}

#[tokio::test]
async fn handshake_requires_a_live_session() -> anyhow::Result<()> {
    let server = TestServer::spawn().await?;
    let alice = server.user("alice", false).await?;
    let stale = server
        .store()
        .create_session(alice.id, Duration::ZERO)
        .await?;

    assert_eq!(TestClient::rejected_status(&server, None).await?, 401);
    assert_eq!(TestClient::rejected_status(&server, Some("bogus")).await?, 401);
    assert_eq!(TestClient::rejected_status(&server, Some(&stale)).await?, 401);
    assert!(server.get_json("/api/online").await?["users"].as_array().is_some_and(Vec::is_empty));

    let mut alice_ws = TestClient::connect_with_query(&server, &alice.token).await?;
    alice_ws.send_json(json!({ "type": "ping" })).await?;
    alice_ws.next_of(MessageType::Pong).await?;

    server.shutdown().await
}

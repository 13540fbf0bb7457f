use crate::connection::{CloseReason, Connection, Frame};
use crate::dispatch::Dispatcher;
use crate::error::HubError;
use crate::hub::{Handshake, Hub};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use switchboard_protocol::now_ms;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Register a connection and pump it until it closes.
///
/// The reader and writer run as separate tasks. However the reader ends,
/// including by panicking, the connection is unregistered exactly once.
pub async fn run_connection<S, St, E>(
    hub: Hub,
    handshake: Handshake,
    sink: S,
    stream: St,
) -> Result<CloseReason, HubError>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (conn, rx) = hub.register(handshake).await?;
    let user_id = conn.principal();

    let mut writer = tokio::spawn(write_loop(hub.clone(), conn.clone(), rx, sink));
    let reader = tokio::spawn(read_loop(hub.clone(), conn.clone(), stream));

    let reason = match reader.await {
        Ok(reason) => reason,
        Err(e) => {
            tracing::error!(user_id, connection_id = %conn.id(), error = %e, "connection reader failed");
            CloseReason::Internal
        }
    };
    hub.disconnect(&conn, reason);

    // A peer that stopped reading can hold the writer inside a send forever.
    let grace = hub.config().pong_wait;
    match tokio::time::timeout(grace, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(user_id, connection_id = %conn.id(), error = %e, "connection writer failed")
        }
        Err(_) => {
            tracing::warn!(user_id, connection_id = %conn.id(), "writer did not finish, aborting");
            writer.abort();
        }
    }

    conn.mark_closed();
    let reason = conn.close_reason().unwrap_or(reason);
    let now = now_ms();
    tracing::info!(
        user_id,
        connection_id = %conn.id(),
        reason = %reason,
        connected_ms = now.saturating_sub(conn.connected_at_ms()),
        idle_ms = now.saturating_sub(conn.last_activity_ms()),
        "connection closed"
    );
    Ok(reason)
}

async fn read_loop<St, E>(hub: Hub, conn: Arc<Connection>, mut stream: St) -> CloseReason
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let pong_wait = hub.config().pong_wait;
    let mut dispatcher = Dispatcher::new(hub, conn.clone());

    loop {
        let deadline = conn.read_deadline(pong_wait);
        let next = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(user_id = conn.principal(), connection_id = %conn.id(), "heartbeat timed out");
                return CloseReason::HeartbeatTimeout;
            }
        };
        let message = match next {
            None => return CloseReason::ClientClosed,
            Some(Err(e)) => {
                tracing::debug!(user_id = conn.principal(), error = %e, "read failed");
                return CloseReason::TransportError;
            }
            Some(Ok(message)) => message,
        };

        // Evicted or superseded while this frame was in flight.
        if let Some(reason) = conn.close_reason() {
            return reason;
        }
        conn.touch();

        match message {
            Message::Text(text) => dispatcher.handle_text(text.as_str()).await,
            Message::Binary(_) => dispatcher.reject(&HubError::Malformed(
                "binary frames are not supported".to_string(),
            )),
            Message::Ping(_) | Message::Pong(_) => conn.heartbeat(),
            Message::Close(_) => return CloseReason::ClientClosed,
        }
    }
}

async fn write_loop<S>(hub: Hub, conn: Arc<Connection>, mut rx: mpsc::Receiver<Frame>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let ping_interval = hub.config().ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let outgoing = tokio::select! {
            _ = conn.closing() => break,
            frame = rx.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Default::default()),
        };
        if let Err(e) = sink.send(outgoing).await {
            tracing::debug!(user_id = conn.principal(), error = %e, "write failed");
            hub.disconnect(&conn, CloseReason::TransportError);
            return;
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
    let close = CloseFrame {
        code: reason.close_code(),
        reason: Utf8Bytes::from(reason.as_str().to_string()),
    };
    let _ = sink.send(Message::Close(Some(close))).await;
    let _ = sink.close().await;
}

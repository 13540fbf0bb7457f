use crate::connection::{Connection, Delivery};
use crate::hub::{Hub, encode};
use std::sync::Arc;
use switchboard_protocol::{Envelope, MessageType, UserId};

/// Tell every online contact that `conn`'s user came online.
///
/// Skipped if the connection stopped being its user's addressable one while
/// contacts were being looked up, so a late `user_online` never lands after
/// the matching `user_offline`.
pub(crate) async fn announce_online(hub: &Hub, conn: &Arc<Connection>) {
    let user_id = conn.principal();
    let Some(contacts) = contacts(hub, user_id, MessageType::UserOnline).await else {
        return;
    };
    let still_addressable = hub
        .registry()
        .addressable(user_id)
        .await
        .is_some_and(|current| current.id() == conn.id());
    if !conn.is_active() || !still_addressable {
        tracing::debug!(user_id, connection_id = %conn.id(), "connection gone before presence, skipping user_online");
        return;
    }
    announce(hub, user_id, MessageType::UserOnline, contacts).await;
}

/// Tell every online contact that `user_id` went offline, unless it has
/// already reconnected.
pub(crate) async fn announce_offline(hub: &Hub, user_id: UserId) {
    let Some(contacts) = contacts(hub, user_id, MessageType::UserOffline).await else {
        return;
    };
    if hub.registry().is_online(user_id).await {
        tracing::debug!(user_id, "user reconnected before presence, skipping user_offline");
        return;
    }
    announce(hub, user_id, MessageType::UserOffline, contacts).await;
}

async fn contacts(hub: &Hub, user_id: UserId, kind: MessageType) -> Option<Vec<UserId>> {
    match hub.graph().contacts_of(user_id).await {
        Ok(contacts) if contacts.is_empty() => None,
        Ok(contacts) => Some(contacts),
        Err(e) => {
            tracing::warn!(user_id, kind = %kind, error = %e, "contact lookup failed, skipping presence");
            None
        }
    }
}

async fn announce(hub: &Hub, user_id: UserId, kind: MessageType, contacts: Vec<UserId>) {
    let frame = match encode(&Envelope::new(kind, user_id)) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "failed to encode presence");
            return;
        }
    };

    let mut delivered = 0usize;
    for contact in contacts {
        if contact == user_id {
            continue;
        }
        if let Some(conn) = hub.registry().addressable(contact).await {
            delivered += hub.deliver(&conn, &frame, Delivery::Required) as usize;
        }
    }
    tracing::debug!(user_id, kind = %kind, delivered, "presence announced");
}

/// Replay unread private messages to a freshly registered connection.
pub(crate) async fn replay_backlog(hub: &Hub, conn: &Arc<Connection>) {
    let limit = hub.config().backlog_limit;
    if limit == 0 {
        return;
    }
    let user_id = conn.principal();
    let records = match hub.store().unread_backlog_for(user_id, limit).await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "backlog lookup failed");
            return;
        }
    };

    let mut replayed = 0usize;
    for record in &records {
        if !conn.is_active() {
            break;
        }
        match encode(&record.to_envelope().with_data("backlog", true)) {
            Ok(frame) => replayed += hub.deliver(conn, &frame, Delivery::BestEffort) as usize,
            Err(e) => tracing::warn!(user_id, message_id = record.id, error = %e, "failed to encode backlog"),
        }
    }
    if replayed > 0 {
        tracing::info!(user_id, replayed, "replayed unread backlog");
    }
}

use crate::connection::{Connection, Delivery};
use crate::error::HubError;
use crate::gate::PrivacyGate;
use crate::hub::{Hub, TypingTarget, encode};
use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use switchboard_protocol::{Envelope, MessageType, UserId, now_ms};

/// Per-connection handling of inbound envelopes.
///
/// Every failure is answered with one `error` envelope on the same
/// connection; nothing here ever reaches the event loop as an error.
pub struct Dispatcher {
    hub: Hub,
    conn: Arc<Connection>,
    limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(hub: Hub, conn: Arc<Connection>) -> Self {
        let limiter = RateLimiter::new(hub.config().rate_burst, hub.config().rate_per_second);
        Self { hub, conn, limiter }
    }

    fn principal(&self) -> UserId {
        self.conn.principal()
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if let Err(err) = self.process(text).await {
            self.reject(&err);
        }
    }

    /// Answer the originating connection with an error envelope.
    pub fn reject(&self, err: &HubError) {
        let (code, message) = err.to_error_code();
        match err {
            HubError::Persistence(_)
            | HubError::Graph(_)
            | HubError::Encode(_)
            | HubError::HubClosed => {
                tracing::warn!(user_id = self.principal(), code = code.as_str(), error = %err, "request failed")
            }
            _ => {
                tracing::debug!(user_id = self.principal(), code = code.as_str(), error = %err, "request rejected")
            }
        }
        self.reply(&Envelope::error(code, message));
    }

    fn reply(&self, envelope: &Envelope) {
        match encode(envelope) {
            Ok(frame) => {
                self.hub.deliver(&self.conn, &frame, Delivery::Required);
            }
            Err(e) => tracing::warn!(user_id = self.principal(), error = %e, "failed to encode reply"),
        }
    }

    async fn process(&mut self, text: &str) -> Result<(), HubError> {
        let max = self.hub.config().max_frame_bytes;
        if text.len() > max {
            return Err(HubError::FrameTooLarge {
                size: text.len(),
                max,
            });
        }
        let envelope = Envelope::decode(text).map_err(|e| HubError::Malformed(e.to_string()))?;

        let heartbeat = matches!(envelope.kind, MessageType::Ping | MessageType::Pong);
        if !heartbeat && !self.limiter.try_acquire() {
            return Err(HubError::RateLimited);
        }
        self.dispatch(envelope).await
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<(), HubError> {
        match envelope.kind {
            MessageType::PrivateMessage => self.private_message(envelope).await,
            MessageType::GroupMessage => self.group_message(envelope).await,
            MessageType::Typing => self.typing(envelope).await,
            MessageType::ReadStatus => self.read_status(envelope).await,
            MessageType::Ping => {
                self.conn.heartbeat();
                self.reply(&Envelope::pong());
                Ok(())
            }
            MessageType::Pong => {
                self.conn.heartbeat();
                Ok(())
            }
            // Server-originated types are never accepted from clients.
            kind @ (MessageType::Notification
            | MessageType::UserOnline
            | MessageType::UserOffline
            | MessageType::Error
            | MessageType::Unknown) => Err(HubError::UnsupportedType(kind)),
        }
    }

    async fn private_message(&mut self, envelope: Envelope) -> Result<(), HubError> {
        let sender = self.principal();
        let recipient = envelope
            .to
            .filter(|id| *id > 0)
            .ok_or(HubError::MissingTarget("recipient"))?;
        let content = validate_content(
            envelope.content.as_deref(),
            self.hub.config().max_content_chars,
        )?;

        self.hub.gate().check_private(sender, recipient).await?;

        let record = self
            .hub
            .store()
            .persist_private_message(sender, recipient, &content)
            .await
            .map_err(HubError::Persistence)?;

        let outbound = record.to_envelope();
        let frame = encode(&outbound)?;
        match self.hub.registry().addressable(recipient).await {
            Some(target) => {
                self.hub.deliver(&target, &frame, Delivery::Required);
            }
            None => tracing::debug!(sender, recipient, message_id = record.id, "recipient offline"),
        }

        let confirmation = outbound.with_data("message", serde_json::to_value(&record)?);
        self.reply(&confirmation);
        Ok(())
    }

    async fn group_message(&mut self, envelope: Envelope) -> Result<(), HubError> {
        let sender = self.principal();
        let group_id = envelope
            .group_id
            .filter(|id| *id > 0)
            .ok_or(HubError::MissingTarget("group_id"))?;
        let content = validate_content(
            envelope.content.as_deref(),
            self.hub.config().max_content_chars,
        )?;

        PrivacyGate::check_cached_member(&self.conn, group_id)?;

        let record = self
            .hub
            .store()
            .persist_group_message(group_id, sender, &content)
            .await
            .map_err(HubError::Persistence)?;

        let outbound = record.to_envelope();
        let frame = encode(&outbound)?;
        let mut delivered = 0usize;
        for peer in self.hub.registry().group_connections(group_id).await {
            if peer.principal() == sender {
                continue;
            }
            delivered += self.hub.deliver(&peer, &frame, Delivery::Required) as usize;
        }
        tracing::debug!(sender, group_id, message_id = record.id, delivered, "group message fanned out");

        let confirmation = outbound.with_data("message", serde_json::to_value(&record)?);
        self.reply(&confirmation);
        Ok(())
    }

    async fn typing(&mut self, envelope: Envelope) -> Result<(), HubError> {
        let sender = self.principal();
        let is_typing = envelope.data_bool("is_typing").unwrap_or(true);
        let target = match (envelope.group_id, envelope.to) {
            (Some(group_id), _) => {
                PrivacyGate::check_cached_member(&self.conn, group_id)?;
                TypingTarget::Group(group_id)
            }
            (None, Some(recipient)) => {
                self.hub.gate().check_private(sender, recipient).await?;
                TypingTarget::User(recipient)
            }
            (None, None) => return Err(HubError::MissingTarget("recipient or group_id")),
        };
        self.hub.route_typing(sender, target, is_typing).await?;
        Ok(())
    }

    async fn read_status(&mut self, envelope: Envelope) -> Result<(), HubError> {
        let reader = self.principal();
        let sender = envelope
            .to
            .filter(|id| *id > 0)
            .ok_or(HubError::MissingTarget("sender to acknowledge"))?;

        let count = self
            .hub
            .store()
            .mark_read(reader, sender)
            .await
            .map_err(HubError::Persistence)?;

        if count == 0 {
            return Ok(());
        }
        if let Some(conn) = self.hub.registry().addressable(sender).await {
            let receipt = Envelope::new(MessageType::ReadStatus, reader)
                .to_user(sender)
                .with_data("read_at", now_ms())
                .with_data("count", count);
            let frame = encode(&receipt)?;
            self.hub.deliver(&conn, &frame, Delivery::Required);
        }
        Ok(())
    }
}

/// Trimmed message body, rejected when empty or over `max_chars`.
fn validate_content(content: Option<&str>, max_chars: usize) -> Result<String, HubError> {
    let trimmed = content.unwrap_or_default().trim();
    if trimmed.is_empty() {
        return Err(HubError::EmptyContent);
    }
    if trimmed.chars().count() > max_chars {
        return Err(HubError::ContentTooLong { max: max_chars });
    }
    Ok(trimmed.to_string())
}

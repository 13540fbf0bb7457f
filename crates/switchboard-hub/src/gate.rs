use crate::connection::Connection;
use crate::error::HubError;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use switchboard_protocol::{GroupId, GroupMessageRecord, PrivateMessageRecord, UserId};

/// Relationship data the hub consults but never owns.
#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Whether `sender` may open or continue a private chat with `recipient`.
    async fn can_send_private(&self, sender: UserId, recipient: UserId) -> Result<bool>;

    async fn is_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool>;

    async fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupId>>;

    /// Users who should hear about `user_id` coming online or going offline.
    async fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_private_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
    ) -> Result<PrivateMessageRecord>;

    async fn persist_group_message(
        &self,
        group_id: GroupId,
        sender: UserId,
        content: &str,
    ) -> Result<GroupMessageRecord>;

    /// Mark every unread message from `sender` to `recipient` as read.
    /// Returns how many rows changed.
    async fn mark_read(&self, recipient: UserId, sender: UserId) -> Result<usize>;

    /// Oldest-first unread private messages addressed to `user_id`.
    async fn unread_backlog_for(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<PrivateMessageRecord>>;
}

/// Authorization checks applied before anything is persisted or routed.
#[derive(Clone)]
pub struct PrivacyGate {
    graph: Arc<dyn SocialGraph>,
}

impl PrivacyGate {
    pub fn new(graph: Arc<dyn SocialGraph>) -> Self {
        Self { graph }
    }

    /// Private-chat permission. Messaging yourself is always refused.
    pub async fn check_private(&self, sender: UserId, recipient: UserId) -> Result<(), HubError> {
        if sender == recipient {
            return Err(HubError::Forbidden(recipient));
        }
        match self.graph.can_send_private(sender, recipient).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HubError::Forbidden(recipient)),
            Err(e) => Err(HubError::Graph(e)),
        }
    }

    /// Group permission against the memberships cached on the connection.
    pub fn check_cached_member(conn: &Connection, group_id: GroupId) -> Result<(), HubError> {
        if conn.in_group(group_id) {
            Ok(())
        } else {
            Err(HubError::NotGroupMember(group_id))
        }
    }

    /// Group permission asked of the social graph directly, for callers
    /// that have no connection.
    pub async fn check_member(&self, group_id: GroupId, user_id: UserId) -> Result<(), HubError> {
        match self.graph.is_group_member(group_id, user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HubError::NotGroupMember(group_id)),
            Err(e) => Err(HubError::Graph(e)),
        }
    }
}

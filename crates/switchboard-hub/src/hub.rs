use crate::config::HubConfig;
use crate::connection::{CloseReason, Connection, Delivery, EnqueueError, Frame};
use crate::error::HubError;
use crate::gate::{MessageStore, PrivacyGate, SocialGraph};
use crate::presence;
use crate::registry::Registry;
use serde_json::Value;
use std::sync::Arc;
use switchboard_protocol::{Envelope, GroupId, MessageType, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of a successful handshake: an authenticated principal plus the
/// group memberships that will be cached on its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub principal: UserId,
    pub groups: Vec<GroupId>,
}

/// Destination of a typing indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTarget {
    User(UserId),
    Group(GroupId),
}

struct Register {
    conn: Arc<Connection>,
    ack: oneshot::Sender<()>,
}

struct Shared {
    registry: Registry,
    graph: Arc<dyn SocialGraph>,
    store: Arc<dyn MessageStore>,
    gate: PrivacyGate,
    config: HubConfig,
    register_tx: mpsc::UnboundedSender<Register>,
    unregister_tx: mpsc::UnboundedSender<Arc<Connection>>,
    broadcast_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
}

/// Cheap, cloneable handle to the hub.
///
/// Structural changes to the registry go through the event loop; reads and
/// per-connection delivery happen directly on the caller's task.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Spawn the event loop and return a handle to it.
    pub fn start(
        config: HubConfig,
        graph: Arc<dyn SocialGraph>,
        store: Arc<dyn MessageStore>,
    ) -> anyhow::Result<(Self, JoinHandle<()>)> {
        config.validate()?;

        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let hub = Hub {
            shared: Arc::new(Shared {
                registry: Registry::new(),
                gate: PrivacyGate::new(graph.clone()),
                graph,
                store,
                config,
                register_tx,
                unregister_tx,
                broadcast_tx,
                shutdown: CancellationToken::new(),
            }),
        };

        let event_loop = EventLoop {
            hub: hub.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let handle = tokio::spawn(event_loop.run());
        Ok((hub, handle))
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn gate(&self) -> &PrivacyGate {
        &self.shared.gate
    }

    pub(crate) fn graph(&self) -> &dyn SocialGraph {
        self.shared.graph.as_ref()
    }

    pub(crate) fn store(&self) -> &dyn MessageStore {
        self.shared.store.as_ref()
    }

    /// Load what a new connection needs before it can be registered.
    pub async fn handshake(&self, principal: UserId) -> Result<Handshake, HubError> {
        if principal <= 0 {
            return Err(HubError::Forbidden(principal));
        }
        let groups = self
            .shared
            .graph
            .list_groups_for_user(principal)
            .await
            .map_err(HubError::Graph)?;
        Ok(Handshake { principal, groups })
    }

    /// Create a connection and wait until the event loop has made it Active.
    pub async fn register(
        &self,
        handshake: Handshake,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Frame>), HubError> {
        let (conn, rx) = Connection::new(
            handshake.principal,
            handshake.groups,
            self.shared.config.outbound_capacity,
        );
        let (ack, registered) = oneshot::channel();
        self.shared
            .register_tx
            .send(Register {
                conn: conn.clone(),
                ack,
            })
            .map_err(|_| HubError::HubClosed)?;
        registered.await.map_err(|_| HubError::HubClosed)?;
        Ok((conn, rx))
    }

    /// Start closing `conn` and ask the loop to unregister it.
    ///
    /// Safe to call any number of times from any task.
    pub fn disconnect(&self, conn: &Arc<Connection>, reason: CloseReason) {
        conn.begin_closing(reason);
        let _ = self.shared.unregister_tx.send(conn.clone());
    }

    /// Non-blocking enqueue of one frame onto one connection.
    ///
    /// Returns whether the frame was queued.
    pub fn deliver(&self, conn: &Arc<Connection>, frame: &Frame, delivery: Delivery) -> bool {
        match conn.try_enqueue(frame.clone()) {
            Ok(()) => true,
            Err(EnqueueError::Closed) => false,
            Err(EnqueueError::Full) => {
                match delivery {
                    Delivery::BestEffort => {
                        tracing::debug!(
                            user_id = conn.principal(),
                            connection_id = %conn.id(),
                            "outbound queue full, dropping frame"
                        );
                    }
                    Delivery::Required => self.evict(conn),
                }
                false
            }
        }
    }

    fn evict(&self, conn: &Arc<Connection>) {
        if conn.begin_closing(CloseReason::SlowConsumer) {
            tracing::warn!(
                user_id = conn.principal(),
                connection_id = %conn.id(),
                "outbound queue overflowed, evicting slow consumer"
            );
            let _ = self.shared.unregister_tx.send(conn.clone());
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.shared.registry.is_online(user_id).await
    }

    pub async fn list_online(&self) -> Vec<UserId> {
        self.shared.registry.online_users().await
    }

    pub async fn list_online_group_members(&self, group_id: GroupId) -> Vec<UserId> {
        self.shared.registry.online_group_members(group_id).await
    }

    /// Queue a server-originated notification for `user_id`.
    ///
    /// Dropped by the loop if the user has no addressable connection.
    pub fn push_notification(&self, user_id: UserId, payload: Value) -> Result<(), HubError> {
        let envelope = Envelope::new(MessageType::Notification, 0)
            .to_user(user_id)
            .with_data("payload", payload);
        self.shared
            .broadcast_tx
            .send(envelope)
            .map_err(|_| HubError::HubClosed)
    }

    /// Typing indicator raised outside a socket, checked against the social
    /// graph rather than a connection's cached memberships.
    ///
    /// Returns the number of connections that received it.
    pub async fn broadcast_typing(
        &self,
        sender: UserId,
        target: TypingTarget,
        is_typing: bool,
    ) -> Result<usize, HubError> {
        match target {
            TypingTarget::User(recipient) => {
                self.shared.gate.check_private(sender, recipient).await?
            }
            TypingTarget::Group(group_id) => self.shared.gate.check_member(group_id, sender).await?,
        }
        self.route_typing(sender, target, is_typing).await
    }

    /// Fan a typing indicator out without further checks. Never evicts.
    pub(crate) async fn route_typing(
        &self,
        sender: UserId,
        target: TypingTarget,
        is_typing: bool,
    ) -> Result<usize, HubError> {
        let envelope = Envelope::new(MessageType::Typing, sender).with_data("is_typing", is_typing);
        let mut delivered = 0;
        match target {
            TypingTarget::User(recipient) => {
                let frame = encode(&envelope.to_user(recipient))?;
                if let Some(conn) = self.shared.registry.addressable(recipient).await {
                    delivered += self.deliver(&conn, &frame, Delivery::BestEffort) as usize;
                }
            }
            TypingTarget::Group(group_id) => {
                let frame = encode(&envelope.in_group(group_id))?;
                for conn in self.shared.registry.group_connections(group_id).await {
                    if conn.principal() == sender {
                        continue;
                    }
                    delivered += self.deliver(&conn, &frame, Delivery::BestEffort) as usize;
                }
            }
        }
        Ok(delivered)
    }

    /// Stop the event loop. Every registered connection is closed.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

pub(crate) fn encode(envelope: &Envelope) -> Result<Frame, HubError> {
    Ok(Frame::from(envelope.encode()?))
}

/// The single task that owns registry mutation.
struct EventLoop {
    hub: Hub,
    register_rx: mpsc::UnboundedReceiver<Register>,
    unregister_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    broadcast_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EventLoop {
    async fn run(mut self) {
        tracing::info!("hub event loop started");
        let shutdown = self.hub.shared.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(register) = self.register_rx.recv() => self.on_register(register).await,
                Some(conn) = self.unregister_rx.recv() => self.on_unregister(conn).await,
                Some(envelope) = self.broadcast_rx.recv() => self.on_broadcast(envelope).await,
                else => break,
            }
        }

        let remaining = self.hub.shared.registry.drain().await;
        for conn in &remaining {
            conn.begin_closing(CloseReason::Shutdown);
        }
        tracing::info!(closed = remaining.len(), "hub event loop stopped");
    }

    async fn on_register(&self, register: Register) {
        let Register { conn, ack } = register;
        let registry = &self.hub.shared.registry;
        let user_id = conn.principal();

        let superseded = registry.insert(conn.clone()).await;
        if let Some(previous) = &superseded {
            previous.begin_closing(CloseReason::Superseded);
            tracing::info!(
                user_id,
                connection_id = %previous.id(),
                "connection superseded by a newer one"
            );
        }

        if ack.send(()).is_err() {
            // The handshake gave up while waiting; nobody will ever unregister this.
            registry.remove(&conn).await;
            conn.begin_closing(CloseReason::ClientClosed);
            return;
        }

        tracing::info!(
            user_id,
            connection_id = %conn.id(),
            groups = conn.groups().len(),
            "connection registered"
        );

        let hub = self.hub.clone();
        let was_online = superseded.is_some();
        tokio::spawn(async move {
            if !was_online {
                presence::announce_online(&hub, &conn).await;
            }
            presence::replay_backlog(&hub, &conn).await;
        });
    }

    async fn on_unregister(&self, conn: Arc<Connection>) {
        let removal = self.hub.shared.registry.remove(&conn).await;
        conn.begin_closing(CloseReason::ClientClosed);
        if !removal.was_registered {
            return;
        }

        let user_id = conn.principal();
        tracing::info!(
            user_id,
            connection_id = %conn.id(),
            reason = %conn.close_reason().unwrap_or(CloseReason::ClientClosed),
            "connection unregistered"
        );

        if removal.was_addressable {
            let hub = self.hub.clone();
            tokio::spawn(async move {
                presence::announce_offline(&hub, user_id).await;
            });
        }
    }

    async fn on_broadcast(&self, envelope: Envelope) {
        let (MessageType::Notification, Some(user_id)) = (envelope.kind, envelope.to) else {
            tracing::warn!(kind = %envelope.kind, "dropping broadcast with no route");
            return;
        };
        let frame = match encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to encode notification");
                return;
            }
        };
        match self.hub.shared.registry.addressable(user_id).await {
            Some(conn) => {
                self.hub.deliver(&conn, &frame, Delivery::Required);
            }
            None => tracing::debug!(user_id, "notification target offline, dropping"),
        }
    }
}

use crate::connection::{Connection, ConnectionId};
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_protocol::{GroupId, UserId};
use tokio::sync::RwLock;

#[derive(Default)]
struct Indices {
    active: HashMap<ConnectionId, Arc<Connection>>,
    /// The single addressable connection per user.
    by_user: HashMap<UserId, Arc<Connection>>,
    by_group: HashMap<GroupId, HashMap<ConnectionId, Arc<Connection>>>,
}

impl Indices {
    /// Drop `conn` from the active and group indices, leaving `by_user` alone.
    fn detach(&mut self, conn: &Connection) -> bool {
        let was_active = self.active.remove(&conn.id()).is_some();
        for group_id in conn.groups() {
            if let Some(members) = self.by_group.get_mut(group_id) {
                members.remove(&conn.id());
                if members.is_empty() {
                    self.by_group.remove(group_id);
                }
            }
        }
        was_active
    }
}

/// Outcome of removing a connection from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    /// The connection was present in the active index.
    pub was_registered: bool,
    /// The connection was its user's addressable connection.
    pub was_addressable: bool,
}

/// In-memory index of live connections.
///
/// Mutated only by the hub loop; every other task gets read access. One
/// lock covers all three indices so a reader never sees a connection in
/// one index but not another.
#[derive(Default)]
pub struct Registry {
    indices: RwLock<Indices>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection into every index.
    ///
    /// Returns the connection it replaced as its user's addressable
    /// connection, already detached from all indices.
    pub(crate) async fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut ix = self.indices.write().await;
        let previous = ix
            .by_user
            .insert(conn.principal(), conn.clone())
            .filter(|prev| prev.id() != conn.id());
        if let Some(prev) = &previous {
            ix.detach(prev);
        }
        ix.active.insert(conn.id(), conn.clone());
        for group_id in conn.groups() {
            ix.by_group
                .entry(*group_id)
                .or_default()
                .insert(conn.id(), conn.clone());
        }
        previous
    }

    /// Remove a connection. The user entry is only cleared when it still
    /// points at this very connection.
    pub(crate) async fn remove(&self, conn: &Connection) -> Removal {
        let mut ix = self.indices.write().await;
        let was_registered = ix.detach(conn);
        let was_addressable = ix
            .by_user
            .get(&conn.principal())
            .is_some_and(|current| current.id() == conn.id());
        if was_addressable {
            ix.by_user.remove(&conn.principal());
        }
        Removal {
            was_registered,
            was_addressable,
        }
    }

    /// Empty every index, returning the connections that were active.
    pub(crate) async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut ix = self.indices.write().await;
        ix.by_user.clear();
        ix.by_group.clear();
        ix.active.drain().map(|(_, conn)| conn).collect()
    }

    pub async fn addressable(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.indices.read().await.by_user.get(&user_id).cloned()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.indices.read().await.by_user.contains_key(&user_id)
    }

    /// Users with an addressable connection, ascending.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.indices.read().await.by_user.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Snapshot of the connections whose cached memberships include `group_id`.
    pub async fn group_connections(&self, group_id: GroupId) -> Vec<Arc<Connection>> {
        self.indices
            .read()
            .await
            .by_group
            .get(&group_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct users online in `group_id`, ascending.
    pub async fn online_group_members(&self, group_id: GroupId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .group_connections(group_id)
            .await
            .iter()
            .map(|conn| conn.principal())
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.indices.read().await.active.contains_key(&id)
    }

    pub async fn connection_count(&self) -> usize {
        self.indices.read().await.active.len()
    }
}

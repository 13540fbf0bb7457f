use axum::extract::ws::Utf8Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use switchboard_protocol::{GroupId, UserId, now_ms};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// An encoded envelope. Cloning is cheap, so one encoding is shared by
/// every queue a fan-out reaches.
pub type Frame = Utf8Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Active,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    /// Outbound queue overflowed on a delivery that could not be dropped.
    SlowConsumer,
    /// The same user registered a newer connection.
    Superseded,
    /// The reader task panicked.
    Internal,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::TransportError => "transport error",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Superseded => "superseded",
            CloseReason::Internal => "internal error",
            CloseReason::Shutdown => "server shutting down",
        }
    }

    /// WebSocket close code sent to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::TransportError | CloseReason::Internal => 1011,
            CloseReason::Superseded => 4000,
            CloseReason::HeartbeatTimeout => 4002,
            CloseReason::SlowConsumer => 4008,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a full outbound queue is handled for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Overflow evicts the connection.
    Required,
    /// Overflow drops the frame.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

/// One live client session.
///
/// Owned jointly by the registry and the connection's reader and writer
/// tasks. Everything mutable is atomic so the hub loop never has to lock a
/// connection to route to it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    principal: UserId,
    /// Group memberships captured at registration. Never refreshed.
    groups: HashSet<GroupId>,
    outbound: mpsc::Sender<Frame>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    connected_at_ms: u64,
    last_activity_ms: AtomicU64,
    created: Instant,
    /// Offset from `created` of the most recent heartbeat, in ms.
    last_heartbeat: AtomicU64,
}

impl Connection {
    pub fn new(
        principal: UserId,
        groups: impl IntoIterator<Item = GroupId>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let now = now_ms();
        let conn = Self {
            id: Uuid::new_v4(),
            principal,
            groups: groups.into_iter().collect(),
            outbound,
            state: AtomicU8::new(ConnectionState::Active as u8),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            connected_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            created: Instant::now(),
            last_heartbeat: AtomicU64::new(0),
        };
        (Arc::new(conn), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> UserId {
        self.principal
    }

    pub fn groups(&self) -> &HashSet<GroupId> {
        &self.groups
    }

    pub fn in_group(&self, group_id: GroupId) -> bool {
        self.groups.contains(&group_id)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Record a heartbeat, pushing the read deadline out by `pong_wait`.
    pub fn heartbeat(&self) {
        let offset = self.created.elapsed().as_millis() as u64;
        self.last_heartbeat.store(offset, Ordering::Relaxed);
    }

    /// Instant by which the next heartbeat or frame must arrive.
    pub fn read_deadline(&self, pong_wait: Duration) -> Instant {
        let offset = Duration::from_millis(self.last_heartbeat.load(Ordering::Relaxed));
        self.created + offset + pong_wait
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub(crate) fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if !self.is_active() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Move Active -> Closing and wake the writer.
    ///
    /// Only the first caller wins; later calls return false and keep the
    /// original reason.
    pub(crate) fn begin_closing(&self, reason: CloseReason) -> bool {
        let won = self
            .state
            .compare_exchange(
                ConnectionState::Active as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            let _ = self.close_reason.set(reason);
            self.cancel.cancel();
        }
        won
    }

    pub(crate) fn mark_closed(&self) {
        // A connection that never saw begin_closing still needs its writer stopped.
        if self.close_reason.get().is_none() {
            let _ = self.close_reason.set(CloseReason::ClientClosed);
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
    }

    /// Resolves once the connection has started closing.
    pub fn closing(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::from(text.to_string())
    }

    #[tokio::test]
    async fn enqueue_reports_full_queue() {
        let (conn, mut rx) = Connection::new(1, [10, 20], 2);
        assert!(conn.in_group(10));
        assert!(!conn.in_group(30));

        conn.try_enqueue(frame("a")).unwrap();
        conn.try_enqueue(frame("b")).unwrap();
        assert_eq!(conn.try_enqueue(frame("c")), Err(EnqueueError::Full));

        assert_eq!(rx.recv().await.unwrap().as_str(), "a");
        conn.try_enqueue(frame("c")).unwrap();
    }

    #[tokio::test]
    async fn first_close_reason_wins() {
        let (conn, _rx) = Connection::new(1, [], 4);
        assert!(conn.begin_closing(CloseReason::SlowConsumer));
        assert!(!conn.begin_closing(CloseReason::ClientClosed));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));

        // Closing connections accept no more frames.
        assert_eq!(conn.try_enqueue(frame("x")), Err(EnqueueError::Closed));

        // The writer wake-up has already fired.
        conn.closing().await;

        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[tokio::test]
    async fn dropped_receiver_reads_as_closed() {
        let (conn, rx) = Connection::new(1, [], 4);
        drop(rx);
        assert_eq!(conn.try_enqueue(frame("x")), Err(EnqueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pushes_read_deadline() {
        let (conn, _rx) = Connection::new(1, [], 4);
        let wait = Duration::from_secs(60);
        let first = conn.read_deadline(wait);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(conn.read_deadline(wait), first);

        conn.heartbeat();
        let second = conn.read_deadline(wait);
        assert!(second >= first + Duration::from_secs(29));
    }
}

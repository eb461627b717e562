use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// A serialized outbound frame. Cheap to clone, so fan-out encodes once.
pub type Payload = Utf8Bytes;

/// Outbound queue depth per connection.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Number of independently locked partitions of the connection map.
pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub queue_depth: usize,
    pub shards: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Result of a single best-effort send. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued for the connection's writer; no end-to-end ack.
    Queued,
    /// No live connection for the user.
    DroppedOffline,
    /// The outbound queue is full; the connection stays open.
    DroppedBackpressure,
}

/// Per-recipient tally of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub queued: usize,
    pub offline: usize,
    pub backpressure: usize,
}

impl FanoutReport {
    pub fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Queued => self.queued += 1,
            SendOutcome::DroppedOffline => self.offline += 1,
            SendOutcome::DroppedBackpressure => self.backpressure += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.queued + self.offline + self.backpressure
    }
}

/// Cumulative counters since the registry was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub queued: u64,
    pub dropped_offline: u64,
    pub dropped_backpressure: u64,
    pub superseded: u64,
}

/// The registry's side of one live connection: the sending half of its
/// outbound queue plus the token that tears down its read loop.
///
/// Dropping it closes the queue, which ends the connection's write loop once
/// the frames already queued have been written.
pub struct Connection {
    id: Uuid,
    tx: mpsc::Sender<Payload>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Returns the connection and the receiving half its write loop drains.
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            tx,
            shutdown: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the connection is superseded, unregistered or shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn close(self) {
        self.shutdown.cancel();
        // `self.tx` drops here, closing the queue.
    }
}

/// Tracks the one live connection per user id.
///
/// Register/unregister take a shard's write lock only for the map update;
/// lookup and send take the read lock. No lock is held across I/O or `.await`.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    shards: Box<[RwLock<HashMap<Uuid, Connection>>]>,
    hasher: RandomState,
    queue_depth: usize,

    queued: AtomicU64,
    dropped_offline: AtomicU64,
    dropped_backpressure: AtomicU64,
    superseded: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(RegistryInner {
                shards,
                hasher: RandomState::new(),
                queue_depth: config.queue_depth.max(1),
                queued: AtomicU64::new(0),
                dropped_offline: AtomicU64::new(0),
                dropped_backpressure: AtomicU64::new(0),
                superseded: AtomicU64::new(0),
            }),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth
    }

    /// Install `conn` for `user_id`. An existing connection for the same user is
    /// closed first (its queue closed, its token cancelled).
    pub fn register(&self, user_id: Uuid, conn: Connection) {
        let conn_id = conn.id;
        let superseded = {
            let mut shard = self.write_shard(user_id);
            let previous = shard.remove(&user_id);
            let superseded = previous.as_ref().map(|p| p.id);
            if let Some(previous) = previous {
                previous.close();
            }
            shard.insert(user_id, conn);
            superseded
        };

        if let Some(old_id) = superseded {
            self.inner.superseded.fetch_add(1, Ordering::Relaxed);
            info!("Connection {} for {} superseded by {}", old_id, user_id, conn_id);
        } else {
            debug!("Connection {} registered for {}", conn_id, user_id);
        }
    }

    /// Remove the entry for `user_id`, but only if it is still `conn_id`.
    /// Returns whether anything was removed.
    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let removed = {
            let mut shard = self.write_shard(user_id);
            let is_current = shard.get(&user_id).is_some_and(|c| c.id == conn_id);
            if is_current { shard.remove(&user_id) } else { None }
        };

        match removed {
            Some(conn) => {
                conn.close();
                debug!("Connection {} unregistered for {}", conn_id, user_id);
                true
            }
            None => false,
        }
    }

    /// The id of the user's live connection, if any.
    pub fn lookup(&self, user_id: Uuid) -> Option<Uuid> {
        self.read_shard(user_id).get(&user_id).map(|c| c.id)
    }

    /// Best-effort, non-blocking enqueue.
    pub fn send(&self, user_id: Uuid, payload: Payload) -> SendOutcome {
        let outcome = {
            let shard = self.read_shard(user_id);
            match shard.get(&user_id) {
                None => SendOutcome::DroppedOffline,
                Some(conn) => match conn.tx.try_send(payload) {
                    Ok(()) => SendOutcome::Queued,
                    Err(TrySendError::Full(_)) => SendOutcome::DroppedBackpressure,
                    // Writer already gone; teardown will remove the entry.
                    Err(TrySendError::Closed(_)) => SendOutcome::DroppedOffline,
                },
            }
        };

        match outcome {
            SendOutcome::Queued => {
                self.inner.queued.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::DroppedOffline => {
                self.inner.dropped_offline.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped frame for {}: offline", user_id);
            }
            SendOutcome::DroppedBackpressure => {
                self.inner.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped frame for {}: outbound queue full", user_id);
            }
        }
        outcome
    }

    /// Send the same payload to every user in `user_ids`, independently.
    pub fn send_many<I>(&self, user_ids: I, payload: &Payload) -> FanoutReport
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut report = FanoutReport::default();
        for user_id in user_ids {
            report.record(self.send(user_id, payload.clone()));
        }
        report
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            dropped_offline: self.inner.dropped_offline.load(Ordering::Relaxed),
            dropped_backpressure: self.inner.dropped_backpressure.load(Ordering::Relaxed),
            superseded: self.inner.superseded.load(Ordering::Relaxed),
        }
    }

    /// Close and remove every connection. Each connection's loops then run
    /// their normal teardown.
    pub fn shutdown(&self) {
        let mut closed = 0;
        for shard in self.inner.shards.iter() {
            let drained: Vec<Connection> = {
                let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
                shard.drain().map(|(_, conn)| conn).collect()
            };
            closed += drained.len();
            drained.into_iter().for_each(Connection::close);
        }
        info!("Connection registry shut down, closed {} connections", closed);
    }

    fn shard_for(&self, user_id: Uuid) -> &RwLock<HashMap<Uuid, Connection>> {
        let idx = self.inner.hasher.hash_one(user_id) as usize % self.inner.shards.len();
        &self.inner.shards[idx]
    }

    // Registry operations never fail: a poisoned shard still holds a valid map.
    fn read_shard(&self, user_id: Uuid) -> RwLockReadGuard<'_, HashMap<Uuid, Connection>> {
        self.shard_for(user_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, user_id: Uuid) -> RwLockWriteGuard<'_, HashMap<Uuid, Connection>> {
        self.shard_for(user_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

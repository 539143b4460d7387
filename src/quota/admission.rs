//! Admission Core
//!
//! One tokio task owns the [`QuotaTable`], every live lease, and the FIFO
//! wait queues. All other components reach it through an [`AdmissionHandle`]
//! over an mpsc channel, so quota decisions are serialized without any
//! shared-state locking.
//!
//! Admission algorithm, per category pair:
//! 1. If the pair's queue is empty and both reservations fit, grant
//!    immediately.
//! 2. Otherwise enqueue at the tail; the caller's future suspends on a
//!    oneshot until promoted.
//! 3. Every release re-evaluates the queue head; heads are popped and
//!    granted for as long as their full pair reservation fits. A request at
//!    the head is granted at the first moment capacity suffices.
//!
//! A request that could never fit an empty table is rejected up front
//! rather than queued forever.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::table::QuotaTable;
use super::{AccessMode, Category};
use crate::error::GovernorError;
use crate::protocol::{CategoryStatus, GovernorStatus};

/// Identifies one worker connection.
pub type ConnId = Uuid;

type AcquireReply = oneshot::Sender<Result<(), GovernorError>>;

enum Command {
    Acquire {
        conn: ConnId,
        mode: AccessMode,
        reqs: u64,
        bytes: u64,
        request_id: u64,
        reply: AcquireReply,
    },
    Release {
        conn: ConnId,
        mode: AccessMode,
        request_id: u64,
    },
    Disconnect {
        conn: ConnId,
    },
    Status {
        reply: oneshot::Sender<GovernorStatus>,
    },
}

/// A granted reservation held on behalf of one connection.
#[derive(Debug, Clone, Copy)]
struct Lease {
    mode: AccessMode,
    reqs: u64,
    bytes: u64,
}

/// A queued acquire waiting for capacity.
struct Pending {
    conn: ConnId,
    mode: AccessMode,
    reqs: u64,
    bytes: u64,
    request_id: u64,
    reply: AcquireReply,
}

/// Cloneable handle to the admission task.
///
/// Dropping every handle shuts the task down; queued acquirers then see
/// their oneshot closed and fail with a protocol error.
#[derive(Debug, Clone)]
pub struct AdmissionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AdmissionHandle {
    /// Spawn the admission task over a configured table.
    pub fn spawn(table: QuotaTable) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = AdmissionCore {
            table,
            queues: HashMap::new(),
            leases: HashMap::new(),
        };
        tokio::spawn(core.run(rx));
        Self { tx }
    }

    /// Reserve the category pair for one operation, suspending until
    /// granted. `request_id` must be unique within the connection.
    pub async fn acquire(
        &self,
        conn: ConnId,
        mode: AccessMode,
        reqs: u64,
        bytes: u64,
        request_id: u64,
    ) -> Result<(), GovernorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Acquire {
                conn,
                mode,
                reqs,
                bytes,
                request_id,
                reply,
            })
            .map_err(|_| GovernorError::Protocol("Admission core is gone".to_string()))?;
        rx.await
            .map_err(|_| GovernorError::Protocol("Admission core dropped the request".to_string()))?
    }

    /// Release a granted lease. Never blocks.
    pub fn release(&self, conn: ConnId, mode: AccessMode, request_id: u64) {
        let _ = self.tx.send(Command::Release {
            conn,
            mode,
            request_id,
        });
    }

    /// Release every lease and remove every pending request of a
    /// connection. Never blocks.
    pub fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(Command::Disconnect { conn });
    }

    /// A handle whose admission task is already gone; every call fails.
    #[cfg(test)]
    pub(crate) fn defunct() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Snapshot capacities, outstanding usage, and queue depths.
    pub async fn status(&self) -> Result<GovernorStatus, GovernorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .map_err(|_| GovernorError::Protocol("Admission core is gone".to_string()))?;
        rx.await
            .map_err(|_| GovernorError::Protocol("Admission core dropped the request".to_string()))
    }
}

struct AdmissionCore {
    table: QuotaTable,
    /// FIFO wait queue per category pair
    queues: HashMap<AccessMode, VecDeque<Pending>>,
    /// Authoritative lease state, keyed by owner connection and request id
    leases: HashMap<(ConnId, u64), Lease>,
}

impl AdmissionCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Acquire {
                    conn,
                    mode,
                    reqs,
                    bytes,
                    request_id,
                    reply,
                } => self.handle_acquire(Pending {
                    conn,
                    mode,
                    reqs,
                    bytes,
                    request_id,
                    reply,
                }),
                Command::Release {
                    conn,
                    mode,
                    request_id,
                } => self.handle_release(conn, mode, request_id),
                Command::Disconnect { conn } => self.handle_disconnect(conn),
                Command::Status { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        debug!("Admission core stopping; all handles dropped");
    }

    fn handle_acquire(&mut self, pending: Pending) {
        // A request larger than the total capacity can never be granted;
        // reject now instead of queueing forever.
        if let Err(err) = self.check_satisfiable(&pending) {
            let _ = pending.reply.send(Err(err));
            return;
        }

        let queue_empty = self
            .queues
            .get(&pending.mode)
            .map_or(true, VecDeque::is_empty);

        // Newcomers go behind existing waiters even when they would fit,
        // preserving strict arrival order within the pair.
        if queue_empty && self.pair_fits(&pending) {
            self.grant(pending);
        } else {
            debug!(
                mode = %pending.mode,
                bytes = pending.bytes,
                request_id = pending.request_id,
                "Queueing acquire; capacity exhausted"
            );
            self.queues.entry(pending.mode).or_default().push_back(pending);
        }
    }

    fn check_satisfiable(&self, pending: &Pending) -> Result<(), GovernorError> {
        for (category, requested) in [
            (pending.mode.request_category(), pending.reqs),
            (pending.mode.data_category(), pending.bytes),
        ] {
            if !self.table.can_ever_fit(category, requested) {
                return Err(GovernorError::CapacityUnsatisfiable {
                    category,
                    requested,
                    capacity: self.table.capacity(category),
                });
            }
        }
        Ok(())
    }

    fn pair_fits(&self, pending: &Pending) -> bool {
        self.table.fits(pending.mode.request_category(), pending.reqs)
            && self.table.fits(pending.mode.data_category(), pending.bytes)
    }

    /// Reserve both categories and resolve the caller. The pair check has
    /// already passed, so both reservations succeed together.
    fn grant(&mut self, pending: Pending) {
        let Pending {
            conn,
            mode,
            reqs,
            bytes,
            request_id,
            reply,
        } = pending;

        let reserved_reqs = self.table.try_reserve(mode.request_category(), reqs);
        let reserved_bytes = self.table.try_reserve(mode.data_category(), bytes);
        debug_assert!(reserved_reqs && reserved_bytes, "pair check preceded grant");

        if reply.send(Ok(())).is_err() {
            // Caller went away between queueing and grant; undo.
            self.table.release(mode.request_category(), reqs);
            self.table.release(mode.data_category(), bytes);
            return;
        }

        debug!(mode = %mode, bytes, request_id, "Granted acquire");
        self.leases
            .insert((conn, request_id), Lease { mode, reqs, bytes });
    }

    fn handle_release(&mut self, conn: ConnId, mode: AccessMode, request_id: u64) {
        match self.leases.remove(&(conn, request_id)) {
            Some(lease) => {
                self.table.release(lease.mode.request_category(), lease.reqs);
                self.table.release(lease.mode.data_category(), lease.bytes);
                self.promote(lease.mode);
            }
            None => {
                // Releases racing a disconnect cleanup land here; harmless.
                warn!(%conn, %mode, request_id, "Release for unknown lease ignored");
            }
        }
    }

    fn handle_disconnect(&mut self, conn: ConnId) {
        let mut released = 0usize;
        let owned: Vec<(ConnId, u64)> = self
            .leases
            .keys()
            .filter(|(owner, _)| *owner == conn)
            .copied()
            .collect();
        for key in owned {
            if let Some(lease) = self.leases.remove(&key) {
                self.table.release(lease.mode.request_category(), lease.reqs);
                self.table.release(lease.mode.data_category(), lease.bytes);
                released += 1;
            }
        }

        let mut dequeued = 0usize;
        for queue in self.queues.values_mut() {
            let before = queue.len();
            queue.retain(|pending| pending.conn != conn);
            dequeued += before - queue.len();
        }

        if released > 0 || dequeued > 0 {
            debug!(%conn, released, dequeued, "Cleaned up after disconnect");
        }

        for mode in AccessMode::ALL {
            self.promote(mode);
        }
    }

    /// Grant from the head of a pair's queue for as long as capacity
    /// suffices, preserving FIFO order.
    fn promote(&mut self, mode: AccessMode) {
        loop {
            let Some(queue) = self.queues.get_mut(&mode) else {
                return;
            };
            let Some(head) = queue.front() else {
                return;
            };

            if head.reply.is_closed() {
                // Abandoned waiter (caller timed out or died); discard.
                queue.pop_front();
                continue;
            }

            let fits = self.table.fits(mode.request_category(), head.reqs)
                && self.table.fits(mode.data_category(), head.bytes);
            if !fits {
                return;
            }

            let pending = queue.pop_front().expect("head checked above");
            self.grant(pending);
        }
    }

    fn snapshot(&self) -> GovernorStatus {
        let category = |cat: Category| CategoryStatus {
            capacity: self.table.capacity(cat),
            in_use: self.table.in_use(cat),
        };
        GovernorStatus {
            read_reqs: category(Category::ReadRequests),
            read_data: category(Category::ReadBytes),
            write_reqs: category(Category::WriteRequests),
            write_data: category(Category::WriteBytes),
            read_queued: self
                .queues
                .get(&AccessMode::Read)
                .map_or(0, VecDeque::len),
            write_queued: self
                .queues
                .get(&AccessMode::Write)
                .map_or(0, VecDeque::len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn conn() -> ConnId {
        Uuid::new_v4()
    }

    fn handle_with(read_reqs: u64, read_data: u64) -> AdmissionHandle {
        let mut table = QuotaTable::new();
        table.configure(Category::ReadRequests, read_reqs);
        table.configure(Category::ReadBytes, read_data);
        AdmissionHandle::spawn(table)
    }

    async fn granted(handle: &AdmissionHandle, conn: ConnId, bytes: u64, id: u64) {
        timeout(
            Duration::from_secs(1),
            handle.acquire(conn, AccessMode::Read, 1, bytes, id),
        )
        .await
        .expect("acquire should not block")
        .expect("acquire should be granted");
    }

    #[tokio::test]
    async fn test_grant_within_capacity() {
        let handle = handle_with(2, 0);
        let worker = conn();
        granted(&handle, worker, 100, 1).await;
        granted(&handle, worker, 100, 2).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.read_reqs.in_use, 2);
        assert_eq!(status.read_data.in_use, 200);
    }

    #[tokio::test]
    async fn test_third_acquire_queues_and_is_promoted() {
        let handle = handle_with(2, 0);
        let worker = conn();
        granted(&handle, worker, 10, 1).await;
        granted(&handle, worker, 10, 2).await;

        // Third acquire must block while both slots are held
        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(worker, AccessMode::Read, 1, 10, 3).await })
        };
        tokio::task::yield_now().await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.read_queued, 1);

        // Releasing one grant promotes the queued request
        handle.release(worker, AccessMode::Read, 1);
        let result = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("promotion should happen promptly")
            .unwrap();
        assert!(result.is_ok());

        let status = handle.status().await.unwrap();
        assert_eq!(status.read_reqs.in_use, 2);
        assert_eq!(status.read_queued, 0);
    }

    #[tokio::test]
    async fn test_fifo_order_regardless_of_size() {
        let handle = handle_with(0, 100);
        let worker = conn();
        granted(&handle, worker, 100, 1).await;

        // Queue a large request, then a small one that would fit right now.
        let large = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(worker, AccessMode::Read, 1, 80, 2).await })
        };
        tokio::task::yield_now().await;
        let small = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(worker, AccessMode::Read, 1, 10, 3).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(handle.status().await.unwrap().read_queued, 2);

        // Free everything: the large head must be granted before the small.
        handle.release(worker, AccessMode::Read, 1);
        timeout(Duration::from_secs(1), large)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Small fits alongside large (80 + 10 <= 100)
        timeout(Duration::from_secs(1), small)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_small_request_does_not_jump_queue() {
        let handle = handle_with(0, 100);
        let worker = conn();
        granted(&handle, worker, 50, 1).await;

        // Head needs 80, does not fit while 50 is held.
        let head = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(worker, AccessMode::Read, 1, 80, 2).await })
        };
        tokio::task::yield_now().await;

        // 10 would fit immediately, but must wait behind the head.
        let late = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(worker, AccessMode::Read, 1, 10, 3).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(handle.status().await.unwrap().read_queued, 2);
        assert_eq!(handle.status().await.unwrap().read_data.in_use, 50);

        handle.release(worker, AccessMode::Read, 1);
        timeout(Duration::from_secs(1), head).await.unwrap().unwrap().unwrap();
        timeout(Duration::from_secs(1), late).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_immediately() {
        let handle = handle_with(0, 100);
        let result = handle.acquire(conn(), AccessMode::Read, 1, 101, 1).await;
        match result {
            Err(GovernorError::CapacityUnsatisfiable {
                category,
                requested,
                capacity,
            }) => {
                assert_eq!(category, Category::ReadBytes);
                assert_eq!(requested, 101);
                assert_eq!(capacity, 100);
            }
            other => panic!("Expected CapacityUnsatisfiable, got {other:?}"),
        }
        assert_eq!(handle.status().await.unwrap().read_queued, 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_leases_and_pending() {
        let handle = handle_with(2, 0);
        let dying = conn();
        let survivor = conn();

        granted(&handle, dying, 10, 1).await;
        granted(&handle, dying, 10, 2).await;

        let queued = {
            let handle = handle.clone();
            tokio::spawn(
                async move { handle.acquire(survivor, AccessMode::Read, 1, 10, 1).await },
            )
        };
        tokio::task::yield_now().await;
        assert_eq!(handle.status().await.unwrap().read_queued, 1);

        // Disconnect frees both leases; the survivor is promoted.
        handle.disconnect(dying);
        timeout(Duration::from_secs(1), queued)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.read_reqs.in_use, 1);
        assert_eq!(status.read_queued, 0);
    }

    #[tokio::test]
    async fn test_disconnect_while_queued_leaves_no_trace() {
        let handle = handle_with(1, 0);
        let holder = conn();
        let waiter = conn();
        granted(&handle, holder, 10, 1).await;

        let queued = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire(waiter, AccessMode::Read, 1, 10, 1).await })
        };
        tokio::task::yield_now().await;
        handle.disconnect(waiter);
        // The waiter's acquire fails rather than hanging
        let result = timeout(Duration::from_secs(1), queued).await.unwrap().unwrap();
        assert!(result.is_err());

        handle.release(holder, AccessMode::Read, 1);
        let status = handle.status().await.unwrap();
        assert_eq!(status.read_reqs.in_use, 0);
        assert_eq!(status.read_queued, 0);
    }

    #[tokio::test]
    async fn test_release_of_unknown_lease_ignored() {
        let handle = handle_with(2, 0);
        handle.release(conn(), AccessMode::Read, 99);
        let status = handle.status().await.unwrap();
        assert_eq!(status.read_reqs.in_use, 0);
    }

    #[tokio::test]
    async fn test_read_and_write_pairs_are_independent() {
        let mut table = QuotaTable::new();
        table.configure(Category::ReadRequests, 1);
        table.configure(Category::WriteRequests, 1);
        let handle = AdmissionHandle::spawn(table);
        let worker = conn();

        granted(&handle, worker, 0, 1).await;
        // A full read pair must not block a write acquire
        timeout(
            Duration::from_secs(1),
            handle.acquire(worker, AccessMode::Write, 1, 0, 2),
        )
        .await
        .expect("write acquire should not block")
        .unwrap();
    }
}

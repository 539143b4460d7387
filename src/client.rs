//! Client Library
//!
//! Used inside each worker process. Wraps one I/O call as acquire, perform
//! operation, release, with release guaranteed on every exit path: a granted
//! [`Lease`] sends its release from `Drop`, so early returns, errors, and
//! panics all return capacity.
//!
//! Availability over strictness: if the governor is unreachable at connect
//! time the client *falls open*. It proceeds without throttling and logs a
//! warning, rather than blocking the entire distributed job on
//! infrastructure unavailability.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::GovernorError;
use crate::protocol::{self, GovernorStatus, Request, Response};
use crate::quota::AccessMode;

/// Default time to wait for the initial connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time to wait for an acquire to be granted
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables for a [`GovernorClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// How long to wait for the initial TCP connection before falling open
    pub connect_timeout: Duration,

    /// How long an acquire may wait in the governor's queue before failing
    /// locally with [`GovernorError::AcquireTimeout`]
    pub acquire_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// A request the reader task may still hear back about.
#[derive(Debug)]
enum PendingReply {
    Acquire {
        reply: oneshot::Sender<Result<(), GovernorError>>,
        mode: AccessMode,
    },
    Status {
        reply: oneshot::Sender<Result<GovernorStatus, GovernorError>>,
    },
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingReply>>>;

/// Handle to the governor shared by all I/O call sites in a worker.
///
/// Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct GovernorClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    /// `None` when the client has fallen open (unthrottled).
    link: Option<Link>,
    acquire_timeout: Duration,
}

#[derive(Debug)]
struct Link {
    request_tx: mpsc::UnboundedSender<Request>,
    pending: PendingMap,
    next_request_id: AtomicU64,
}

impl GovernorClient {
    /// Connect to the governor at `addr`.
    ///
    /// Never fails: if the server is unreachable within the connect timeout
    /// the client falls open and every acquire is granted locally.
    pub async fn connect(addr: &str, settings: ClientSettings) -> Self {
        let connected = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                GovernorError::ConnectionUnavailable(format!(
                    "Connect to {addr} timed out after {:?}",
                    settings.connect_timeout
                ))
            })
            .and_then(|r| r.map_err(|e| GovernorError::ConnectionUnavailable(e.to_string())));

        let link = match connected {
            Ok(stream) => {
                debug!(%addr, "Connected to resource governor");
                Some(Link::start(stream))
            }
            Err(e) => {
                warn!(%addr, "Resource governor unreachable, proceeding without throttling: {e}");
                None
            }
        };

        Self {
            inner: Arc::new(ClientInner {
                link,
                acquire_timeout: settings.acquire_timeout,
            }),
        }
    }

    /// Create a client that never throttles (for tests and dry runs).
    pub fn unthrottled() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                link: None,
                acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            }),
        }
    }

    /// Whether this client is actually connected to a governor.
    pub fn is_throttled(&self) -> bool {
        self.inner.link.is_some()
    }

    /// Reserve capacity for one operation of `bytes` in `mode` direction.
    ///
    /// Suspends until the governor grants the reservation or the acquire
    /// timeout elapses. The returned [`Lease`] releases on drop.
    pub async fn acquire(&self, mode: AccessMode, bytes: u64) -> Result<Lease, GovernorError> {
        let Some(link) = &self.inner.link else {
            return Ok(Lease { release: None });
        };

        let request_id = link.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();
        link.pending
            .lock()
            .expect("pending map poisoned")
            .insert(request_id, PendingReply::Acquire { reply, mode });

        if link
            .request_tx
            .send(Request::Acquire {
                mode,
                reqs: 1,
                bytes,
                request_id,
            })
            .is_err()
        {
            link.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&request_id);
            return Err(GovernorError::ConnectionUnavailable(
                "Governor connection closed".to_string(),
            ));
        }

        let waited = self.inner.acquire_timeout;
        match tokio::time::timeout(waited, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(Lease {
                release: Some(ReleaseOnDrop {
                    request_tx: link.request_tx.downgrade(),
                    mode,
                    request_id,
                }),
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(GovernorError::ConnectionUnavailable(
                "Governor connection lost while waiting for grant".to_string(),
            )),
            // Timed out: no lease was granted to us. If a grant for this
            // request id arrives later, the reader task releases it.
            Err(_) => Err(GovernorError::AcquireTimeout {
                waited_ms: waited.as_millis() as u64,
            }),
        }
    }

    /// Run `op` under a lease for `mode`/`bytes`, releasing on every exit
    /// path including panics.
    pub async fn with_access<T, Fut>(
        &self,
        mode: AccessMode,
        bytes: u64,
        op: Fut,
    ) -> Result<T, GovernorError>
    where
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(mode, bytes).await?;
        let output = op.await;
        lease.release();
        Ok(output)
    }

    /// Fetch a capacity/usage snapshot from the governor.
    ///
    /// Returns the empty default when the client has fallen open.
    pub async fn status(&self) -> Result<GovernorStatus, GovernorError> {
        let Some(link) = &self.inner.link else {
            return Ok(GovernorStatus::default());
        };
        link.status().await
    }
}

impl Link {
    fn start(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Request>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_requests(write_half, request_rx));
        // The reader holds only a weak sender: once every client handle is
        // dropped the writer channel closes, the socket closes, and the
        // server's disconnect cleanup reclaims any remaining leases.
        tokio::spawn(read_responses(
            read_half,
            Arc::clone(&pending),
            request_tx.downgrade(),
        ));

        Self {
            request_tx,
            pending,
            next_request_id: AtomicU64::new(1),
        }
    }

    async fn status(&self) -> Result<GovernorStatus, GovernorError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(request_id, PendingReply::Status { reply });
        if self.request_tx.send(Request::Status { request_id }).is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&request_id);
            return Err(GovernorError::ConnectionUnavailable(
                "Governor connection closed".to_string(),
            ));
        }
        reply_rx.await.map_err(|_| {
            GovernorError::ConnectionUnavailable("Governor connection lost".to_string())
        })?
    }
}

/// Writer task: serializes requests in channel order onto the socket.
async fn write_requests(
    mut write_half: OwnedWriteHalf,
    mut request_rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = request_rx.recv().await {
        if let Err(e) = protocol::send_message(&mut write_half, &request).await {
            debug!("Stopping governor request writer: {e}");
            return;
        }
    }
}

/// Reader task: resolves pending acquires and auto-releases grants whose
/// waiter already gave up.
async fn read_responses(
    read_half: OwnedReadHalf,
    pending: PendingMap,
    request_tx: mpsc::WeakUnboundedSender<Request>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line_buffer = String::with_capacity(256);

    loop {
        match protocol::recv_message::<_, Response>(&mut reader, &mut line_buffer).await {
            Ok(Some(Response::Granted { request_id })) => {
                let entry = pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                match entry {
                    Some(PendingReply::Acquire { reply, mode }) => {
                        if reply.send(Ok(())).is_err() {
                            // Waiter timed out; the grant is ours to return.
                            debug!(request_id, "Releasing grant for abandoned acquire");
                            if let Some(tx) = request_tx.upgrade() {
                                let _ = tx.send(Request::Release { mode, request_id });
                            }
                        }
                    }
                    _ => warn!(request_id, "Grant for unknown request ignored"),
                }
            }
            Ok(Some(Response::Error {
                request_id,
                message,
            })) => {
                let entry = pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                if let Some(PendingReply::Acquire { reply, .. }) = entry {
                    let _ = reply.send(Err(GovernorError::Denied(message)));
                }
            }
            Ok(Some(Response::Status { request_id, status })) => {
                let entry = pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                if let Some(PendingReply::Status { reply }) = entry {
                    let _ = reply.send(Ok(status));
                }
            }
            Ok(None) => {
                debug!("Governor closed the connection");
                break;
            }
            Err(e) => {
                warn!("Governor connection failed: {e}");
                break;
            }
        }
    }

    // Fail everything still waiting so callers do not hang forever.
    let mut map = pending.lock().expect("pending map poisoned");
    for (_, entry) in map.drain() {
        let lost = || GovernorError::ConnectionUnavailable("Governor connection lost".to_string());
        match entry {
            PendingReply::Acquire { reply, .. } => {
                let _ = reply.send(Err(lost()));
            }
            PendingReply::Status { reply } => {
                let _ = reply.send(Err(lost()));
            }
        }
    }
}

/// A granted reservation. Dropping it sends the release, so capacity
/// returns on every exit path.
#[derive(Debug)]
#[must_use = "dropping a lease releases it immediately"]
pub struct Lease {
    /// `None` for fail-open leases, which have nothing to return.
    release: Option<ReleaseOnDrop>,
}

#[derive(Debug)]
struct ReleaseOnDrop {
    request_tx: mpsc::WeakUnboundedSender<Request>,
    mode: AccessMode,
    request_id: u64,
}

impl Lease {
    /// Release explicitly. Equivalent to dropping, spelled out at call
    /// sites where the release point matters.
    pub fn release(self) {}

    /// Whether this lease holds a real server-side reservation.
    pub fn is_real(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            // A dead sender means the connection is gone; the server's
            // disconnect cleanup returns the capacity instead.
            if let Some(tx) = release.request_tx.upgrade() {
                let _ = tx.send(Request::Release {
                    mode: release.mode,
                    request_id: release.request_id,
                });
            }
        }
    }
}

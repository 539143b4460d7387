//! Server Endpoint
//!
//! Accepts persistent worker connections, decodes requests, and forwards
//! them to the admission core. Each connection gets one reader task; acquire
//! replies are produced by short-lived per-request tasks so a suspended
//! acquire never blocks releases arriving on the same connection. Responses
//! funnel through a single writer task per connection, preserving write
//! ordering.
//!
//! Disconnect cleanup is correctness-critical: a crashed worker must not
//! strand capacity, so every exit path of the reader loop ends in a
//! `disconnect` that releases the connection's leases and removes its
//! queued requests.

use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GovernorConfig;
use crate::error::GovernorError;
use crate::protocol::{self, Request, Response};
use crate::quota::{AdmissionHandle, ConnId, QuotaTable};

/// The governor's listening endpoint.
pub struct Server {
    listener: TcpListener,
    admission: AdmissionHandle,
    config: GovernorConfig,
}

impl Server {
    /// Bind the configured address and spawn the admission core.
    ///
    /// Fails with [`GovernorError::Bind`] if the port is unavailable.
    pub async fn bind(config: GovernorConfig) -> Result<Self, GovernorError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GovernorError::Bind { addr, source })?;

        let admission = AdmissionHandle::spawn(QuotaTable::from_config(&config));
        Ok(Self {
            listener,
            admission,
            config,
        })
    }

    /// The bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, GovernorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the admission core, for in-process inspection.
    pub fn admission(&self) -> AdmissionHandle {
        self.admission.clone()
    }

    /// Accept connections until `shutdown` fires, then stop accepting,
    /// give in-flight connections a drain period, and force the rest.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GovernorError> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            read_reqs = self.config.read_reqs,
            read_data = self.config.read_data,
            write_reqs = self.config.write_reqs,
            write_data = self.config.write_data,
            "Resource governor listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let admission = self.admission.clone();
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                handle_connection(stream, peer, admission, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Stop accepting, then drain. Connection tasks observe the same
        // shutdown signal and close themselves, force-releasing leases.
        drop(self.listener);
        info!(
            open_connections = connections.len(),
            "Shutting down; draining connections"
        );
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!("Drain period elapsed; aborting remaining connections");
            connections.abort_all();
        }
        info!("Resource governor stopped");
        Ok(())
    }
}

/// Serve one worker connection until EOF, protocol error, or shutdown.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    admission: AdmissionHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn: ConnId = Uuid::new_v4();
    info!(%conn, %peer, "Worker connected");

    let (read_half, write_half) = stream.into_split();
    let (response_tx, response_rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(write_responses(write_half, response_rx));

    // Per-request acquire tasks; aborted wholesale once the connection dies,
    // after disconnect cleanup has already removed their queue entries.
    let mut in_flight = JoinSet::new();
    let mut reader = BufReader::new(read_half);
    let mut line_buffer = String::with_capacity(256);

    loop {
        tokio::select! {
            message = protocol::recv_message::<_, Request>(&mut reader, &mut line_buffer) => {
                match message {
                    Ok(Some(request)) => {
                        dispatch(conn, request, &admission, &response_tx, &mut in_flight);
                    }
                    Ok(None) => {
                        debug!(%conn, "Worker closed connection");
                        break;
                    }
                    Err(GovernorError::Protocol(reason)) => {
                        warn!(%conn, %peer, "Dropping connection: {reason}");
                        break;
                    }
                    Err(e) => {
                        warn!(%conn, %peer, "Connection failed: {e}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(%conn, "Closing connection for shutdown");
                    break;
                }
            }
        }
    }

    // Force-release everything this connection still holds or awaits.
    admission.disconnect(conn);
    in_flight.abort_all();
    drop(response_tx);
    let _ = writer.await;
    info!(%conn, "Worker disconnected");
}

fn dispatch(
    conn: ConnId,
    request: Request,
    admission: &AdmissionHandle,
    response_tx: &mpsc::UnboundedSender<Response>,
    in_flight: &mut JoinSet<()>,
) {
    match request {
        Request::Acquire {
            mode,
            reqs,
            bytes,
            request_id,
        } => {
            // The reply suspends until granted; run it off the reader loop
            // so this connection's releases keep flowing meanwhile.
            let admission = admission.clone();
            let response_tx = response_tx.clone();
            in_flight.spawn(async move {
                let response = match admission.acquire(conn, mode, reqs, bytes, request_id).await
                {
                    Ok(()) => Response::Granted { request_id },
                    Err(e) => Response::Error {
                        request_id,
                        message: e.to_string(),
                    },
                };
                let _ = response_tx.send(response);
            });
        }
        Request::Release { mode, request_id } => {
            admission.release(conn, mode, request_id);
        }
        Request::Status { request_id } => {
            let admission = admission.clone();
            let response_tx = response_tx.clone();
            in_flight.spawn(async move {
                let response = match admission.status().await {
                    Ok(status) => Response::Status { request_id, status },
                    // The client is still owed an answer; a dropped reply
                    // would leave its status future pending forever.
                    Err(e) => Response::Error {
                        request_id,
                        message: e.to_string(),
                    },
                };
                let _ = response_tx.send(response);
            });
        }
    }
}

/// Single writer per connection: serializes responses in channel order.
async fn write_responses(
    mut write_half: OwnedWriteHalf,
    mut response_rx: mpsc::UnboundedReceiver<Response>,
) {
    while let Some(response) = response_rx.recv().await {
        if let Err(e) = protocol::send_message(&mut write_half, &response).await {
            debug!("Stopping response writer: {e}");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> GovernorConfig {
        GovernorConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..GovernorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Server::bind(local_config()).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let config = GovernorConfig {
            port: taken,
            ..local_config()
        };
        match Server::bind(config).await {
            Err(GovernorError::Bind { addr, .. }) => {
                assert!(addr.ends_with(&taken.to_string()));
            }
            other => panic!("Expected Bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_status_failure_still_answers_the_client() {
        // If the admission core is gone, the client must get an error
        // response rather than a reply that never arrives.
        let admission = AdmissionHandle::defunct();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel();
        let mut in_flight = JoinSet::new();

        dispatch(
            Uuid::new_v4(),
            Request::Status { request_id: 9 },
            &admission,
            &response_tx,
            &mut in_flight,
        );

        let response = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            response_rx.recv(),
        )
        .await
        .expect("Status should be answered promptly")
        .expect("Response channel should carry an answer");
        match response {
            Response::Error { request_id, .. } => assert_eq!(request_id, 9),
            other => panic!("Expected Error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = Server::bind(local_config()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(server.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), running)
            .await
            .expect("Server should stop promptly")
            .unwrap()
            .unwrap();
    }
}

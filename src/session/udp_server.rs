use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::error::PunchError;
use crate::session::{SessionHandle, RECV_BUFFER_SIZE, RECV_ERROR_BACKOFF};

/// Slot holding the registry's shared socket
///
/// Sessions and the registry send through this; only the receive loop reads
/// from the socket. `None` means the registry is stopped.
pub(crate) struct Transport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    send_timeout: Duration,
}

impl Transport {
    pub(crate) fn new(send_timeout: Duration) -> Self {
        Self {
            socket: RwLock::new(None),
            send_timeout,
        }
    }

    pub(crate) fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn open(&self, socket: Arc<UdpSocket>) {
        *self.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(socket);
    }

    pub(crate) fn close(&self) -> Option<Arc<UdpSocket>> {
        self.socket.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Write one datagram, bounded by the send deadline
    pub(crate) async fn send_to(&self, data: &[u8], remote: SocketAddr) -> Result<(), PunchError> {
        let socket = self.socket().ok_or(PunchError::NotRunning)?;
        match tokio::time::timeout(self.send_timeout, socket.send_to(data, remote)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PunchError::Io(e)),
            Err(_) => Err(PunchError::Timeout),
        }
    }
}

/// Single consumer of the shared socket
///
/// Reads every datagram and routes it by source address to the matching
/// session's inbox. Datagrams from unregistered addresses are dropped, never
/// admitted. No listener code runs on this task.
pub(crate) struct UDPServer {
    socket: Arc<UdpSocket>,
    sessions: Arc<tokio::sync::RwLock<HashMap<SocketAddr, SessionHandle>>>,
    cancel: CancellationToken,
}

impl UDPServer {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        sessions: Arc<tokio::sync::RwLock<HashMap<SocketAddr, SessionHandle>>>,
        cancel: CancellationToken,
    ) -> Self {
        UDPServer {
            socket,
            sessions,
            cancel,
        }
    }

    /// Run until cancelled
    ///
    /// Receive errors (for example ICMP port-unreachable surfacing as
    /// `ConnectionReset` on some platforms) are logged and the loop continues.
    pub(crate) async fn serve(self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        if let Ok(local) = self.socket.local_addr() {
            tracing::info!("P2P UDP listening on {}", local);
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, remote)) => {
                            let packet = Bytes::copy_from_slice(&buf[..len]);
                            self.handle_inbound(packet, remote).await;
                        }
                        Err(e) => {
                            tracing::warn!("UDP recv_from error: {}", e);
                            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
        tracing::info!("P2P UDP receive loop stopped");
    }

    async fn handle_inbound(&self, packet: Bytes, remote: SocketAddr) {
        let now = Instant::now();
        let session = self.sessions.read().await.get(&remote).cloned();

        match session {
            Some(session) => session.deliver(packet, now),
            None => {
                tracing::debug!("Dropped {} bytes from unregistered address {}", packet.len(), remote);
            }
        }
    }
}

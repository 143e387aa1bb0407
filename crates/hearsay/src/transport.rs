//! UDP transport glue
//!
//! The protocol core depends on the transport only through a narrow
//! contract: inbound datagrams arrive as `(Bytes, SocketAddr)` on the
//! engine inbox, outbound `(SocketAddr, Bytes)` sends are drained from a
//! channel. Socket errors are logged and never crash the process.

use crate::error::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// UDP socket plumbing for one gossip engine.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    recv_buffer_size: usize,
}

impl UdpTransport {
    /// Bind the listen address.
    pub async fn bind(addr: SocketAddr, recv_buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            recv_buffer_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive and send loops.
    pub(crate) fn start(
        self,
        inbox: mpsc::Sender<(Bytes, SocketAddr)>,
        outbound: mpsc::Receiver<(SocketAddr, Bytes)>,
        shutdown: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let recv = tokio::spawn(recv_loop(
            self.socket.clone(),
            inbox,
            self.recv_buffer_size,
            shutdown.clone(),
        ));
        let send = tokio::spawn(send_loop(self.socket, outbound, shutdown));
        (recv, send)
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbox: mpsc::Sender<(Bytes, SocketAddr)>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((0, _)) => continue,
                Ok((len, from)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if inbox.send((data, from)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "socket read error");
                    continue;
                }
            },
        }
    }

    debug!("transport receive loop exited");
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<(SocketAddr, Bytes)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            request = outbound.recv() => match request {
                Some((addr, data)) => {
                    if let Err(err) = socket.send_to(&data, addr).await {
                        warn!(%addr, %err, "failed to send datagram");
                    }
                }
                None => break,
            },
        }
    }

    debug!("transport send loop exited");
}

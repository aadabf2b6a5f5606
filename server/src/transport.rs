//! Outbound delivery.
//!
//! The simulation only talks to a [`Transport`]; the UDP implementation hands
//! datagrams to a dedicated sender task so socket I/O never runs while entity
//! or session state is locked.

use crate::error::TransportError;
use log::{error, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Payload shared between all recipients of one broadcast.
pub type Payload = Arc<[u8]>;

pub trait Transport: Send + Sync {
    /// Queues `payload` for `addr`. Must not block.
    fn send(&self, addr: SocketAddr, payload: Payload) -> Result<(), TransportError>;

    /// Sends the same payload to every address. A failure for one target does
    /// not stop delivery to the rest; failures are returned for logging.
    fn broadcast(&self, addrs: &[SocketAddr], payload: Payload) -> Vec<(SocketAddr, TransportError)> {
        addrs
            .iter()
            .filter_map(|addr| {
                self.send(*addr, Arc::clone(&payload))
                    .err()
                    .map(|e| (*addr, e))
            })
            .collect()
    }
}

/// Outbound datagram waiting for the sender task
#[derive(Debug)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub payload: Payload,
}

/// UDP transport backed by a sender task draining an unbounded queue.
pub struct UdpTransport {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl UdpTransport {
    /// Creates the transport and spawns its sender task on the current runtime.
    pub fn spawn(socket: Arc<UdpSocket>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_sender(socket, outbound_rx));
        Self { outbound_tx }
    }

    async fn run_sender(socket: Arc<UdpSocket>, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(Outbound { addr, payload }) = outbound_rx.recv().await {
            if let Err(e) = socket.send_to(&payload, addr).await {
                let failure = TransportError::Io { addr, source: e };
                warn!("{}", failure);
            }
        }
        error!("Outbound queue closed, sender task exiting");
    }
}

impl Transport for UdpTransport {
    fn send(&self, addr: SocketAddr, payload: Payload) -> Result<(), TransportError> {
        self.outbound_tx
            .send(Outbound { addr, payload })
            .map_err(|_| TransportError::Closed)
    }
}

/// Transport that records every datagram instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<Outbound>>,
    failing: std::sync::Mutex<Vec<SocketAddr>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `addr` fail.
    pub fn fail_for(&self, addr: SocketAddr) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(addr);
        }
    }

    /// Drains and returns everything sent so far.
    pub fn take(&self) -> Vec<Outbound> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }
}

impl Transport for RecordingTransport {
    fn send(&self, addr: SocketAddr, payload: Payload) -> Result<(), TransportError> {
        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(&addr))
            .unwrap_or(false);
        if failing {
            return Err(TransportError::Io {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Outbound { addr, payload });
        }
        Ok(())
    }
}

use std::{io::ErrorKind, net::SocketAddr, thread};

use bytes::Bytes;
use tokio::sync::mpsc::{Sender as QueueSender, channel, error::TrySendError};

const OUTBOUND_CAPACITY: usize = 4096;

/// Send side of one UDP socket.
///
/// All writes through one sender are funneled into a single queue drained by
/// a dedicated thread, so they reach the kernel in submission order. Ordering
/// across senders is not guaranteed.
#[derive(Clone)]
pub struct Sender {
    queue: QueueSender<(SocketAddr, Bytes)>,
}

impl Sender {
    /// Spawn the writer thread for a socket.
    pub fn spawn(index: usize, socket: std::net::UdpSocket) -> (Self, thread::JoinHandle<()>) {
        let (queue, mut receiver) = channel::<(SocketAddr, Bytes)>(OUTBOUND_CAPACITY);

        let thread = thread::spawn(move || {
            while let Some((addr, packet)) = receiver.blocking_recv() {
                if let Err(e) = socket.send_to(&packet, addr) {
                    // Note: An error will also be reported when the remote
                    // host is shut down, which is not processed yet, but a
                    // warning will be issued.
                    if e.kind() != ErrorKind::ConnectionReset {
                        log::error!("sender write failed: index={index}, error={e}");
                        break;
                    }
                }
            }
        });

        (Self { queue }, thread)
    }

    /// Queue a packet, waiting for queue space.
    ///
    /// Returns `false` once the writer is gone.
    pub async fn send(&self, addr: SocketAddr, packet: Bytes) -> bool {
        self.queue.send((addr, packet)).await.is_ok()
    }

    /// Queue a packet without waiting. A full queue drops the packet, which
    /// is the required behavior for stateless responses: ingress must never
    /// block on egress.
    pub fn try_send(&self, addr: SocketAddr, packet: Bytes) -> bool {
        match self.queue.try_send((addr, packet)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a batch in order.
    pub async fn batch_send(&self, batch: Vec<(SocketAddr, Bytes)>) -> bool {
        for (addr, packet) in batch {
            if !self.send(addr, packet).await {
                return false;
            }
        }

        true
    }
}

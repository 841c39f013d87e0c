use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{
        Notify,
        mpsc::{Receiver, Sender as MailboxSender, channel},
    },
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

use dispatch::{
    address::Address,
    registry::{AddressRoutes, Registry},
};

use crate::server::{
    handler::{ConnectionControl, ServerHandler},
    sender::Sender,
};

const INBOX_CAPACITY: usize = 256;

/// How long children get to close cleanly before they are killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Timer arm used when the transport reports no pending timeout.
const IDLE_TICK: Duration = Duration::from_secs(3600);

pub enum ConnectionMessage {
    Packet { peer: Address, data: Vec<u8> },
    Close { code: u64, reason: Vec<u8> },
}

/// Cheap, cloneable address of a connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Vec<u8>,
    mailbox: MailboxSender<ConnectionMessage>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Hand a validated packet to the owning task. A full mailbox drops the
    /// packet; the peer retransmits.
    pub fn forward(&self, peer: Address, data: Vec<u8>) -> bool {
        self.mailbox
            .try_send(ConnectionMessage::Packet { peer, data })
            .is_ok()
    }

    pub fn close(&self, code: u64, reason: &[u8]) {
        let _ = self.mailbox.try_send(ConnectionMessage::Close {
            code,
            reason: reason.to_vec(),
        });
    }
}

struct Child {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
}

/// Factory and lifecycle manager for connection tasks.
///
/// Creation is atomic with respect to the registry: the id is claimed first,
/// then the transport connection is built and the task spawned, and the claim
/// is rolled back if anything in between fails. Termination, clean or not,
/// funnels through [`ConnectionSupervisor::forget`].
pub struct ConnectionSupervisor<T> {
    registry: Arc<Registry<ConnectionHandle>>,
    routes: Option<Arc<AddressRoutes>>,
    children: Mutex<HashMap<Vec<u8>, Child>>,
    drained: Notify,
    closing: AtomicBool,
    local: SocketAddr,
    payload_size: usize,
    handler: T,
}

impl<T> ConnectionSupervisor<T>
where
    T: ServerHandler,
{
    pub fn new(
        registry: Arc<Registry<ConnectionHandle>>,
        routes: Option<Arc<AddressRoutes>>,
        local: SocketAddr,
        payload_size: usize,
        handler: T,
    ) -> Arc<Self> {
        Arc::new(Self {
            children: Mutex::new(HashMap::with_capacity(1024)),
            drained: Notify::new(),
            closing: AtomicBool::new(false),
            registry,
            routes,
            local,
            payload_size,
            handler,
        })
    }

    /// Accept a validated first flight and spawn the task owning it.
    ///
    /// Returns the handle of the task that owns `dcid` afterwards, whether
    /// this call created it or lost the race to a concurrent creation, or
    /// `None` when there is nothing to key a connection by.
    pub async fn create_connection(
        self: Arc<Self>,
        peer: Address,
        scid: &[u8],
        dcid: &[u8],
        odcid: &[u8],
        quic: &mut quiche::Config,
        sender: &Sender,
    ) -> anyhow::Result<Option<ConnectionHandle>> {
        if dcid.is_empty() || self.closing.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let (mailbox, inbox) = channel(INBOX_CAPACITY);
        let handle = ConnectionHandle {
            id: dcid.to_vec(),
            mailbox,
        };

        if self.registry.insert_unique(dcid, handle.clone()).is_err() {
            // Lost the race; adopt the winner.
            return Ok(self.registry.lookup(dcid));
        }

        let conn = match quiche::accept(
            &quiche::ConnectionId::from_ref(dcid),
            Some(&quiche::ConnectionId::from_ref(odcid)),
            self.local,
            peer.socket_addr(),
            quic,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.registry.remove(dcid);
                return Err(e.into());
            }
        };

        log::info!(
            "connection accepted: peer={}, scid={}, trace_id={}",
            peer,
            hex(scid),
            conn.trace_id()
        );

        if let Some(routes) = &self.routes {
            routes.insert(peer, dcid);
        }

        let task = tokio::spawn(run_connection(
            conn,
            dcid.to_vec(),
            inbox,
            sender.clone(),
            self.local,
            self.payload_size,
            self.clone(),
        ));

        // The task deregisters the registry entry under the children lock, so
        // observing the entry here proves the task has not terminated yet.
        {
            let mut children = self.children.lock();
            if self.registry.lookup(dcid).is_some() {
                children.insert(
                    dcid.to_vec(),
                    Child {
                        handle: handle.clone(),
                        task,
                    },
                );
            }
        }

        Ok(Some(handle))
    }

    pub fn lookup_connection(&self, dcid: &[u8]) -> Option<ConnectionHandle> {
        self.registry.lookup(dcid)
    }

    /// Tear down everything a terminated connection owned.
    ///
    /// Idempotent: the registry entry gates the close callback, so a task
    /// that is both aborted and dropped reports once.
    fn forget(&self, cid: &[u8]) {
        {
            let mut children = self.children.lock();
            children.remove(cid);

            if self.registry.remove(cid).is_some() {
                if let Some(routes) = &self.routes {
                    routes.remove_cid(cid);
                }

                self.handler.on_closed(cid);
            }
        }

        self.drained.notify_waiters();
    }

    /// Ask every child to close, wait out the grace window, kill the rest.
    /// New connections are refused from here on.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::Relaxed);

        let handles: Vec<ConnectionHandle> = {
            self.children
                .lock()
                .values()
                .map(|child| child.handle.clone())
                .collect()
        };

        for handle in &handles {
            handle.close(0x0, b"going away");
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.children.lock().is_empty() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };

            if timeout(remaining, self.drained.notified()).await.is_err() {
                break;
            }
        }

        let stragglers: Vec<Child> = {
            let mut children = self.children.lock();
            children.drain().map(|(_, child)| child).collect()
        };

        if !stragglers.is_empty() {
            log::warn!(
                "killed connections that outlived the grace window: count={}",
                stragglers.len()
            );
        }

        for child in stragglers {
            child.task.abort();
        }
    }
}

/// Removes the connection from the registry on every task exit path,
/// including panic and abort.
struct Deregister<T>
where
    T: ServerHandler,
{
    supervisor: Arc<ConnectionSupervisor<T>>,
    cid: Vec<u8>,
}

impl<T> Drop for Deregister<T>
where
    T: ServerHandler,
{
    fn drop(&mut self) {
        self.supervisor.forget(&self.cid);
    }
}

/// The per-connection task: sole owner of the transport state machine.
///
/// Wakes on mailbox messages and transport timers, feeds packets in, drains
/// outgoing packets to the bound sender and surfaces events to the handler.
async fn run_connection<T>(
    mut conn: quiche::Connection,
    cid: Vec<u8>,
    mut inbox: Receiver<ConnectionMessage>,
    sender: Sender,
    local: SocketAddr,
    payload_size: usize,
    supervisor: Arc<ConnectionSupervisor<T>>,
) where
    T: ServerHandler,
{
    let handler = supervisor.handler.clone();
    let _deregister = Deregister {
        supervisor,
        cid: cid.clone(),
    };

    let mut out = vec![0u8; payload_size];
    let mut scratch = vec![0u8; payload_size];
    let mut established = false;
    let mut inbox_open = true;

    loop {
        let timer = conn.timeout().unwrap_or(IDLE_TICK);

        tokio::select! {
            message = inbox.recv() => match message {
                Some(ConnectionMessage::Packet { peer, mut data }) => {
                    let info = quiche::RecvInfo {
                        from: peer.socket_addr(),
                        to: local,
                    };

                    if let Err(e) = conn.recv(&mut data, info) {
                        log::debug!(
                            "packet not accepted: trace_id={}, error={e:?}",
                            conn.trace_id()
                        );
                    }
                }
                Some(ConnectionMessage::Close { code, reason }) => {
                    // Already-closed is an idempotent no-op.
                    let _ = conn.close(true, code, &reason);
                }
                None => {
                    let _ = conn.close(false, 0x0, b"");
                    inbox_open = false;
                }
            },
            _ = sleep(timer) => conn.on_timeout(),
        }

        if !established && (conn.is_in_early_data() || conn.is_established()) {
            established = true;
            handler.on_established(&mut ConnectionControl::new(&mut conn));
        }

        deliver_streams(&mut conn, &handler, &mut scratch);
        deliver_dgrams(&mut conn, &handler, &mut scratch);

        // Flush every packet the transport wants on the wire.
        loop {
            match conn.send(&mut out) {
                Ok((size, info)) => {
                    if !sender.send(info.to, Bytes::copy_from_slice(&out[..size])).await {
                        inbox_open = false;
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::error!("egress failed: trace_id={}, error={e:?}", conn.trace_id());
                    let _ = conn.close(false, 0x1, b"");
                    break;
                }
            }
        }

        if conn.is_closed() || !inbox_open {
            break;
        }
    }

    log::info!("connection closed: trace_id={}", conn.trace_id());
}

fn deliver_streams<T>(conn: &mut quiche::Connection, handler: &T, scratch: &mut [u8])
where
    T: ServerHandler,
{
    let readable: Vec<u64> = conn.readable().collect();

    for stream_id in readable {
        loop {
            match conn.stream_recv(stream_id, scratch) {
                Ok((size, fin)) => {
                    handler.on_stream_data(
                        &mut ConnectionControl::new(conn),
                        stream_id,
                        &scratch[..size],
                        fin,
                    );

                    if fin {
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("stream read failed: stream_id={stream_id}, error={e:?}");
                    break;
                }
            }
        }
    }
}

fn deliver_dgrams<T>(conn: &mut quiche::Connection, handler: &T, scratch: &mut [u8])
where
    T: ServerHandler,
{
    loop {
        match conn.dgram_recv(scratch) {
            Ok(size) => handler.on_dgram(&mut ConnectionControl::new(conn), &scratch[..size]),
            Err(_) => break,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ahash::RandomState;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc::Sender as InboxSender;

use dispatch::{
    address::Address,
    cid::ConnectionIdDeriver,
    packet::classify,
    registry::{Registry, shard_for},
};

use crate::server::{connection::ConnectionHandle, dispatcher::PacketRecord};

/// Large enough for any UDP datagram; peers are not trusted to honor the
/// advertised payload size before the handshake.
const RECV_BUFFER_LEN: usize = 65535;

const REBIND_DELAY: Duration = Duration::from_secs(1);

/// Bind the socket pool.
///
/// All sockets share the listen address through `SO_REUSEPORT`; when port 0
/// is requested the first socket resolves the port for the rest.
pub fn bind_pool(listen: SocketAddr, count: usize) -> anyhow::Result<(Vec<UdpSocket>, SocketAddr)> {
    let first = bind_socket(listen)?;
    let local = first.local_addr()?;

    let mut sockets = vec![first];
    for _ in 1..count {
        sockets.push(bind_socket(local)?);
    }

    Ok((sockets, local))
}

fn bind_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.bind(&addr.into())?;
    Ok(socket.into())
}

pub struct ReaderOptions {
    pub listen: SocketAddr,
    pub event_capacity: usize,
    pub polling_timeout: Duration,
    pub conn_ids: Arc<ConnectionIdDeriver>,
    pub placement: Arc<RandomState>,
    pub registry: Arc<Registry<ConnectionHandle>>,
    pub dispatchers: Vec<InboxSender<PacketRecord>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Spawn one reader thread per socket.
///
/// Threads are pinned to cores when the platform exposes them; if pinning
/// fails the thread group runs unpinned.
pub fn spawn_readers(
    sockets: Vec<UdpSocket>,
    options: ReaderOptions,
) -> Vec<thread::JoinHandle<()>> {
    let options = Arc::new(options);

    let mut core_ids = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter();

    sockets
        .into_iter()
        .enumerate()
        .map(|(index, socket)| {
            let core_id = core_ids.next();
            let options = options.clone();

            thread::spawn(move || {
                if let Some(core_id) = core_id {
                    let _ = core_affinity::set_for_current(core_id);
                }

                read_loop(index, socket, &options);
            })
        })
        .collect()
}

/// The receive loop of one socket.
///
/// Takes up to `event_capacity` datagrams per wakeup, each wait bounded by
/// the polling timeout, classifies them and hands each record to its
/// dispatcher shard. A dead socket is replaced in place; the pool keeps its
/// size.
fn read_loop(index: usize, mut socket: UdpSocket, options: &ReaderOptions) {
    if let Err(e) = socket.set_read_timeout(Some(options.polling_timeout)) {
        log::error!("socket reader setup failed: index={index}, error={e}");
        return;
    }

    let mut buffer = vec![0u8; RECV_BUFFER_LEN];
    let mut batch = Vec::with_capacity(options.event_capacity);
    let mut round_robin = index;

    while !options.shutdown.load(Ordering::Relaxed) {
        while batch.len() < options.event_capacity {
            let (size, addr) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break;
                }
                // Note: An error will also be reported when the remote host
                // is shut down, which is not processed yet.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::error!("socket reader failed: index={index}, error={e}");

                    match rebind(index, options) {
                        Some(fresh) => {
                            socket = fresh;
                            continue;
                        }
                        None => return,
                    }
                }
            };

            if size == 0 {
                continue;
            }

            let meta = match classify(&mut buffer[..size]) {
                Ok(meta) => meta,
                Err(_) => {
                    log::trace!("dropped malformed datagram: peer={addr}");
                    continue;
                }
            };

            batch.push(PacketRecord {
                peer: Address::new(addr),
                data: buffer[..size].to_vec(),
                meta,
            });
        }

        for record in batch.drain(..) {
            if !deliver(record, &mut round_robin, options) {
                return;
            }
        }
    }
}

/// Route a record to its dispatcher shard.
///
/// Placement follows the connection id the packet's DCID derives to, so a
/// connection's whole life stays on one dispatcher; packets without a DCID
/// are spread round-robin. A full inbox only ever costs pre-handshake
/// packets: established connections wait for queue space.
fn deliver(record: PacketRecord, round_robin: &mut usize, options: &ReaderOptions) -> bool {
    let buckets = options.dispatchers.len();

    let shard = if record.meta.dcid.is_empty() {
        *round_robin = round_robin.wrapping_add(1);
        *round_robin % buckets
    } else {
        shard_for(
            &options.placement,
            &options.conn_ids.derive(&record.meta.dcid),
            buckets,
        )
    };

    let inbox = &options.dispatchers[shard];

    if options.registry.lookup(&record.meta.dcid).is_some() {
        inbox.blocking_send(record).is_ok()
    } else {
        if inbox.try_send(record).is_err() {
            log::trace!("dropped pre-handshake packet on full dispatcher inbox: shard={shard}");
        }

        true
    }
}

fn rebind(index: usize, options: &ReaderOptions) -> Option<UdpSocket> {
    while !options.shutdown.load(Ordering::Relaxed) {
        thread::sleep(REBIND_DELAY);

        match bind_socket(options.listen) {
            Ok(socket) => {
                if socket.set_read_timeout(Some(options.polling_timeout)).is_err() {
                    continue;
                }

                log::info!("socket reader recovered: index={index}");
                return Some(socket);
            }
            Err(e) => log::error!("socket rebind failed: index={index}, error={e}"),
        }
    }

    None
}

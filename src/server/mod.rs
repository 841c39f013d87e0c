pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod sender;
pub mod socket;

pub use handler::{ConnectionControl, ServerHandler};

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ahash::RandomState;
use anyhow::{Result, anyhow};
use tokio::{sync::mpsc::Sender as InboxSender, task::JoinHandle};

use dispatch::{
    cid::ConnectionIdDeriver,
    registry::{AddressRoutes, Registry},
    secret::{SECRET_LEN, generate_secret},
    token::RetryTokenKey,
};

use crate::{
    config::Config,
    server::{
        connection::ConnectionSupervisor,
        dispatcher::{DispatcherOptions, PacketRecord},
        sender::Sender,
        socket::ReaderOptions,
    },
};

const APPLICATION_PROTOCOLS: &[&[u8]] = &[b"h3"];

/// A running server: the socket, dispatcher and sender pools plus the
/// supervisor of every connection they created.
pub struct Server<T>
where
    T: ServerHandler,
{
    local: SocketAddr,
    shutdown: Arc<AtomicBool>,
    readers: Vec<thread::JoinHandle<()>>,
    inboxes: Vec<InboxSender<PacketRecord>>,
    dispatchers: Vec<JoinHandle<()>>,
    supervisor: Arc<ConnectionSupervisor<T>>,
    senders: Vec<Sender>,
    sender_threads: Vec<thread::JoinHandle<()>>,
}

/// Wire the pools together and start serving.
///
/// Brings the pieces up in dependency order: registry, connection
/// supervisor, senders, dispatchers, and socket readers last, so by the time
/// packets flow everything downstream of them exists.
pub async fn start<T>(config: &Arc<Config>, handler: &T) -> Result<Server<T>>
where
    T: ServerHandler,
{
    let token_secret = resolve_secret(&config.secrets.token_secret, "token-secret")?;
    let conn_id_secret = resolve_secret(&config.secrets.connection_id_secret, "connection-id-secret")?;

    let conn_ids = Arc::new(ConnectionIdDeriver::new(&conn_id_secret));
    let tokens = Arc::new(RetryTokenKey::new(&token_secret));

    let registry = Arc::new(Registry::new());
    let routes = config
        .server
        .allow_address_routing
        .then(|| Arc::new(AddressRoutes::new()));

    let socket_count = config.server.socket_pool_size.max(1);
    let dispatcher_count = config.server.dispatcher_pool_size.max(1);
    let payload_size = config.transport.max_udp_payload_size;

    if config.tls.is_none() {
        log::warn!("no tls material configured, peers cannot complete a handshake");
    }

    let (sockets, local) = socket::bind_pool(config.server.listen(), socket_count)?;

    let supervisor = ConnectionSupervisor::new(
        registry.clone(),
        routes.clone(),
        local,
        payload_size,
        handler.clone(),
    );

    let mut senders = Vec::with_capacity(socket_count);
    let mut sender_threads = Vec::with_capacity(socket_count);
    for (index, socket) in sockets.iter().enumerate() {
        let (sender, thread) = Sender::spawn(index, socket.try_clone()?);
        senders.push(sender);
        sender_threads.push(thread);
    }

    let mut inboxes = Vec::with_capacity(dispatcher_count);
    let mut dispatchers = Vec::with_capacity(dispatcher_count);
    for index in 0..dispatcher_count {
        let (inbox, task) = dispatcher::spawn(DispatcherOptions {
            index,
            quic: build_quic_config(config)?,
            sender: senders[index % socket_count].clone(),
            registry: registry.clone(),
            routes: routes.clone(),
            supervisor: supervisor.clone(),
            conn_ids: conn_ids.clone(),
            tokens: tokens.clone(),
            payload_size,
        });

        inboxes.push(inbox);
        dispatchers.push(task);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let readers = socket::spawn_readers(
        sockets,
        ReaderOptions {
            listen: local,
            event_capacity: config.server.socket_event_capacity.max(1),
            polling_timeout: Duration::from_millis(config.server.socket_polling_timeout.max(1)),
            conn_ids,
            placement: Arc::new(RandomState::new()),
            registry: registry.clone(),
            dispatchers: inboxes.clone(),
            shutdown: shutdown.clone(),
        },
    );

    log::info!(
        "webtransport server listening: listen={local}, sockets={socket_count}, dispatchers={dispatcher_count}"
    );

    Ok(Server {
        local,
        shutdown,
        readers,
        inboxes,
        dispatchers,
        supervisor,
        senders,
        sender_threads,
    })
}

impl<T> Server<T>
where
    T: ServerHandler,
{
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop top-down: readers first so nothing new flows in, then the
    /// connections get the grace window, then the dispatchers drain their
    /// inboxes. Dispatchers outlive every connection they accepted, so no
    /// connection ever sees its dispatcher's transport config disappear.
    /// The senders flush last.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for reader in self.readers.drain(..) {
            let _ = tokio::task::spawn_blocking(move || reader.join()).await;
        }

        self.supervisor.shutdown().await;

        self.inboxes.clear();
        for dispatcher in self.dispatchers.drain(..) {
            let _ = dispatcher.await;
        }

        self.senders.clear();
        for sender in self.sender_threads.drain(..) {
            let _ = tokio::task::spawn_blocking(move || sender.join()).await;
        }

        log::info!("webtransport server stopped");
    }
}

/// Build the transport configuration a dispatcher hands to every connection
/// it accepts.
fn build_quic_config(config: &Config) -> Result<quiche::Config> {
    let mut quic = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    if let Some(tls) = &config.tls {
        quic.load_cert_chain_from_pem_file(&tls.certificate_chain)?;
        quic.load_priv_key_from_pem_file(&tls.private_key)?;
    }

    quic.set_application_protos(APPLICATION_PROTOCOLS)?;

    let transport = &config.transport;
    quic.set_max_idle_timeout(transport.max_idle_timeout);
    quic.set_max_recv_udp_payload_size(transport.max_udp_payload_size);
    quic.set_max_send_udp_payload_size(transport.max_udp_payload_size);
    quic.set_initial_max_data(transport.initial_max_data);
    quic.set_initial_max_stream_data_bidi_local(transport.initial_max_stream_data_bidi_local);
    quic.set_initial_max_stream_data_bidi_remote(transport.initial_max_stream_data_bidi_remote);
    quic.set_initial_max_stream_data_uni(transport.initial_max_stream_data_uni);
    quic.set_initial_max_streams_bidi(transport.initial_max_streams_bidi);
    quic.set_initial_max_streams_uni(transport.initial_max_streams_uni);
    quic.set_disable_active_migration(transport.disable_active_migration);

    if transport.enable_early_data {
        quic.enable_early_data();
    }

    quic.enable_dgram(transport.enable_dgram, 1024, 1024);

    Ok(quic)
}

fn resolve_secret(value: &Option<String>, name: &str) -> Result<Vec<u8>> {
    match value {
        Some(secret) if secret.len() >= SECRET_LEN => Ok(secret.clone().into_bytes()),
        Some(_) => Err(anyhow!("{name} must be at least {SECRET_LEN} bytes")),
        None => {
            log::warn!("{name} is not configured, using an ephemeral secret");
            Ok(generate_secret()?.to_vec())
        }
    }
}

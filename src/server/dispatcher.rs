use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    sync::mpsc::{Receiver, Sender as InboxSender, channel},
    task::JoinHandle,
};

use dispatch::{
    address::Address,
    cid::{CONNECTION_ID_LEN, ConnectionIdDeriver},
    packet::{PacketKind, PacketMeta},
    registry::{AddressRoutes, Registry},
    token::RetryTokenKey,
};

use crate::server::{
    connection::{ConnectionHandle, ConnectionSupervisor},
    handler::ServerHandler,
    sender::Sender,
};

/// Bound on a dispatcher's mailbox. Socket readers drop pre-handshake
/// packets once it fills; packets of established connections are queued.
pub const INBOX_CAPACITY: usize = 4096;

/// A classified datagram on its way from a socket reader to a dispatcher.
pub struct PacketRecord {
    pub peer: Address,
    pub data: Vec<u8>,
    pub meta: PacketMeta,
}

pub struct DispatcherOptions<T> {
    pub index: usize,
    pub quic: quiche::Config,
    pub sender: Sender,
    pub registry: Arc<Registry<ConnectionHandle>>,
    pub routes: Option<Arc<AddressRoutes>>,
    pub supervisor: Arc<ConnectionSupervisor<T>>,
    pub conn_ids: Arc<ConnectionIdDeriver>,
    pub tokens: Arc<RetryTokenKey>,
    pub payload_size: usize,
}

/// One routing worker.
///
/// Owns a shard of the inbound packet stream plus the transport config and
/// the scratch buffer stateless responses are built in; both die with the
/// worker. A dispatcher never blocks on anything but its own mailbox, and it
/// absorbs every per-packet failure as a logged drop.
struct Dispatcher<T> {
    index: usize,
    quic: quiche::Config,
    out: Vec<u8>,
    sender: Sender,
    registry: Arc<Registry<ConnectionHandle>>,
    routes: Option<Arc<AddressRoutes>>,
    supervisor: Arc<ConnectionSupervisor<T>>,
    conn_ids: Arc<ConnectionIdDeriver>,
    tokens: Arc<RetryTokenKey>,
}

/// Spawn a dispatcher worker, returning its mailbox.
pub fn spawn<T>(options: DispatcherOptions<T>) -> (InboxSender<PacketRecord>, JoinHandle<()>)
where
    T: ServerHandler,
{
    let (inbox, receiver) = channel(INBOX_CAPACITY);

    let dispatcher = Dispatcher {
        index: options.index,
        quic: options.quic,
        out: vec![0u8; options.payload_size],
        sender: options.sender,
        registry: options.registry,
        routes: options.routes,
        supervisor: options.supervisor,
        conn_ids: options.conn_ids,
        tokens: options.tokens,
    };

    (inbox, tokio::spawn(dispatcher.run(receiver)))
}

impl<T> Dispatcher<T>
where
    T: ServerHandler,
{
    async fn run(mut self, mut inbox: Receiver<PacketRecord>) {
        while let Some(record) = inbox.recv().await {
            self.on_packet(record).await;
        }

        log::info!("dispatcher stopped: index={}", self.index);
    }

    async fn on_packet(&mut self, record: PacketRecord) {
        match record.meta.kind {
            PacketKind::Initial if !record.meta.version_supported => {
                self.negotiate_version(&record)
            }
            PacketKind::Initial => self.on_initial(record).await,
            _ => self.on_regular(record),
        }
    }

    /// An Initial for a version this server does not speak: answer with the
    /// version list, nothing else.
    fn negotiate_version(&mut self, record: &PacketRecord) {
        let scid = quiche::ConnectionId::from_ref(&record.meta.scid);
        let dcid = quiche::ConnectionId::from_ref(&record.meta.dcid);

        match quiche::negotiate_version(&scid, &dcid, &mut self.out) {
            Ok(size) => self.reply(record.peer, size),
            Err(e) => log::debug!(
                "version negotiation build failed: peer={}, error={e:?}",
                record.peer
            ),
        }
    }

    async fn on_initial(&mut self, record: PacketRecord) {
        // Packets of a connection that already exists, including duplicated
        // first flights, go straight to their owner.
        if let Some(handle) = self.registry.lookup(&record.meta.dcid) {
            forward(&handle, record);
            return;
        }

        let token = record.meta.token.as_deref().unwrap_or_default();

        // No token yet: the peer has not proven its address. Send a Retry
        // and stay stateless.
        if token.is_empty() {
            self.retry(&record);
            return;
        }

        // Post-retry flights carry the connection id this server minted.
        if record.meta.dcid.len() != CONNECTION_ID_LEN {
            log::trace!(
                "dropped initial with unexpected dcid length: peer={}, len={}",
                record.peer,
                record.meta.dcid.len()
            );
            return;
        }

        let odcid = match self
            .tokens
            .validate(&record.peer, &record.meta.dcid, token)
        {
            Ok(odcid) => odcid,
            Err(_) => {
                log::debug!("dropped initial with invalid token: peer={}", record.peer);
                return;
            }
        };

        match self
            .supervisor
            .clone()
            .create_connection(
                record.peer,
                &record.meta.scid,
                &record.meta.dcid,
                &odcid,
                &mut self.quic,
                &self.sender,
            )
            .await
        {
            Ok(Some(handle)) => forward(&handle, record),
            Ok(None) => {}
            Err(e) => log::error!("connection setup failed: peer={}, error={e}", record.peer),
        }
    }

    /// Stateless retry: derive the connection id this peer will come back
    /// with and bind it into the token.
    fn retry(&mut self, record: &PacketRecord) {
        let new_cid = self.conn_ids.derive(&record.meta.dcid);
        let token = self
            .tokens
            .mint(&record.peer, &record.meta.dcid, &new_cid);

        let scid = quiche::ConnectionId::from_ref(&record.meta.scid);
        let dcid = quiche::ConnectionId::from_ref(&record.meta.dcid);
        let new_cid = quiche::ConnectionId::from_ref(&new_cid);

        match quiche::retry(
            &scid,
            &dcid,
            &new_cid,
            &token,
            record.meta.version,
            &mut self.out,
        ) {
            Ok(size) => self.reply(record.peer, size),
            Err(e) => log::debug!("retry build failed: peer={}, error={e:?}", record.peer),
        }
    }

    /// Anything that is not an Initial must belong to a live connection.
    /// Unknown peers get no response of any kind.
    fn on_regular(&mut self, record: PacketRecord) {
        let dcid_len = record.meta.dcid.len();
        if dcid_len != CONNECTION_ID_LEN && dcid_len != 0 {
            return;
        }

        if let Some(handle) = self.registry.lookup(&record.meta.dcid) {
            forward(&handle, record);
            return;
        }

        // Fallback for migrated peers, when the address table is enabled.
        if let Some(routes) = &self.routes {
            if let Some(cid) = routes.lookup(&record.peer) {
                if let Some(handle) = self.registry.lookup(&cid) {
                    forward(&handle, record);
                    return;
                }
            }
        }

        log::trace!("dropped packet for unknown connection: peer={}", record.peer);
    }

    /// Queue a stateless response; backpressure drops it rather than ever
    /// blocking ingress.
    fn reply(&mut self, peer: Address, size: usize) {
        if !self
            .sender
            .try_send(peer.socket_addr(), Bytes::copy_from_slice(&self.out[..size]))
        {
            log::trace!("stateless response dropped by sender backpressure: peer={peer}");
        }
    }
}

fn forward(handle: &ConnectionHandle, record: PacketRecord) {
    if !handle.forward(record.peer, record.data) {
        log::trace!(
            "dropped packet for busy connection: peer={}",
            record.peer
        );
    }
}

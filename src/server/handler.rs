/// Utility operations a handler may perform on the connection that delivered
/// the event.
///
/// The connection state machine is owned by its task; callbacks get a scoped
/// control handle instead of the machine itself.
pub struct ConnectionControl<'a> {
    conn: &'a mut quiche::Connection,
}

impl<'a> ConnectionControl<'a> {
    pub(crate) fn new(conn: &'a mut quiche::Connection) -> Self {
        Self { conn }
    }

    /// Transport-level trace id of the connection.
    pub fn trace_id(&self) -> &str {
        self.conn.trace_id()
    }

    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    /// Close the connection with an application error code.
    pub fn close(&mut self, code: u64, reason: &[u8]) {
        // Already-closed is an idempotent no-op.
        let _ = self.conn.close(true, code, reason);
    }

    pub fn stream_send(
        &mut self,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, quiche::Error> {
        self.conn.stream_send(stream_id, data, fin)
    }

    pub fn dgram_send(&mut self, data: &[u8]) -> Result<(), quiche::Error> {
        self.conn.dgram_send(data)
    }
}

/// Application callbacks invoked from connection tasks.
///
/// All callbacks default to no-ops; implement the ones the application cares
/// about. Callbacks run on the owning connection task, so a slow callback
/// stalls only that connection.
pub trait ServerHandler: Clone + Send + Sync + 'static {
    /// The handshake completed (or early data became available).
    #[allow(unused_variables)]
    fn on_established(&self, control: &mut ConnectionControl<'_>) {}

    /// Data arrived on a stream. `fin` marks the peer's final bytes.
    #[allow(unused_variables)]
    fn on_stream_data(
        &self,
        control: &mut ConnectionControl<'_>,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) {
    }

    /// An unreliable datagram arrived.
    #[allow(unused_variables)]
    fn on_dgram(&self, control: &mut ConnectionControl<'_>, data: &[u8]) {}

    /// The connection left the registry. Triggered when the connection life
    /// cycle ends for any reason: idle timeout, peer close, local close or
    /// task failure.
    #[allow(unused_variables)]
    fn on_closed(&self, cid: &[u8]) {}
}

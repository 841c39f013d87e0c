use crate::server::{ConnectionControl, ServerHandler};

/// Default application handler shipped with the binary.
///
/// Observes connection lifecycle events and logs them; embedders replace it
/// with their own [`ServerHandler`] implementation.
#[derive(Default, Clone)]
pub struct Observer;

impl Observer {
    pub fn new() -> Self {
        Self
    }
}

impl ServerHandler for Observer {
    fn on_established(&self, control: &mut ConnectionControl<'_>) {
        log::info!("session established: trace_id={}", control.trace_id());
    }

    fn on_stream_data(
        &self,
        control: &mut ConnectionControl<'_>,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) {
        log::trace!(
            "stream data: trace_id={}, stream_id={}, len={}, fin={}",
            control.trace_id(),
            stream_id,
            data.len(),
            fin
        );
    }

    fn on_dgram(&self, control: &mut ConnectionControl<'_>, data: &[u8]) {
        log::trace!(
            "dgram: trace_id={}, len={}",
            control.trace_id(),
            data.len()
        );
    }

    fn on_closed(&self, cid: &[u8]) {
        log::info!("session removed: cid_len={}", cid.len());
    }
}

use crate::Error;

/// Packet categories a datagram can carry in its first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    Short,
}

impl From<quiche::Type> for PacketKind {
    fn from(ty: quiche::Type) -> Self {
        match ty {
            quiche::Type::Initial => Self::Initial,
            quiche::Type::ZeroRTT => Self::ZeroRtt,
            quiche::Type::Handshake => Self::Handshake,
            quiche::Type::Retry => Self::Retry,
            quiche::Type::VersionNegotiation => Self::VersionNegotiation,
            quiche::Type::Short => Self::Short,
        }
    }
}

/// Everything the routing layer needs to know about a datagram, extracted
/// without touching the protected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub kind: PacketKind,
    pub version: u32,
    pub scid: Vec<u8>,
    pub dcid: Vec<u8>,
    pub token: Option<Vec<u8>>,
    pub version_supported: bool,
}

/// Parse just enough of a datagram's header to route it.
///
/// Delegates the header layout to the transport library; this function makes
/// no routing decisions.
pub fn classify(datagram: &mut [u8]) -> Result<PacketMeta, Error> {
    let hdr = quiche::Header::from_slice(datagram, quiche::MAX_CONN_ID_LEN)
        .map_err(|_| Error::MalformedPacket)?;

    Ok(PacketMeta {
        kind: hdr.ty.into(),
        version: hdr.version,
        scid: hdr.scid.to_vec(),
        dcid: hdr.dcid.to_vec(),
        token: hdr.token,
        version_supported: quiche::version_is_supported(hdr.version),
    })
}

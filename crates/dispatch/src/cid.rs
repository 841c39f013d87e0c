use aws_lc_rs::hmac;

/// Length of every locally issued connection id.
pub const CONNECTION_ID_LEN: usize = quiche::MAX_CONN_ID_LEN;

/// Keyed derivation of the local connection id from a peer-chosen DCID.
///
/// The derivation is a pseudorandom function of the DCID alone, so the server
/// can answer a first-flight Initial with a Retry carrying the new id without
/// remembering anything about the peer: when the id comes back as the DCID of
/// the follow-up Initial, re-deriving binds the two flights together.
///
/// # Test
///
/// ```
/// use webtransport_server_dispatch::cid::{ConnectionIdDeriver, CONNECTION_ID_LEN};
///
/// let deriver = ConnectionIdDeriver::new(b"0123456789abcdef0123456789abcdef");
///
/// let a = deriver.derive(b"initial-dcid");
/// let b = deriver.derive(b"initial-dcid");
///
/// assert_eq!(a, b);
/// assert_eq!(a.len(), CONNECTION_ID_LEN);
/// ```
pub struct ConnectionIdDeriver {
    key: hmac::Key,
}

impl ConnectionIdDeriver {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Derive the 20-byte local connection id for a peer DCID.
    pub fn derive(&self, dcid: &[u8]) -> [u8; CONNECTION_ID_LEN] {
        let tag = hmac::sign(&self.key, dcid);

        let mut cid = [0u8; CONNECTION_ID_LEN];
        cid.copy_from_slice(&tag.as_ref()[..CONNECTION_ID_LEN]);
        cid
    }
}

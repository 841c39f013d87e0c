use std::time::{SystemTime, UNIX_EPOCH};

use aws_lc_rs::hmac;

use crate::{Error, address::Address, cid::CONNECTION_ID_LEN};

/// How long a minted token stays valid.
pub const TOKEN_LIFETIME_SECS: u64 = 10;

const TAG_LEN: usize = 32;

/// Smallest structurally possible token: one length byte, an empty ODCID, the
/// issuance time and the tag.
const MIN_TOKEN_LEN: usize = 1 + 8 + TAG_LEN;

/// Mints and validates the opaque address-validation tokens echoed back by
/// clients after a Retry.
///
/// A token is `body || tag` with `body = odcid_len || odcid || issued_at` and
/// the tag an HMAC-SHA256 over `{peer address, new connection id, body}`. The
/// address binding stops a spoofed-source peer from replaying someone else's
/// token, the new-id binding stops replaying it against a different
/// connection, and the issuance time bounds the replay window.
///
/// # Test
///
/// ```
/// use webtransport_server_dispatch::address::Address;
/// use webtransport_server_dispatch::token::RetryTokenKey;
///
/// let key = RetryTokenKey::new(b"0123456789abcdef0123456789abcdef");
/// let peer = Address::new("192.0.2.1:4433".parse().unwrap());
///
/// let token = key.mint(&peer, b"original-dcid", &[7; 20]);
/// let odcid = key.validate(&peer, &[7; 20], &token).unwrap();
///
/// assert_eq!(odcid, b"original-dcid");
/// ```
pub struct RetryTokenKey {
    key: hmac::Key,
}

impl RetryTokenKey {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Mint a token binding `{peer, odcid, new_cid}` at the current time.
    pub fn mint(&self, address: &Address, odcid: &[u8], new_cid: &[u8]) -> Vec<u8> {
        self.mint_at(address, odcid, new_cid, unix_now())
    }

    pub fn mint_at(
        &self,
        address: &Address,
        odcid: &[u8],
        new_cid: &[u8],
        issued_at: u64,
    ) -> Vec<u8> {
        debug_assert!(odcid.len() <= CONNECTION_ID_LEN);

        let mut token = Vec::with_capacity(1 + odcid.len() + 8 + TAG_LEN);
        token.push(odcid.len() as u8);
        token.extend_from_slice(odcid);
        token.extend_from_slice(&issued_at.to_be_bytes());

        let tag = self.tag(address, new_cid, &token);
        token.extend_from_slice(tag.as_ref());
        token
    }

    /// Check a token against the peer it arrived from and the connection id
    /// it arrived on, returning the original DCID it was minted for.
    pub fn validate(
        &self,
        address: &Address,
        new_cid: &[u8],
        token: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.validate_at(address, new_cid, token, unix_now())
    }

    pub fn validate_at(
        &self,
        address: &Address,
        new_cid: &[u8],
        token: &[u8],
        now: u64,
    ) -> Result<Vec<u8>, Error> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(Error::InvalidToken);
        }

        let (body, tag) = token.split_at(token.len() - TAG_LEN);

        // The MAC comparison must not leak how far it matched.
        let mut message = address.to_canonical_bytes();
        message.extend_from_slice(new_cid);
        message.extend_from_slice(body);
        hmac::verify(&self.key, &message, tag).map_err(|_| Error::InvalidToken)?;

        let odcid_len = body[0] as usize;
        if odcid_len > CONNECTION_ID_LEN || body.len() != 1 + odcid_len + 8 {
            return Err(Error::InvalidToken);
        }

        let odcid = &body[1..1 + odcid_len];
        let issued_at = u64::from_be_bytes(
            body[1 + odcid_len..]
                .try_into()
                .map_err(|_| Error::InvalidToken)?,
        );

        if issued_at > now || now - issued_at > TOKEN_LIFETIME_SECS {
            return Err(Error::InvalidToken);
        }

        Ok(odcid.to_vec())
    }

    fn tag(&self, address: &Address, new_cid: &[u8], body: &[u8]) -> hmac::Tag {
        let mut ctx = hmac::Context::with_key(&self.key);
        ctx.update(&address.to_canonical_bytes());
        ctx.update(new_cid);
        ctx.update(body);
        ctx.sign()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

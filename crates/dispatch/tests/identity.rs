use std::{sync::Arc, thread};

use ahash::RandomState;
use webtransport_server_dispatch::{
    Error,
    address::Address,
    cid::{CONNECTION_ID_LEN, ConnectionIdDeriver},
    packet::{PacketKind, classify},
    registry::{AddressRoutes, Registry, shard_for},
    token::{RetryTokenKey, TOKEN_LIFETIME_SECS},
};

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

fn peer(addr: &str) -> Address {
    Address::new(addr.parse().unwrap())
}

#[test]
fn derive_is_deterministic_and_fixed_length() {
    let deriver = ConnectionIdDeriver::new(SECRET);

    for dcid in [&b""[..], b"\x02", b"a-typical-dcid", &[0xff; 20]] {
        let first = deriver.derive(dcid);
        let second = deriver.derive(dcid);

        assert_eq!(first, second);
        assert_eq!(first.len(), CONNECTION_ID_LEN);
    }

    assert_ne!(deriver.derive(b"one"), deriver.derive(b"two"));
    assert_ne!(
        ConnectionIdDeriver::new(b"another-secret-another-secret-00").derive(b"one"),
        deriver.derive(b"one")
    );
}

#[test]
fn token_round_trip_within_window() {
    let key = RetryTokenKey::new(SECRET);
    let address = peer("192.0.2.1:4433");
    let new_cid = [7u8; CONNECTION_ID_LEN];

    let token = key.mint_at(&address, b"original-dcid", &new_cid, 1000);

    for now in [1000, 1001, 1000 + TOKEN_LIFETIME_SECS] {
        let odcid = key.validate_at(&address, &new_cid, &token, now).unwrap();
        assert_eq!(odcid, b"original-dcid");
    }
}

#[test]
fn token_does_not_cross_peers() {
    let key = RetryTokenKey::new(SECRET);
    let new_cid = [7u8; CONNECTION_ID_LEN];

    let token = key.mint_at(&peer("192.0.2.1:4433"), b"original-dcid", &new_cid, 1000);

    // Different host, and same host with a different port.
    for other in [peer("192.0.2.2:4433"), peer("192.0.2.1:4434")] {
        assert_eq!(
            key.validate_at(&other, &new_cid, &token, 1000),
            Err(Error::InvalidToken)
        );
    }
}

#[test]
fn token_is_bound_to_the_issued_connection_id() {
    let key = RetryTokenKey::new(SECRET);
    let address = peer("192.0.2.1:4433");

    let token = key.mint_at(&address, b"original-dcid", &[7u8; 20], 1000);

    assert_eq!(
        key.validate_at(&address, &[8u8; 20], &token, 1000),
        Err(Error::InvalidToken)
    );
}

#[test]
fn token_expires() {
    let key = RetryTokenKey::new(SECRET);
    let address = peer("192.0.2.1:4433");
    let new_cid = [7u8; CONNECTION_ID_LEN];

    let token = key.mint_at(&address, b"original-dcid", &new_cid, 1000);

    assert_eq!(
        key.validate_at(&address, &new_cid, &token, 1000 + TOKEN_LIFETIME_SECS + 1),
        Err(Error::InvalidToken)
    );

    // A token from the future is just as stale.
    assert_eq!(
        key.validate_at(&address, &new_cid, &token, 999),
        Err(Error::InvalidToken)
    );
}

#[test]
fn token_rejects_truncation_and_tampering() {
    let key = RetryTokenKey::new(SECRET);
    let address = peer("192.0.2.1:4433");
    let new_cid = [7u8; CONNECTION_ID_LEN];

    let token = key.mint_at(&address, b"original-dcid", &new_cid, 1000);

    for len in [0, 1, 31, 40] {
        assert_eq!(
            key.validate_at(&address, &new_cid, &token[..len], 1000),
            Err(Error::InvalidToken)
        );
    }

    let mut forged = token.clone();
    *forged.last_mut().unwrap() ^= 0x01;
    assert_eq!(
        key.validate_at(&address, &new_cid, &forged, 1000),
        Err(Error::InvalidToken)
    );

    let mut body_flip = token.clone();
    body_flip[1] ^= 0x01;
    assert_eq!(
        key.validate_at(&address, &new_cid, &body_flip, 1000),
        Err(Error::InvalidToken)
    );
}

#[test]
fn registry_insert_is_unique() {
    let registry = Registry::new();

    registry.insert_unique(&[1u8; 20], "a").unwrap();
    assert_eq!(
        registry.insert_unique(&[1u8; 20], "b"),
        Err(Error::AlreadyRegistered)
    );

    assert_eq!(registry.lookup(&[1u8; 20]), Some("a"));
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.remove(&[1u8; 20]), Some("a"));
    assert_eq!(registry.lookup(&[1u8; 20]), None);
    assert!(registry.is_empty());
}

#[test]
fn registry_race_has_exactly_one_winner() {
    let registry = Arc::new(Registry::new());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = registry.clone();
            thread::spawn(move || registry.insert_unique(&[9u8; 20], worker).is_ok())
        })
        .collect();

    let winners = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(registry.len(), 1);

    // The losers can adopt the surviving handle.
    assert!(registry.lookup(&[9u8; 20]).is_some());
}

#[test]
fn sharding_is_stable() {
    let state = RandomState::new();
    let deriver = ConnectionIdDeriver::new(SECRET);

    for dcid in [&b"alpha"[..], b"beta", &[3u8; 20]] {
        let cid = deriver.derive(dcid);
        let bucket = shard_for(&state, &cid, 4);

        assert!(bucket < 4);
        for _ in 0..32 {
            assert_eq!(shard_for(&state, &deriver.derive(dcid), 4), bucket);
        }
    }
}

#[test]
fn address_routes_follow_the_connection() {
    let routes = AddressRoutes::new();
    let address = peer("192.0.2.1:4433");

    routes.insert(address, &[1u8; 20]);
    assert_eq!(routes.lookup(&address), Some(vec![1u8; 20]));

    routes.remove_cid(&[1u8; 20]);
    assert_eq!(routes.lookup(&address), None);
}

fn craft_initial(version: u32, scid: &[u8], dcid: &[u8], token: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(1200);
    datagram.push(0xc3);
    datagram.extend_from_slice(&version.to_be_bytes());
    datagram.push(dcid.len() as u8);
    datagram.extend_from_slice(dcid);
    datagram.push(scid.len() as u8);
    datagram.extend_from_slice(scid);
    datagram.push(token.len() as u8);
    datagram.extend_from_slice(token);

    let remainder = 1200 - datagram.len() - 2;
    datagram.extend_from_slice(&(0x4000u16 | remainder as u16).to_be_bytes());
    datagram.resize(1200, 0);
    datagram
}

#[test]
fn classify_extracts_routing_fields() {
    let scid: Vec<u8> = (1..=20).collect();
    let dcid: Vec<u8> = (101..=120).collect();

    let mut datagram = craft_initial(quiche::PROTOCOL_VERSION, &scid, &dcid, b"tok");
    let meta = classify(&mut datagram).unwrap();

    assert_eq!(meta.kind, PacketKind::Initial);
    assert_eq!(meta.version, quiche::PROTOCOL_VERSION);
    assert_eq!(meta.scid, scid);
    assert_eq!(meta.dcid, dcid);
    assert_eq!(meta.token.as_deref(), Some(&b"tok"[..]));
    assert!(meta.version_supported);
}

#[test]
fn classify_flags_unsupported_versions() {
    let mut datagram = craft_initial(0xdead_beef, &[1u8; 20], &[2u8; 20], b"");
    let meta = classify(&mut datagram).unwrap();

    assert_eq!(meta.kind, PacketKind::Initial);
    assert!(!meta.version_supported);
}

#[test]
fn classify_rejects_garbage() {
    assert_eq!(classify(&mut []), Err(Error::MalformedPacket));
    assert_eq!(classify(&mut [0xc3]), Err(Error::MalformedPacket));
}

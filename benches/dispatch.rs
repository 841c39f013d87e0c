use criterion::{Criterion, criterion_group, criterion_main};

use dispatch::{
    address::Address, cid::ConnectionIdDeriver, packet::classify, token::RetryTokenKey,
};

fn craft_initial(dcid: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(1200);
    datagram.push(0xc3);
    datagram.extend_from_slice(&quiche::PROTOCOL_VERSION.to_be_bytes());
    datagram.push(dcid.len() as u8);
    datagram.extend_from_slice(dcid);
    datagram.push(20);
    datagram.extend_from_slice(&[1u8; 20]);
    datagram.push(0);

    let remainder = 1200 - datagram.len() - 2;
    datagram.extend_from_slice(&(0x4000u16 | remainder as u16).to_be_bytes());
    datagram.resize(1200, 0);
    datagram
}

fn criterion_benchmark(c: &mut Criterion) {
    let conn_ids = ConnectionIdDeriver::new(b"bench-connection-id-secret-01234");
    let tokens = RetryTokenKey::new(b"bench-retry-token-secret-0123456");
    let peer = Address::new("192.0.2.1:4433".parse().unwrap());

    let dcid = [2u8; 20];
    let new_cid = conn_ids.derive(&dcid);
    let token = tokens.mint(&peer, &dcid, &new_cid);
    let template = craft_initial(&dcid);

    c.bench_function("derive_connection_id", |b| {
        b.iter(|| conn_ids.derive(&dcid));
    });

    c.bench_function("mint_retry_token", |b| {
        b.iter(|| tokens.mint(&peer, &dcid, &new_cid));
    });

    c.bench_function("validate_retry_token", |b| {
        b.iter(|| tokens.validate(&peer, &new_cid, &token).unwrap());
    });

    c.bench_function("classify_initial", |b| {
        b.iter(|| {
            let mut datagram = template.clone();
            classify(&mut datagram).unwrap()
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

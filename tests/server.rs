use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rand::RngCore;
use tokio::{net::UdpSocket, time::timeout};

use dispatch::cid::ConnectionIdDeriver;
use webtransport_server::{
    config::{Config, Tls},
    observer::Observer,
    server::{self, Server},
};

const TOKEN_SECRET: &str = "integration-token-secret-0123456789";
const CID_SECRET: &str = "integration-cid-secret-0123456789ab";

async fn start_server(tls: Option<Tls>) -> Result<Server<Observer>> {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".parse()?;
    config.server.port = 0;
    config.server.socket_pool_size = 2;
    config.server.dispatcher_pool_size = 2;
    config.server.socket_polling_timeout = 20;
    config.secrets.token_secret = Some(TOKEN_SECRET.to_string());
    config.secrets.connection_id_secret = Some(CID_SECRET.to_string());
    config.tls = tls;

    let config = Arc::new(config);
    Ok(server::start(&config, &Observer::new()).await?)
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

fn craft_short(dcid: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0x40];
    datagram.extend_from_slice(dcid);
    datagram.extend_from_slice(&[0u8; 32]);
    datagram
}

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Result<usize> {
    let (size, _) = timeout(Duration::from_secs(2), socket.recv_from(buf)).await??;
    Ok(size)
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 1500];
    let result = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expected the packet to be dropped");
}

#[tokio::test]
async fn unknown_version_gets_version_negotiation() -> Result<()> {
    let server = start_server(None).await?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;

    let scid: Vec<u8> = (1..=20).collect();
    let dcid: Vec<u8> = (2..=21).collect();

    socket
        .send_to(
            &craft_initial(0xdead_beef, &scid, &dcid, b""),
            server.local_addr(),
        )
        .await?;

    let mut buf = [0u8; 1500];
    let size = recv(&socket, &mut buf).await?;

    let hdr = quiche::Header::from_slice(&mut buf[..size], quiche::MAX_CONN_ID_LEN)?;
    assert_eq!(hdr.ty, quiche::Type::VersionNegotiation);

    // The response echoes the ids swapped.
    assert_eq!(hdr.dcid.as_ref(), scid.as_slice());
    assert_eq!(hdr.scid.as_ref(), dcid.as_slice());
    assert!(hdr.versions.unwrap().contains(&quiche::PROTOCOL_VERSION));

    // Exactly one datagram.
    expect_silence(&socket).await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn first_flight_gets_a_retry_with_a_derived_connection_id() -> Result<()> {
    let server = start_server(None).await?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;

    let scid = [1u8; 20];
    let dcid = [2u8; 20];

    socket
        .send_to(
            &craft_initial(quiche::PROTOCOL_VERSION, &scid, &dcid, b""),
            server.local_addr(),
        )
        .await?;

    let mut buf = [0u8; 1500];
    let size = recv(&socket, &mut buf).await?;

    let hdr = quiche::Header::from_slice(&mut buf[..size], quiche::MAX_CONN_ID_LEN)?;
    assert_eq!(hdr.ty, quiche::Type::Retry);
    assert_eq!(hdr.dcid.as_ref(), scid.as_slice());

    // The new id is a pure function of the peer's DCID.
    let deriver = ConnectionIdDeriver::new(CID_SECRET.as_bytes());
    assert_eq!(hdr.scid.as_ref(), deriver.derive(&dcid).as_slice());
    assert!(!hdr.token.unwrap().is_empty());

    // The retry alone creates no state: packets on the new id are dropped.
    let new_cid = deriver.derive(&dcid);
    socket
        .send_to(&craft_short(&new_cid), server.local_addr())
        .await?;
    expect_silence(&socket).await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn token_replayed_from_another_address_is_dropped() -> Result<()> {
    let server = start_server(None).await?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;

    let scid = [1u8; 20];
    let dcid = [2u8; 20];

    socket
        .send_to(
            &craft_initial(quiche::PROTOCOL_VERSION, &scid, &dcid, b""),
            server.local_addr(),
        )
        .await?;

    let mut buf = [0u8; 1500];
    let size = recv(&socket, &mut buf).await?;

    let hdr = quiche::Header::from_slice(&mut buf[..size], quiche::MAX_CONN_ID_LEN)?;
    assert_eq!(hdr.ty, quiche::Type::Retry);

    let new_cid = hdr.scid.to_vec();
    let token = hdr.token.unwrap();

    // Same flight, different source port: the address binding must fail.
    let other = UdpSocket::bind("127.0.0.1:0").await?;
    other
        .send_to(
            &craft_initial(quiche::PROTOCOL_VERSION, &scid, &new_cid, &token),
            server.local_addr(),
        )
        .await?;
    expect_silence(&other).await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn short_packets_for_unknown_connections_are_dropped() -> Result<()> {
    let server = start_server(None).await?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;

    let mut dcid = [0u8; 20];
    rand::rng().fill_bytes(&mut dcid);

    socket
        .send_to(&craft_short(&dcid), server.local_addr())
        .await?;
    expect_silence(&socket).await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn initial_with_token_and_bad_dcid_length_is_dropped() -> Result<()> {
    let server = start_server(None).await?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;

    socket
        .send_to(
            &craft_initial(quiche::PROTOCOL_VERSION, &[1u8; 20], &[2u8; 12], &[0u8; 61]),
            server.local_addr(),
        )
        .await?;
    expect_silence(&socket).await;

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handshake_completes_behind_retry() -> Result<()> {
    let certificates = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;

    let dir = std::env::temp_dir().join(format!("webtransport-server-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certificates.cert.pem())?;
    std::fs::write(&key_path, certificates.key_pair.serialize_pem())?;

    let server = start_server(Some(Tls {
        certificate_chain: cert_path.display().to_string(),
        private_key: key_path.display().to_string(),
    }))
    .await?;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let local = socket.local_addr()?;

    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.verify_peer(false);
    config.set_application_protos(&[b"h3"])?;
    config.set_initial_max_data(1_000_000);
    config.set_initial_max_stream_data_bidi_local(100_000);
    config.set_initial_max_stream_data_bidi_remote(100_000);
    config.set_initial_max_stream_data_uni(100_000);
    config.set_initial_max_streams_bidi(10);
    config.set_initial_max_streams_uni(10);
    config.set_max_idle_timeout(5_000);

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    rand::rng().fill_bytes(&mut scid);

    let mut conn = quiche::connect(
        Some("localhost"),
        &quiche::ConnectionId::from_ref(&scid),
        local,
        server.local_addr(),
        &mut config,
    )?;

    let mut out = [0u8; 1500];
    let mut buf = [0u8; 65535];

    // Drive the client until the handshake lands; the server forces a retry
    // first, which the client absorbs transparently.
    for _ in 0..50 {
        loop {
            match conn.send(&mut out) {
                Ok((size, info)) => {
                    socket.send_to(&out[..size], info.to).await?;
                }
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if conn.is_established() {
            break;
        }

        match timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            Ok(received) => {
                let (size, from) = received?;
                let _ = conn.recv(&mut buf[..size], quiche::RecvInfo { from, to: local });
            }
            Err(_) => conn.on_timeout(),
        }
    }

    assert!(conn.is_established());

    server.shutdown().await;
    Ok(())
}

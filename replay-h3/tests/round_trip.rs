//! Integration: client and server H3Connections exchange a request and a
//! response over real QuicEndpoints on loopback.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use protocol_proxy::ProxyVersion;
use replay_h3::{H3Connection, H3Event, HeaderField, Settings};
use replay_quic::{QuicConfig, QuicEndpoint, Role, TlsContext, TlsMaterial};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

fn init_tls() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        TlsContext::init(Some(TlsMaterial {
            server_chain: vec![CertificateDer::from(cert.cert)],
            server_key: key.into(),
            roots: None,
        }))
        .unwrap();
    });
}

/// Minimal scripted server: answers every request with 200 and an echo of
/// the request body, trailing a `server: replay` header section exchange.
fn spawn_server(addr_tx: mpsc::Sender<SocketAddr>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut quic =
            QuicEndpoint::bind(QuicConfig::default(), "127.0.0.1:0".parse().unwrap()).unwrap();
        addr_tx.send(quic.local_addr()).unwrap();
        let mut h3 = H3Connection::new(Role::Server, Settings::default());

        let mut bodies: std::collections::HashMap<u64, Vec<u8>> = Default::default();
        let deadline = Instant::now() + Duration::from_secs(10);

        'outer: while Instant::now() < deadline {
            if quic.drive(Duration::from_millis(10)).is_err() {
                break;
            }
            while let Some(event) = quic.poll_event() {
                if matches!(event, replay_quic::QuicEvent::ConnectionClosed { .. }) {
                    break 'outer;
                }
                h3.handle_quic_event(&mut quic, &event).unwrap();
            }
            while let Some(event) = h3.poll_event() {
                match event {
                    H3Event::Headers { stream, end_stream, .. } => {
                        bodies.insert(u64::from(stream), Vec::new());
                        if end_stream {
                            h3.send_response(
                                &mut quic,
                                stream,
                                &[
                                    HeaderField::new(&b":status"[..], &b"200"[..]),
                                    HeaderField::new(&b"server"[..], &b"replay"[..]),
                                ],
                                true,
                            )
                            .unwrap();
                        }
                    }
                    H3Event::Data { stream, payload, end_stream } => {
                        let body = bodies.entry(u64::from(stream)).or_default();
                        body.extend_from_slice(&payload);
                        if end_stream {
                            let body = bodies.remove(&u64::from(stream)).unwrap_or_default();
                            h3.send_response(
                                &mut quic,
                                stream,
                                &[HeaderField::new(&b":status"[..], &b"200"[..])],
                                false,
                            )
                            .unwrap();
                            h3.send_data(&mut quic, stream, &body, true).unwrap();
                        }
                    }
                    _ => {}
                }
            }
        }
    })
}

#[test]
fn post_round_trip() {
    init_tls();
    let (addr_tx, addr_rx) = mpsc::channel();
    let server = spawn_server(addr_tx);
    let server_addr = addr_rx.recv().unwrap();

    let mut quic =
        QuicEndpoint::connect(QuicConfig::default(), None, server_addr, ProxyVersion::None)
            .unwrap();
    quic.drive_until_connected(Duration::from_secs(5)).unwrap();

    let mut h3 = H3Connection::new(Role::Client, Settings::default());
    h3.start(&mut quic).unwrap();

    // Wait for the SETTINGS exchange to settle.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !h3.is_ready() && Instant::now() < deadline {
        quic.drive(Duration::from_millis(10)).unwrap();
        while let Some(event) = quic.poll_event() {
            h3.handle_quic_event(&mut quic, &event).unwrap();
        }
    }
    assert!(h3.is_ready(), "SETTINGS exchange did not complete");
    assert_eq!(h3.peer_settings().unwrap().qpack_max_table_capacity, 0);

    let request = [
        HeaderField::new(&b":method"[..], &b"POST"[..]),
        HeaderField::new(&b":scheme"[..], &b"https"[..]),
        HeaderField::new(&b":authority"[..], &b"replay.test"[..]),
        HeaderField::new(&b":path"[..], &b"/echo"[..]),
        HeaderField::new(&b"content-length"[..], &b"11"[..]),
    ];
    let stream = h3.send_request(&mut quic, &request, false).unwrap();
    h3.send_data(&mut quic, stream, b"hello world", true).unwrap();

    let mut status = None;
    let mut body = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    'outer: while Instant::now() < deadline {
        quic.drive(Duration::from_millis(10)).unwrap();
        while let Some(event) = quic.poll_event() {
            h3.handle_quic_event(&mut quic, &event).unwrap();
        }
        while let Some(event) = h3.poll_event() {
            match event {
                H3Event::Headers { stream: s, fields, end_stream } => {
                    assert_eq!(s, stream);
                    status = fields
                        .iter()
                        .find(|f| f.name == b":status")
                        .map(|f| f.value.clone());
                    if end_stream {
                        break 'outer;
                    }
                }
                H3Event::Data { payload, end_stream, .. } => {
                    body.extend_from_slice(&payload);
                    if end_stream {
                        break 'outer;
                    }
                }
                H3Event::Error(e) => panic!("h3 error: {e}"),
                _ => {}
            }
        }
    }

    assert_eq!(status.as_deref(), Some(&b"200"[..]));
    assert_eq!(body, b"hello world");

    quic.close(0, b"test done");
    server.join().unwrap();
}

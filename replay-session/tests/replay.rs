//! End-to-end replays: a client H3Session runs scripted transactions
//! against a server H3Session over loopback UDP, with a PROXY preamble
//! ahead of the handshake and qlog capture on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol_proxy::ProxyVersion;
use replay_session::{Errata, H3Session, MessageSpec, Session, SessionConfig, Txn};
use replay_quic::TlsMaterial;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

fn qlog_dir() -> PathBuf {
    std::env::temp_dir().join(format!("replay-session-qlog-{}", std::process::id()))
}

fn init() -> Arc<AtomicI32> {
    static EXIT: std::sync::OnceLock<Arc<AtomicI32>> = std::sync::OnceLock::new();
    EXIT.get_or_init(|| {
        let exit_code = Arc::new(AtomicI32::new(0));
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let errata = H3Session::init(
            exit_code.clone(),
            &qlog_dir(),
            Some(TlsMaterial {
                server_chain: vec![CertificateDer::from(cert.cert)],
                server_key: key.into(),
                roots: None,
            }),
        );
        assert!(errata.is_ok(), "init failed:\n{errata}");
        exit_code.clone()
    })
    .clone()
}

fn server_config() -> SessionConfig {
    SessionConfig {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        run_deadline: Duration::from_secs(10),
        ..SessionConfig::default()
    }
}

fn client_config(pp_version: ProxyVersion) -> SessionConfig {
    SessionConfig {
        pp_version,
        run_deadline: Duration::from_secs(10),
        ..SessionConfig::default()
    }
}

/// Run `script` on a server session in a background thread, reporting the
/// bound address immediately and the server errata when done.
fn spawn_server(
    script: Vec<Txn>,
) -> (SocketAddr, mpsc::Receiver<Errata>, std::thread::JoinHandle<()>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (errata_tx, errata_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let mut session = H3Session::server(server_config());
        let addr = session.bind().expect("bind failed");
        addr_tx.send(addr).unwrap();
        let errata = session.run_transactions(&script, None, addr, 1.0);
        session.close();
        errata_tx.send(errata).unwrap();
    });
    let addr = addr_rx.recv().unwrap();
    (addr, errata_rx, handle)
}

fn get_txn(key: &str, path: &str) -> Txn {
    let request = MessageSpec::request("GET", "https", "replay.test", path)
        .with_field("uuid", key.as_bytes().to_vec());
    let response = MessageSpec::response(200)
        .with_field("content-length", &b"13"[..])
        .with_body(&b"hello replay\n"[..]);
    Txn::new(key, request, response)
}

#[test]
fn scripted_get_and_post_replay_cleanly() {
    init();

    let post = Txn::new(
        "t-post",
        MessageSpec::request("POST", "https", "replay.test", "/submit")
            .with_field("uuid", &b"t-post"[..])
            .with_field("content-type", &b"text/plain"[..])
            .with_body(&b"forty-two bytes of scripted request body.."[..]),
        MessageSpec::response(201).with_field("location", &b"/submit/1"[..]),
    );
    let script = vec![get_txn("t-get", "/a"), post];

    let (addr, server_errata, server) = spawn_server(script.clone());
    let mut client = H3Session::client(client_config(ProxyVersion::V2));
    let errata = client.run_transactions(&script, None, addr, 1.0);
    client.close();

    assert!(errata.is_ok(), "client errata:\n{errata}");
    assert_eq!(client.streams_opened(), 2);
    assert_eq!(client.open_streams(), 0);
    assert_eq!(client.finished_keys().len(), 2);
    assert!(client.finished_keys().contains("t-get"));
    assert!(client.finished_keys().contains("t-post"));

    let server_errata = server_errata.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(server_errata.is_ok(), "server errata:\n{server_errata}");
    let server_text = server_errata.to_string();
    assert!(
        server_text.contains("PROXY preamble advertised"),
        "server never saw the preamble:\n{server_text}"
    );
    server.join().unwrap();

    // One qlog file per connection, one JSON event per line. Other tests in
    // this binary may still be appending, so only complete lines count.
    let mut events_seen = 0;
    for entry in std::fs::read_dir(qlog_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "sqlog") {
            let contents = std::fs::read_to_string(&path).unwrap();
            for line in contents.lines() {
                if let Ok(event) = serde_json::from_str::<serde_json::Value>(line) {
                    assert!(event.get("name").is_some());
                    assert!(event.get("time").is_some());
                    events_seen += 1;
                }
            }
        }
    }
    assert!(events_seen > 0, "no qlog events were written");
}

#[test]
fn dependency_gating_holds_downstream_transaction() {
    init();

    // The server delays t1's response; t2 must not open until t1 finished.
    let mut t1 = get_txn("t1", "/first");
    t1.response_delay = Some(Duration::from_millis(300));
    let t2 = get_txn("t2", "/second").depending_on(&["t1"]);
    let script = vec![t1, t2];

    let (addr, server_errata, server) = spawn_server(script.clone());
    let mut client = H3Session::client(client_config(ProxyVersion::None));
    let started = Instant::now();
    let errata = client.run_transactions(&script, None, addr, 1.0);
    let elapsed = started.elapsed();
    client.close();

    assert!(errata.is_ok(), "client errata:\n{errata}");
    assert!(
        elapsed >= Duration::from_millis(300),
        "gating cannot have waited for t1 ({elapsed:?})"
    );

    // Completion of t1 must precede the launch of t2 in the diagnostics.
    let text = errata.to_string();
    let t1_done = text.find("[t1] matched").expect("t1 match note");
    let t2_open = text.find("[t2] opened stream").expect("t2 open note");
    assert!(
        t1_done < t2_open,
        "t2 was opened before t1 completed:\n{text}"
    );

    assert!(server_errata
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .is_ok());
    server.join().unwrap();
}

#[test]
fn expectation_mismatch_is_reported_and_replay_continues() {
    init();

    // The server's script answers 503 where the client expects 200.
    let clean = get_txn("t-clean", "/ok");
    let mut server_bad = get_txn("t-bad", "/drifted");
    server_bad.response = MessageSpec::response(503);
    let mut client_bad = get_txn("t-bad", "/drifted");
    client_bad.response = MessageSpec::response(200);

    let (addr, _server_errata, server) =
        spawn_server(vec![clean.clone(), server_bad]);
    let mut client = H3Session::client(client_config(ProxyVersion::None));
    let errata = client.run_transactions(&[clean, client_bad], None, addr, 1.0);
    client.close();
    server.join().unwrap();

    assert!(!errata.is_ok());
    let text = errata.to_string();
    assert!(text.contains("[t-bad] expectation mismatch: status 503"));
    // The clean transaction still completed.
    assert!(client.finished_keys().contains("t-clean"));
    assert!(client.finished_keys().contains("t-bad"));
    assert_eq!(client.open_streams(), 0);
}

#[test]
fn start_offsets_scale_with_the_rate_multiplier() {
    init();

    let txn = get_txn("t-offset", "/timed").starting_at(Duration::from_millis(300));
    let script = vec![txn];

    let (addr, _server_errata, server) = spawn_server(script.clone());
    let mut client = H3Session::client(client_config(ProxyVersion::None));
    let started = Instant::now();
    let errata = client.run_transactions(&script, None, addr, 0.5);
    let elapsed = started.elapsed();
    client.close();
    server.join().unwrap();

    assert!(errata.is_ok(), "client errata:\n{errata}");
    // 300 ms offset at half rate: launched no earlier than 150 ms in.
    assert!(
        elapsed >= Duration::from_millis(150),
        "offset not honored ({elapsed:?})"
    );
}

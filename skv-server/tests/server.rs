//! End-to-end tests over real sockets: one server per test, bound to an
//! ephemeral port, driven by `skv-client` or raw TCP streams.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use skv_client::CacheClient;
use skv_common::ServerConfig;
use skv_server::Server;
use skv_store::LruStore;

fn start_server(max_bytes: usize) -> Server {
    let config = ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        max_bytes,
        ..ServerConfig::default()
    };
    Server::start(config, LruStore::new(max_bytes)).expect("server starts")
}

fn client_for(server: &Server) -> CacheClient {
    CacheClient::connect(server.local_addr()).expect("client connects")
}

/// Polls `cond` until it holds or the deadline passes.
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn get_on_absent_key_keeps_connection_open() {
    let server = start_server(1024);
    let mut client = client_for(&server);

    assert_eq!(client.get(b"missing").expect("get"), None);

    // The same connection keeps serving commands.
    assert!(client.put(b"k", b"v").expect("put"));
    assert_eq!(client.get(b"k").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn store_semantics_over_the_wire() {
    let server = start_server(1024);
    let mut client = client_for(&server);

    assert!(client.add(b"k", b"one").expect("add"));
    assert!(!client.add(b"k", b"two").expect("add existing"));
    assert!(client.replace(b"k", b"three").expect("replace"));
    assert!(!client.replace(b"ghost", b"x").expect("replace missing"));
    assert_eq!(client.get(b"k").expect("get"), Some(b"three".to_vec()));
    assert!(client.delete(b"k").expect("delete"));
    assert!(!client.delete(b"k").expect("delete again"));
}

#[test]
fn pipelined_commands_answer_in_order() {
    let server = start_server(1024);
    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    // Two commands in a single segment.
    stream
        .write_all(b"put a 1\r\nx\r\nget a\r\n")
        .expect("write");

    let expected = b"STORED\r\nVALUE 1\r\nx\r\n";
    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    while response.len() < expected.len() {
        let n = stream.read(&mut buf).expect("read");
        assert!(n > 0, "connection closed early");
        response.extend_from_slice(&buf[..n]);
    }
    assert_eq!(response, expected);
}

#[test]
fn partial_command_then_close_unwinds_cleanly() {
    let server = start_server(1024);

    {
        let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
        stream.write_all(b"put half 5\r\nab").expect("write");
        // Dropping the stream closes it mid-command.
    }

    assert!(
        wait_until(|| {
            let snap = server.metrics();
            snap.connections_opened >= 1 && snap.connections_closed >= 1
        }),
        "worker did not unwind after the peer vanished"
    );

    // The server is still healthy.
    let mut client = client_for(&server);
    assert!(client.put(b"k", b"v").expect("put"));
}

#[test]
fn malformed_command_answers_server_error_and_closes() {
    let server = start_server(1024);
    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    stream.write_all(b"bump k 3\r\n").expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read to close");
    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("SERVER_ERROR "),
        "unexpected response: {text:?}"
    );
    assert!(text.ends_with("\r\n"));

    assert!(wait_until(|| server.metrics().errors_total >= 1));
}

#[test]
fn payload_without_terminator_answers_server_error() {
    let server = start_server(1024);
    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    // Declared two payload bytes, but the terminator slot holds "cd".
    stream.write_all(b"put k 2\r\nabcd").expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read to close");
    assert!(String::from_utf8_lossy(&response).starts_with("SERVER_ERROR "));
}

#[test]
fn concurrent_clients_respect_the_byte_budget() {
    // Entries are key (4 bytes) + value (6 bytes); the budget fits 500.
    const ENTRY: usize = 10;
    const PER_CLIENT: usize = 1000;
    let server = start_server(500 * ENTRY);
    let addr = server.local_addr();

    let writers: Vec<_> = [b'a', b'b']
        .into_iter()
        .map(|prefix| {
            thread::spawn(move || {
                let mut client = CacheClient::connect(addr).expect("client connects");
                for i in 0..PER_CLIENT {
                    let key = format!("{}{:03}", prefix as char, i);
                    assert!(client.put(key.as_bytes(), b"123456").expect("put"));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread");
    }

    let mut client = client_for(&server);
    let stats = client.stats().expect("stats");
    let items = stats
        .iter()
        .find(|(name, _)| name == "items")
        .map(|(_, value)| *value)
        .expect("items stat");
    let bytes = stats
        .iter()
        .find(|(name, _)| name == "bytes")
        .map(|(_, value)| *value)
        .expect("bytes stat");

    assert_eq!(items, 500, "exactly the budgeted entry count survives");
    assert!(bytes <= (500 * ENTRY) as u64);

    // Only the most recently inserted keys survive; the earliest keys from
    // both clients are gone.
    assert_eq!(client.get(b"a000").expect("get"), None);
    assert_eq!(client.get(b"b000").expect("get"), None);
}

#[test]
fn stop_unblocks_parked_workers_and_joins() {
    let mut server = start_server(1024);

    // Four established connections, each with its worker parked in read.
    let mut streams: Vec<TcpStream> = (0..4)
        .map(|_| {
            let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout");
            // One round-trip makes sure the worker fiber is up and parked.
            stream.write_all(b"get warm\r\n").expect("write");
            let mut line = [0u8; 32];
            let n = stream.read(&mut line).expect("read");
            assert!(n > 0);
            stream
        })
        .collect();

    server.stop();
    server.join().expect("join after stop");

    // Every worker closed its socket on the way out.
    for stream in &mut streams {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).expect("read after stop");
        assert_eq!(n, 0, "expected EOF after shutdown");
    }

    let snap = server.metrics();
    assert_eq!(snap.connections_opened, 4);
    assert_eq!(snap.connections_closed, 4);
}

#[test]
fn metrics_count_traffic() {
    let server = start_server(1024);
    let mut client = client_for(&server);

    assert!(client.put(b"k", b"v").expect("put"));
    assert_eq!(client.get(b"k").expect("get"), Some(b"v".to_vec()));

    assert!(wait_until(|| {
        let snap = server.metrics();
        snap.commands_total >= 2 && snap.bytes_read > 0 && snap.bytes_written > 0
    }));
}

#[test]
fn values_spanning_multiple_reads_store_intact() {
    let server = start_server(64 * 1024);
    let mut client = client_for(&server);

    // Larger than the worker's 4096-byte read buffer, so the payload
    // arrives across several reads.
    let value: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    assert!(client.put(b"big", &value).expect("put"));
    assert_eq!(client.get(b"big").expect("get"), Some(value));
}

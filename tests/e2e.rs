//! End-to-end tests over loopback TCP.
//!
//! Each test binds a real server on an ephemeral port, runs it in a
//! background thread and drives it with the library client.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use iovbench::buffer::{FIELD_COUNT, SENTINEL, filler};
use iovbench::report::{Progress, Report, ReportSink, Start};
use iovbench::{Client, ClientConfig, Server, ServerConfig, Shutdown};

// ── Helpers ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct CapturingSink {
    starts: Mutex<Vec<Start>>,
    progress: Mutex<Vec<Progress>>,
    results: Mutex<Vec<Report>>,
}

impl ReportSink for CapturingSink {
    fn print_start(&self, start: &Start) {
        self.starts.lock().unwrap().push(start.clone());
    }

    fn print_progress(&self, progress: &Progress) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn print_results(&self, report: &Report) {
        self.results.lock().unwrap().push(report.clone());
    }
}

fn server_config(message_size: usize, connections: usize, messages: u64) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        message_size,
        max_connections: connections,
        messages: Some(messages),
        ..Default::default()
    }
}

/// Start a server and return its address and a handle yielding its report.
fn start_server(config: ServerConfig) -> (std::net::SocketAddr, thread::JoinHandle<Report>) {
    let server = Server::bind(config, Shutdown::new()).expect("bind failed");
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || {
        server
            .run(Arc::new(CapturingSink::default()))
            .expect("server run failed")
    });
    (addr, handle)
}

fn client_config(
    addr: std::net::SocketAddr,
    message_size: usize,
    connections: usize,
) -> ClientConfig {
    ClientConfig {
        server: addr,
        message_size,
        connections,
        duration: Duration::from_secs(30),
        poll_interval: Duration::from_millis(50),
        verify: true,
        ..Default::default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn three_messages_of_64_bytes() {
    let (addr, server) = start_server(server_config(64, 1, 3));

    let sink = Arc::new(CapturingSink::default());
    let client = Client::new(client_config(addr, 64, 1), Shutdown::new()).unwrap();
    let report = client.run(sink.clone()).unwrap();

    assert_eq!(report.bytes, 192);
    assert_eq!(report.messages, 3);
    assert_eq!(sink.results.lock().unwrap().len(), 1);
    let starts = sink.starts.lock().unwrap();
    assert_eq!(starts[0].connections, 1);
    assert_eq!(starts[0].mode, None);

    let server_report = server.join().unwrap();
    assert_eq!(server_report.bytes, 192);
    assert_eq!(server_report.messages, 3);
    assert_eq!(server_report.connections, 1);
}

#[test]
fn filler_pattern_is_what_arrives() {
    use std::io::Read;

    let (addr, server) = start_server(server_config(64, 1, 1));
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    server.join().unwrap();

    assert_eq!(received.len(), 64);
    for (i, field) in received.chunks(8).enumerate() {
        assert_eq!(field, filler(i, 8).as_slice(), "field {i}");
        assert_eq!(field[7], SENTINEL);
    }
    assert_eq!(received.chunks(8).count(), FIELD_COUNT);
}

#[test]
fn concurrent_connections_are_counted_exactly() {
    let connections = 4;
    let messages = 2_500;
    let message_size = 256;
    let (addr, server) = start_server(ServerConfig {
        flush_every: 100,
        ..server_config(message_size, connections, messages)
    });

    let client = Client::new(
        client_config(addr, message_size, connections),
        Shutdown::new(),
    )
    .unwrap();
    let report = client.run(Arc::new(CapturingSink::default())).unwrap();

    let expected = connections as u64 * messages * message_size as u64;
    assert_eq!(report.bytes, expected);
    assert_eq!(report.messages, connections as u64 * messages);

    let server_report = server.join().unwrap();
    assert_eq!(server_report.bytes, expected);
    assert_eq!(server_report.messages, connections as u64 * messages);
}

#[test]
fn zero_copy_request_gives_identical_results() {
    let (addr, server) = start_server(ServerConfig {
        zero_copy: true,
        ..server_config(1024, 2, 500)
    });

    let client = Client::new(client_config(addr, 1024, 2), Shutdown::new()).unwrap();
    let report = client.run(Arc::new(CapturingSink::default())).unwrap();

    // Whether or not the kernel honours zero-copy, the stream is the same.
    assert_eq!(report.bytes, 2 * 500 * 1024);
    assert_eq!(report.messages, 1000);

    let server_report = server.join().unwrap();
    assert_eq!(server_report.bytes, 2 * 500 * 1024);
}

#[test]
fn client_reports_progress() {
    let (addr, server) = start_server(server_config(64, 1, 25));

    let sink = Arc::new(CapturingSink::default());
    let config = ClientConfig {
        progress_every: 10,
        latency_every: 5,
        ..client_config(addr, 64, 1)
    };
    let report = Client::new(config, Shutdown::new())
        .unwrap()
        .run(sink.clone())
        .unwrap();
    server.join().unwrap();

    let progress = sink.progress.lock().unwrap();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[1].messages, 20);
    assert_eq!(report.latency_samples, 5);
    assert!(report.mean_latency_us.is_some());
}

#[test]
fn client_deadline_ends_unbounded_stream() {
    let (addr, server) = start_server(ServerConfig {
        messages: None,
        ..server_config(64, 1, 1)
    });

    let config = ClientConfig {
        duration: Duration::from_millis(200),
        ..client_config(addr, 64, 1)
    };
    let report = Client::new(config, Shutdown::new())
        .unwrap()
        .run(Arc::new(CapturingSink::default()))
        .unwrap();
    assert!(report.messages > 0);
    assert_eq!(report.bytes, report.messages * 64);

    // The client hung up, so the server's only worker ends on its own.
    let server_report = server.join().unwrap();
    assert!(server_report.messages >= report.messages);
}

#[test]
fn client_connect_failure_is_an_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(client_config(addr, 64, 1), Shutdown::new()).unwrap();
    assert!(client.run(Arc::new(CapturingSink::default())).is_err());
}

#[test]
fn invalid_message_size_rejected_before_connecting() {
    let config = ClientConfig {
        message_size: 100,
        ..Default::default()
    };
    assert!(Client::new(config, Shutdown::new()).is_err());
}

//! Real-socket integration tests for the sequence-streaming protocol.
//!
//! Each test spawns a `Server` on a background thread bound to an
//! ephemeral port (`port: 0`), connects real `TcpStream`s to it, and
//! exercises the wire protocol end to end. Scenario labels (S1, S2,
//! ...) match the scenarios worked through while building the reactor
//! and command dispatch.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use seqstream::config::{CliArgs, Config};
use seqstream::server::Server;

fn spawn_server() -> (Server, SocketAddr) {
    let config = Config::resolve(CliArgs {
        config: None,
        host: Some("127.0.0.1".to_string()),
        port: Some(0),
        workers: Some(1),
        log_level: Some("error".to_string()),
    })
    .unwrap();

    let server = Server::new(config);
    let server_for_thread = server.clone();
    thread::spawn(move || {
        let _ = server_for_thread.run();
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        if Instant::now() > deadline {
            panic!("server did not bind within 5s");
        }
        thread::sleep(Duration::from_millis(5));
    };

    (server, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                return stream;
            }
            Err(e) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
                let _ = e;
            }
            Err(e) => panic!("failed to connect: {e}"),
        }
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read_line failed");
    line.trim_end_matches(['\r', '\n']).to_string()
}

#[test]
fn s1_single_sequence_streams_arithmetic_rows() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"seq1 10 5\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");

    writer.write_all(b"export seq\n").unwrap();
    assert_eq!(read_line(&mut reader), "10");
    assert_eq!(read_line(&mut reader), "15");
    assert_eq!(read_line(&mut reader), "20");

    server.stop();
}

#[test]
fn s2_three_sequences_interleaved_in_id_order() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"seq2 100 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");
    writer.write_all(b"seq1 10 10\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");
    writer.write_all(b"seq3 5 5\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");

    writer.write_all(b"export seq\n").unwrap();
    // BTreeMap iteration is ascending by id: seq1, seq2, seq3.
    assert_eq!(read_line(&mut reader), "10\t100\t5");
    assert_eq!(read_line(&mut reader), "20\t101\t10");
    assert_eq!(read_line(&mut reader), "30\t102\t15");

    server.stop();
}

#[test]
fn s3_duplicate_sequence_id_is_rejected() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"seq1 1 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");
    writer.write_all(b"seq1 2 2\n").unwrap();
    assert_eq!(read_line(&mut reader), "ERR: Sequence already exists");

    server.stop();
}

#[test]
fn s4_bad_id_and_zero_valued_params_are_rejected() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"seq4 1 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "ERR: Sequence number must be in range [1;3]");

    writer.write_all(b"seq1 0 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "ERR: Start parameter not valid");

    writer.write_all(b"seq1 1 0\n").unwrap();
    assert_eq!(read_line(&mut reader), "ERR: Step parameter not valid");

    server.stop();
}

#[test]
fn s5_unknown_command_reports_error_and_keeps_connection_open() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"bogus\n").unwrap();
    assert_eq!(read_line(&mut reader), "ERR: Unknown command");

    // Connection survives the error and still accepts further commands.
    writer.write_all(b"seq1 1 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");

    server.stop();
}

#[test]
fn s6_export_without_sequences_emits_one_blank_row_then_stops() {
    let (server, addr) = spawn_server();
    let stream = connect(addr);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    writer.write_all(b"export seq\n").unwrap();
    assert_eq!(read_line(&mut reader), "");

    // No further rows should follow: defining a sequence afterwards
    // must not retroactively resume a dead export.
    writer.write_all(b"seq1 1 1\n").unwrap();
    assert_eq!(read_line(&mut reader), "OK");

    let mut probe = [0u8; 16];
    stream_peek_is_empty(&mut reader, &mut probe);

    server.stop();
}

fn stream_peek_is_empty(reader: &mut BufReader<TcpStream>, buf: &mut [u8]) {
    reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    match reader.read(buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected no further bytes, got {n}: {:?}", &buf[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
        Err(e) => panic!("unexpected read error: {e}"),
    }
}

#[test]
#[ignore]
fn s7_many_connections_each_streaming_many_rows() {
    let (server, addr) = spawn_server();

    let mut handles = Vec::with_capacity(200);
    for _ in 0..200 {
        handles.push(thread::spawn(move || {
            let stream = connect(addr);
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            writer.write_all(b"seq1 0 1\n").unwrap();
            assert_eq!(read_line(&mut reader), "OK");
            writer.write_all(b"export seq\n").unwrap();

            for expected in 0u64..10_000 {
                assert_eq!(read_line(&mut reader), expected.to_string());
            }
        }));
    }

    for handle in handles {
        handle.join().expect("client thread panicked");
    }

    server.stop();
}

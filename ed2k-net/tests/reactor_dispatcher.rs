use ed2k_net::dispatcher::{Dispatcher, PROTOCOL_ORIGINAL};
use ed2k_net::frame::Header;
use ed2k_net::reactor::Reactor;
use ed2k_support::config::EngineConfig;
use slog::Logger;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn silent_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// Drives a live loopback TCP connection through one real reactor tick (accept + frame) and
/// one real dispatcher tick (route to a registered handler), the one layer a buffer-level mock
/// socket cannot exercise.
#[test]
fn end_to_end_accept_frame_and_dispatch() {
    let mut config = EngineConfig::default();
    config.thread_frequency_ms = 10;

    let mut reactor = Reactor::new(config.clone(), silent_logger()).unwrap();
    reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.listener_addr().unwrap();

    let mut dispatcher = Dispatcher::new(reactor.connection_table(), config.clone(), silent_logger());

    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_clone = invoked.clone();
    let payload_seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let payload_seen_clone = payload_seen.clone();

    dispatcher.register(
        PROTOCOL_ORIGINAL,
        0x10,
        |bytes| Ok(bytes.to_vec()),
        move |value, _conn| {
            invoked_clone.store(true, Ordering::SeqCst);
            *payload_seen_clone.lock().unwrap() = value;
        },
    );

    let mut client = TcpStream::connect(addr).unwrap();
    let mut packet = Vec::new();
    Header {
        protocol: PROTOCOL_ORIGINAL,
        size: 4,
        opcode: 0x10,
    }
    .write(&mut packet);
    packet.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    client.write_all(&packet).unwrap();

    for _ in 0..5 {
        reactor.tick().unwrap();
        dispatcher.tick();
        if invoked.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert!(invoked.load(Ordering::SeqCst), "handler should have run");
    assert_eq!(*payload_seen.lock().unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

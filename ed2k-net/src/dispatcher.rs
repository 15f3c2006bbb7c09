use crate::codec;
use crate::connection::Connection;
use crate::frame::{Header, HEADER_SIZE};
use crate::reactor::ConnectionTable;
use byteorder::{LittleEndian, ReadBytesExt};
use ed2k_support::config::EngineConfig;
use slog::{debug, trace, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const PROTOCOL_ORIGINAL: u8 = 0xE3;
pub const PROTOCOL_EXTENDED: u8 = 0xC5;
pub const PROTOCOL_PACKED_EXTENDED: u8 = 0xD4;
pub const PROTOCOL_KADEMLIA: u8 = 0xE4;
pub const PROTOCOL_KADEMLIA_PACKED: u8 = 0xE5;

fn is_unsupported_but_recognized(protocol: u8) -> bool {
    matches!(
        protocol,
        PROTOCOL_PACKED_EXTENDED | PROTOCOL_KADEMLIA | PROTOCOL_KADEMLIA_PACKED
    )
}

/// The decode-then-handle pipeline wrapped into a single callable, keyed by (protocol, opcode).
/// Built by `Dispatcher::register`; never constructed by hand.
pub type Handler = Box<dyn Fn(&[u8], &Connection) + Send + Sync>;

/// The second worker: drains every connection's incoming queue and routes packets to whichever
/// handler the host registered for their (protocol, opcode). Never touches a socket directly --
/// that is the reactor's job alone.
pub struct Dispatcher {
    connections: ConnectionTable,
    handlers: HashMap<(u8, u8), Handler>,
    config: EngineConfig,
    logger: slog::Logger,
}

impl Dispatcher {
    pub fn new(connections: ConnectionTable, config: EngineConfig, logger: slog::Logger) -> Dispatcher {
        Dispatcher {
            connections,
            handlers: HashMap::new(),
            config,
            logger,
        }
    }

    /// Registers the decode-then-handle pipeline for one `(protocol, opcode)` pair. The
    /// decoder runs first; a decode failure is logged and the packet is dropped without ever
    /// reaching `handler` -- the engine owns this failure mode, not the host.
    pub fn register<V, F>(
        &mut self,
        protocol: u8,
        opcode: u8,
        decoder: fn(&[u8]) -> Result<V, codec::DecodeError>,
        handler: F,
    ) where
        V: 'static,
        F: Fn(V, &Connection) + Send + Sync + 'static,
    {
        let logger = self.logger.clone();
        let wrapped: Handler = Box::new(move |payload, conn| match decoder(payload) {
            Ok(value) => handler(value, conn),
            Err(err) => {
                warn!(logger, "decoder rejected payload"; "error" => ?err);
            }
        });
        self.handlers.insert((protocol, opcode), wrapped);
    }

    /// One pass over every currently-live connection, draining and processing whatever is
    /// sitting in its incoming queue, then sleeping out the rest of the tick budget.
    pub fn tick(&self) {
        let tick_start = Instant::now();

        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();

        for conn in snapshot {
            while let Some(buf) = conn.pop_incoming() {
                self.process_packet(&buf, &conn);
            }
        }

        let budget = Duration::from_millis(self.config.thread_frequency_ms);
        let elapsed = tick_start.elapsed();
        if elapsed < budget {
            thread::sleep(budget - elapsed);
        }
    }

    fn process_packet(&self, buf: &[u8], conn: &Connection) {
        if buf.len() < HEADER_SIZE {
            warn!(self.logger, "dropping undersized buffer"; "len" => buf.len());
            return;
        }

        let header = Header::peek(buf);
        let expected_len = HEADER_SIZE + header.size as usize;
        if buf.len() != expected_len {
            warn!(self.logger, "dropping packet with mismatched length";
                "expected" => expected_len, "actual" => buf.len());
            return;
        }

        let payload = &buf[HEADER_SIZE..];

        match header.protocol {
            PROTOCOL_ORIGINAL | PROTOCOL_EXTENDED => {
                self.invoke_handler(header.protocol, header.opcode, payload, conn);
            }
            p if is_unsupported_but_recognized(p) => {
                debug!(self.logger, "ignoring unsupported protocol"; "protocol" => p);
            }
            p => {
                warn!(self.logger, "unknown protocol byte"; "protocol" => p);
            }
        }
    }

    /// Runs the registered handler behind `catch_unwind`: a handler panic must drop the one
    /// packet, not unwind the dispatcher thread and take down dispatch for every connection.
    fn invoke_handler(&self, protocol: u8, opcode: u8, payload: &[u8], conn: &Connection) {
        match self.handlers.get(&(protocol, opcode)) {
            Some(handler) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| handler(payload, conn)));
                if let Err(cause) = outcome {
                    warn!(self.logger, "handler panicked, packet dropped";
                        "protocol" => protocol, "opcode" => opcode,
                        "panic" => %panic_message(&*cause));
                }
            }
            None => {
                trace!(self.logger, "no handler registered";
                    "protocol" => protocol, "opcode" => opcode);
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Decoder for the common case of an original/extended-protocol payload that is just a tag
/// list: `u32` count followed by that many tags. A payload too short to even hold the count is
/// a decoder error (§7.5), not an empty list -- callers must not confuse "zero tags sent" with
/// "truncated payload".
pub fn decode_tag_list_payload(payload: &[u8]) -> Result<Vec<codec::Tag>, codec::DecodeError> {
    let mut cursor = std::io::Cursor::new(payload);
    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| codec::DecodeError::UnexpectedEof)?;
    Ok(codec::decode_tag_list(&mut cursor, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Header;
    use mio::net::TcpListener;
    use mio::Token;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, RwLock};
    use std::thread as std_thread;
    use std::time::Duration as StdDuration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    /// A connection plus the real peer-side socket it is talking to, so tests can write bytes
    /// the same way a live peer would and let `Connection::read` frame them for real.
    fn loopback_connection() -> (Arc<Connection>, StdTcpStream) {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std_thread::spawn(move || StdTcpStream::connect(addr).unwrap());
        std_thread::sleep(StdDuration::from_millis(20));
        let (server, _) = listener.accept().unwrap();
        let client = client.join().unwrap();

        let conn = Connection::new(server, Token(1), 16, 4096, test_logger());
        (Arc::new(conn), client)
    }

    fn single_connection_table(conn: &Arc<Connection>) -> ConnectionTable {
        let mut connections = HashMap::new();
        connections.insert(Token(1), conn.clone());
        Arc::new(RwLock::new(connections))
    }

    fn identity_decoder(bytes: &[u8]) -> Result<Vec<u8>, codec::DecodeError> {
        Ok(bytes.to_vec())
    }

    fn send_packet(peer: &mut StdTcpStream, conn: &Connection, protocol: u8, opcode: u8, payload: &[u8]) {
        let mut packet = Vec::new();
        Header {
            protocol,
            size: payload.len() as u32,
            opcode,
        }
        .write(&mut packet);
        packet.extend_from_slice(payload);

        peer.write_all(&packet).unwrap();
        std_thread::sleep(StdDuration::from_millis(20));
        conn.read(4096).unwrap();
    }

    #[test]
    fn routes_a_packet_to_its_registered_handler() {
        let (conn, mut peer) = loopback_connection();
        send_packet(&mut peer, &conn, PROTOCOL_ORIGINAL, 0x42, &[1, 2, 3]);

        let mut dispatcher =
            Dispatcher::new(single_connection_table(&conn), EngineConfig::default(), test_logger());

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = invoked.clone();
        let seen_payload: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_payload_clone = seen_payload.clone();

        dispatcher.register(PROTOCOL_ORIGINAL, 0x42, identity_decoder, move |value, _conn| {
            invoked_clone.store(true, Ordering::SeqCst);
            *seen_payload_clone.lock().unwrap() = value;
        });

        dispatcher.tick();

        assert!(invoked.load(Ordering::SeqCst));
        assert_eq!(*seen_payload.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn unsupported_protocol_is_logged_not_failed() {
        let (conn, mut peer) = loopback_connection();
        send_packet(&mut peer, &conn, PROTOCOL_KADEMLIA, 0x01, &[]);

        let dispatcher =
            Dispatcher::new(single_connection_table(&conn), EngineConfig::default(), test_logger());
        dispatcher.tick(); // should not panic, and the packet should simply be dropped
    }

    #[test]
    fn decoder_failure_is_logged_and_drops_the_packet_without_invoking_the_handler() {
        let (conn, mut peer) = loopback_connection();
        send_packet(&mut peer, &conn, PROTOCOL_ORIGINAL, 0x99, &[]); // too short for tag count

        let mut dispatcher =
            Dispatcher::new(single_connection_table(&conn), EngineConfig::default(), test_logger());

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = invoked.clone();

        dispatcher.register(
            PROTOCOL_ORIGINAL,
            0x99,
            decode_tag_list_payload,
            move |_tags, _conn| {
                invoked_clone.store(true, Ordering::SeqCst);
            },
        );

        dispatcher.tick();

        assert!(!invoked.load(Ordering::SeqCst), "handler must not run on decode failure");
    }

    #[test]
    fn a_panicking_handler_drops_only_its_own_packet_and_leaves_the_dispatcher_usable() {
        let (conn, mut peer) = loopback_connection();
        send_packet(&mut peer, &conn, PROTOCOL_ORIGINAL, 0x55, &[1, 2, 3]);

        let mut dispatcher =
            Dispatcher::new(single_connection_table(&conn), EngineConfig::default(), test_logger());

        dispatcher.register(PROTOCOL_ORIGINAL, 0x55, identity_decoder, |_value, _conn| {
            panic!("handler blew up");
        });

        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {})); // silence the panic's default stderr dump
        dispatcher.tick();
        std::panic::set_hook(previous_hook);

        // A second packet on a different opcode proves the dispatcher thread is still alive.
        send_packet(&mut peer, &conn, PROTOCOL_ORIGINAL, 0x42, &[4, 5, 6]);
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = invoked.clone();
        dispatcher.register(PROTOCOL_ORIGINAL, 0x42, identity_decoder, move |_value, _conn| {
            invoked_clone.store(true, Ordering::SeqCst);
        });
        dispatcher.tick();

        assert!(invoked.load(Ordering::SeqCst));
    }
}

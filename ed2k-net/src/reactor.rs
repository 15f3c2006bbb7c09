use crate::connection::Connection;
use crate::registry::EndpointRegistry;
use ed2k_support::config::EngineConfig;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::{debug, trace};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// The connections table is shared with the dispatcher: the reactor is the sole writer (it
/// alone adds and removes entries), the dispatcher only ever takes a read lock to iterate.
pub type ConnectionTable = Arc<RwLock<HashMap<Token, Arc<Connection>>>>;

const LISTENER_TOKEN: Token = Token(0);
const FIRST_CONNECTION_TOKEN: usize = 1;

/// The single I/O thread. Owns every live socket; nothing else is allowed to call `read`/
/// `write` on a `Connection`'s stream -- callers enqueue packets and let the next tick's
/// `write` pass drain them.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    connections: ConnectionTable,
    registry: EndpointRegistry,
    /// Remembers which ipv4 (if any) each token was registered under, so `sweep_dead` can undo
    /// the `registry` entry when the connection itself is reaped -- otherwise a disconnected
    /// peer's address would keep resolving to a token that no longer exists.
    registered_addresses: HashMap<Token, u32>,
    next_token: usize,
    config: EngineConfig,
    logger: slog::Logger,
}

impl Reactor {
    pub fn new(config: EngineConfig, logger: slog::Logger) -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(8192),
            listener: None,
            connections: Arc::new(RwLock::new(HashMap::new())),
            registry: EndpointRegistry::new(),
            registered_addresses: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            config,
            logger,
        })
    }

    /// Shares the connection table with a `Dispatcher`. The dispatcher gets read-only access by
    /// construction: it receives the `Arc<RwLock<_>>`, never a reference to `self`.
    pub fn connection_table(&self) -> ConnectionTable {
        self.connections.clone()
    }

    /// Binds the listener on the configured port, on all interfaces.
    pub fn listen_configured_port(&mut self) -> io::Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.listen_port).into();
        self.listen(addr)
    }

    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(&addr)?;
        self.poll
            .register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;
        debug!(self.logger, "listening"; "addr" => %addr);
        self.listener = Some(listener);
        Ok(())
    }

    /// Starts a non-blocking outbound connect. The socket becomes readable/writable once the
    /// kernel finishes the handshake; callers observe that the normal way, via `wants_write`/
    /// `read` returning progress.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let stream = TcpStream::connect(&addr)?;
        let token = self.register_connection(stream, Some(addr))?;
        Ok(token)
    }

    pub fn listener_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no listener bound")),
        }
    }

    pub fn connection(&self, token: Token) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(&token).cloned()
    }

    pub fn lookup_by_address(&self, ipv4: u32) -> Option<Token> {
        self.registry.lookup(ipv4).map(Token)
    }

    fn register_connection(
        &mut self,
        stream: TcpStream,
        remote: Option<SocketAddr>,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        let conn = Arc::new(Connection::new(
            stream,
            token,
            self.config.data_queue_capacity,
            self.config.max_packet_size,
            self.logger.clone(),
        ));
        conn.register(&self.poll)?;

        if let Some(addr) = remote {
            if let std::net::IpAddr::V4(ipv4) = addr.ip() {
                let ipv4 = u32::from(ipv4);
                self.registry.register(ipv4, token.0);
                self.registered_addresses.insert(token, ipv4);
            }
        }

        self.connections.write().unwrap().insert(token, conn);
        Ok(token)
    }

    /// One pass: block for readiness up to the configured thread frequency, service every
    /// ready socket, sweep dead connections, then sleep out the rest of the tick budget.
    pub fn tick(&mut self) -> io::Result<()> {
        let budget = Duration::from_millis(self.config.thread_frequency_ms);
        let tick_start = Instant::now();

        self.events.clear();
        self.poll.poll(&mut self.events, Some(budget))?;

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, readiness) in ready {
            if token == LISTENER_TOKEN {
                self.accept_all()?;
                continue;
            }

            let conn = match self.connections.read().unwrap().get(&token).cloned() {
                Some(conn) => conn,
                None => continue,
            };

            if readiness.is_readable() {
                self.drain_read(&conn);
            }
            if readiness.is_writable() {
                self.drain_write(&conn);
            }
        }

        self.sweep_dead();

        let elapsed = tick_start.elapsed();
        if elapsed < budget {
            thread::sleep(budget - elapsed);
        }

        Ok(())
    }

    fn drain_read(&self, conn: &Connection) {
        loop {
            match conn.read(self.config.socket_read_size) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn drain_write(&self, conn: &Connection) {
        while conn.wants_write() {
            match conn.write(self.config.socket_write_size) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn accept_all(&mut self) -> io::Result<()> {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };

            match accepted {
                Ok((stream, addr)) => {
                    let token = self.register_connection(stream, Some(addr))?;
                    trace!(self.logger, "accepted connection"; "addr" => %addr, "token" => token.0);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn sweep_dead(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .read()
            .unwrap()
            .iter()
            .filter(|(_, conn)| !conn.is_alive())
            .map(|(token, _)| *token)
            .collect();

        if dead.is_empty() {
            return;
        }

        let mut table = self.connections.write().unwrap();
        for token in dead {
            if let Some(conn) = table.remove(&token) {
                let _ = conn.deregister(&self.poll);
                if let Some(ipv4) = self.registered_addresses.remove(&token) {
                    self.registry.remove(ipv4, token.0);
                }
                debug!(self.logger, "removed dead connection"; "token" => token.0);
            }
        }
    }
}

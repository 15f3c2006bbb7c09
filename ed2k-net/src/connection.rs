use crate::buffer::Buffer;
use crate::frame::{Framer, Header, HEADER_SIZE};
use ed2k_support::error::{EngineError, EngineResult, FatalKind};
use ed2k_support::time::timestamp_secs;
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Eq, PartialEq)]
pub enum EnqueueError {
    Closed,
}

/// One TCP peer connection: a socket, its framing state, and the three queues the reactor and
/// dispatcher hand packets through. Half-open semantics mirror a real TCP shutdown -- the read
/// and write sides close independently.
pub struct Connection {
    pub token: Token,
    stream: Mutex<TcpStream>,
    logger: slog::Logger,

    read_open: AtomicBool,
    write_open: AtomicBool,

    read_buffer: Mutex<Buffer>,
    framer: Framer,

    incoming: Mutex<VecDeque<Vec<u8>>>,
    control_out: Mutex<VecDeque<Vec<u8>>>,
    data_out: Mutex<VecDeque<Vec<u8>>>,
    data_out_capacity: usize,

    /// The packet currently being drained to the socket, along with how many of its bytes have
    /// already been written. Queue selection only happens again once this is `None`.
    outstanding: Mutex<Option<(Vec<u8>, usize)>>,

    last_ingress: AtomicU64,
    last_egress: AtomicU64,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        token: Token,
        data_out_capacity: usize,
        max_packet_size: u32,
        logger: slog::Logger,
    ) -> Connection {
        let now = timestamp_secs();
        Connection {
            token,
            stream: Mutex::new(stream),
            logger,
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
            read_buffer: Mutex::new(Buffer::new()),
            framer: Framer::new(max_packet_size),
            incoming: Mutex::new(VecDeque::new()),
            control_out: Mutex::new(VecDeque::new()),
            data_out: Mutex::new(VecDeque::new()),
            data_out_capacity,
            outstanding: Mutex::new(None),
            last_ingress: AtomicU64::new(now),
            last_egress: AtomicU64::new(now),
        }
    }

    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        poll.register(
            &*self.stream.lock().unwrap(),
            self.token,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
    }

    pub fn deregister(&self, poll: &Poll) -> io::Result<()> {
        poll.deregister(&*self.stream.lock().unwrap())
    }

    /// Queues a packet for sending. Control packets preempt data packets at the next packet
    /// boundary (see `next_outbound`); the data queue has a capacity bound, the control queue
    /// does not.
    pub fn enqueue(
        &self,
        protocol: u8,
        opcode: u8,
        payload: Vec<u8>,
        control: bool,
    ) -> Result<(), EnqueueError> {
        if !self.write_open.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        Header {
            protocol,
            size: payload.len() as u32,
            opcode,
        }
        .write(&mut bytes);
        bytes.extend_from_slice(&payload);

        if control {
            self.control_out.lock().unwrap().push_back(bytes);
        } else {
            let mut queue = self.data_out.lock().unwrap();
            if queue.len() >= self.data_out_capacity {
                return Err(EnqueueError::Closed);
            }
            queue.push_back(bytes);
        }

        Ok(())
    }

    /// One non-blocking read of up to `max_bytes`, followed by framing whatever arrived into
    /// the incoming queue. Returns bytes read, or `Fatal` once the read half should be torn
    /// down (EOF, reset, or already closed).
    pub fn read(&self, max_bytes: usize) -> EngineResult<usize> {
        if !self.read_open.load(Ordering::Acquire) {
            return Err(EngineError::Fatal(FatalKind::PeerClosed));
        }

        let mut stream = self.stream.lock().unwrap();
        let mut buffer = self.read_buffer.lock().unwrap();

        let read = match buffer.ingress(&mut *stream, max_bytes) {
            Ok(n) => n,
            Err(e) => {
                let err = EngineError::from(e);
                if err != EngineError::Wait {
                    self.read_open.store(false, Ordering::Release);
                }
                return Err(err);
            }
        };

        self.last_ingress.store(timestamp_secs(), Ordering::Relaxed);

        let mut incoming = self.incoming.lock().unwrap();
        if let Err(e) = self.framer.drain_into(&mut buffer, &mut incoming) {
            self.read_open.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(read)
    }

    /// One non-blocking write of up to `max_bytes`, draining the outstanding partial packet
    /// first, then as many whole packets as fit, control packets before data packets.
    pub fn write(&self, max_bytes: usize) -> EngineResult<usize> {
        if !self.write_open.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut stream = self.stream.lock().unwrap();
        let mut outstanding = self.outstanding.lock().unwrap();
        let mut written = 0usize;

        while written < max_bytes {
            if outstanding.is_none() {
                *outstanding = self.next_outbound();
            }

            let (bytes, offset) = match outstanding.as_mut() {
                Some(pair) => pair,
                None => break,
            };

            let remaining = &bytes[*offset..];
            let want = std::cmp::min(remaining.len(), max_bytes - written);

            match io::Write::write(&mut *stream, &remaining[..want]) {
                Ok(0) => {
                    self.write_open.store(false, Ordering::Release);
                    return Err(EngineError::Fatal(FatalKind::PeerClosed));
                }
                Ok(count) => {
                    *offset += count;
                    written += count;
                    if *offset == bytes.len() {
                        *outstanding = None;
                    }
                }
                Err(e) => {
                    let err = EngineError::from(e);
                    if err != EngineError::Wait {
                        self.write_open.store(false, Ordering::Release);
                    }
                    return if written > 0 { Ok(written) } else { Err(err) };
                }
            }
        }

        if written > 0 {
            self.last_egress.store(timestamp_secs(), Ordering::Relaxed);
        }

        Ok(written)
    }

    /// Picks the next whole packet to start sending: the oldest control packet if any exists,
    /// else the oldest data packet. Queue selection only happens here, at a packet boundary.
    fn next_outbound(&self) -> Option<(Vec<u8>, usize)> {
        if let Some(bytes) = self.control_out.lock().unwrap().pop_front() {
            return Some((bytes, 0));
        }
        self.data_out
            .lock()
            .unwrap()
            .pop_front()
            .map(|bytes| (bytes, 0))
    }

    pub fn close_read(&self, clear_incoming: bool) {
        self.read_open.store(false, Ordering::Release);
        self.read_buffer.lock().unwrap().clear();
        if clear_incoming {
            self.incoming.lock().unwrap().clear();
        }
    }

    pub fn close_write(&self) {
        self.write_open.store(false, Ordering::Release);
        *self.outstanding.lock().unwrap() = None;
        self.control_out.lock().unwrap().clear();
        self.data_out.lock().unwrap().clear();
    }

    /// Pops the next fully-framed raw packet (header + payload) for the dispatcher to process.
    pub fn pop_incoming(&self) -> Option<Vec<u8>> {
        self.incoming.lock().unwrap().pop_front()
    }

    pub fn is_alive(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
            || self.write_open.load(Ordering::Acquire)
            || !self.incoming.lock().unwrap().is_empty()
    }

    pub fn wants_read(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    pub fn wants_write(&self) -> bool {
        if !self.write_open.load(Ordering::Acquire) {
            return false;
        }
        self.outstanding.lock().unwrap().is_some()
            || !self.control_out.lock().unwrap().is_empty()
            || !self.data_out.lock().unwrap().is_empty()
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }
}

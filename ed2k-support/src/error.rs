use std::io;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Eq, PartialEq)]
pub enum EngineError {
    Wait,
    Fatal(FatalKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum FatalKind {
    PeerClosed,
    MalformedPacket,
    PacketTooLarge,
    UnsupportedProtocol,
    UnknownProtocol,
    QueueClosed,
    Io(io::ErrorKind),
}

impl From<io::Error> for EngineError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => EngineError::Wait,
            kind => EngineError::Fatal(FatalKind::Io(kind)),
        }
    }
}

/// Lets call sites collapse `Wait` and `Ok` into "keep going" and treat everything
/// else as "this connection is done".
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for EngineResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(EngineError::Wait) => false,
            _ => true,
        }
    }
}

use indexmap::IndexMap;

pub type ConnectionId = usize;

/// Indexes live connections by remote IPv4 address so an inbound accept can be matched back to
/// an address the hosting application already knows about, and so a reconnect reuses the same
/// identity. Resolving an address to a concrete peer object is the hosting application's job;
/// this registry only keeps the address -> connection mapping consistent with the reactor's
/// connection table.
#[derive(Default)]
pub struct EndpointRegistry {
    by_address: IndexMap<u32, ConnectionId>,
}

impl EndpointRegistry {
    pub fn new() -> EndpointRegistry {
        EndpointRegistry {
            by_address: IndexMap::new(),
        }
    }

    pub fn lookup(&self, ipv4: u32) -> Option<ConnectionId> {
        self.by_address.get(&ipv4).copied()
    }

    /// Associates `ipv4` with `id`, replacing whatever connection previously owned that
    /// address (a stale registration from a dropped connection, typically).
    pub fn register(&mut self, ipv4: u32, id: ConnectionId) {
        self.by_address.insert(ipv4, id);
    }

    /// Removes the mapping, but only if it still points at `id` -- a later connection from the
    /// same address must not be evicted by a late cleanup of an earlier one.
    pub fn remove(&mut self, ipv4: u32, id: ConnectionId) {
        if self.by_address.get(&ipv4) == Some(&id) {
            self.by_address.remove(&ipv4);
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

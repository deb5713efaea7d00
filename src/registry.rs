//! Channel registry: by-edge / by-fd indexes, and the per-node-pair port
//! allocator. Grounded on
//! `original_source/controller/channel_manager.hpp` and the `alloc_port`
//! logic in `channel.cpp`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::channel::LocalChannel;

pub const PORT_START: u16 = 10000;

/// Process-wide, lazily-populated port store. A single mutex guards both
/// maps; allocation is rare (once per unordered node pair), so contention
/// is not a concern.
#[derive(Default)]
pub struct PortAllocator {
    inner: Mutex<PortAllocatorInner>,
}

#[derive(Default)]
struct PortAllocatorInner {
    next_port: HashMap<i32, u16>,
    port_store: HashMap<(i32, i32), u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stable port for the unordered pair `{a, b}`, allocating
    /// one on first use. `next_port` is keyed by the larger endpoint and
    /// starts at `PORT_START`.
    pub fn alloc(&self, a: i32, b: i32) -> u16 {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let mut inner = self.inner.lock().unwrap();
        if let Some(&port) = inner.port_store.get(&(lo, hi)) {
            return port;
        }
        let counter = inner.next_port.entry(hi).or_insert(PORT_START);
        let port = *counter;
        *counter += 1;
        inner.port_store.insert((lo, hi), port);
        port
    }
}

/// Indexes channels by directed edge `(self_id, peer_id)` and by fd/token.
/// `by_fd` is the authoritative owner; `by_edge` only ever stores a token
/// lookup key, matching the original's dense-index/fd-table split.
pub struct ChannelRegistry<S> {
    by_edge: HashMap<(i32, i32), mio::Token>,
    by_fd: HashMap<mio::Token, LocalChannel<S>>,
}

impl<S> Default for ChannelRegistry<S> {
    fn default() -> Self {
        ChannelRegistry { by_edge: HashMap::new(), by_fd: HashMap::new() }
    }
}

impl<S> ChannelRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, token: mio::Token, self_id: i32, peer_id: i32, channel: LocalChannel<S>) {
        self.by_edge.insert((self_id, peer_id), token);
        self.by_fd.insert(token, channel);
    }

    pub fn get(&self, self_id: i32, peer_id: i32) -> Option<&LocalChannel<S>> {
        let token = self.by_edge.get(&(self_id, peer_id))?;
        self.by_fd.get(token)
    }

    pub fn get_mut(&mut self, self_id: i32, peer_id: i32) -> Option<&mut LocalChannel<S>> {
        let token = *self.by_edge.get(&(self_id, peer_id))?;
        self.by_fd.get_mut(&token)
    }

    pub fn get_by_token(&self, token: mio::Token) -> Option<&LocalChannel<S>> {
        self.by_fd.get(&token)
    }

    pub fn get_by_token_mut(&mut self, token: mio::Token) -> Option<&mut LocalChannel<S>> {
        self.by_fd.get_mut(&token)
    }

    pub fn remove(&mut self, token: mio::Token) -> Option<LocalChannel<S>> {
        let ch = self.by_fd.remove(&token)?;
        self.by_edge.remove(&(ch.self_id, ch.peer_id));
        Some(ch)
    }

    pub fn contains_edge(&self, self_id: i32, peer_id: i32) -> bool {
        self.by_edge.contains_key(&(self_id, peer_id))
    }

    pub fn tokens(&self) -> impl Iterator<Item = mio::Token> + '_ {
        self.by_fd.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocation_is_symmetric_and_memoized() {
        let alloc = PortAllocator::new();
        let p1 = alloc.alloc(5, 3);
        let p1_again = alloc.alloc(3, 5);
        assert_eq!(p1, p1_again);
        assert_eq!(p1, PORT_START);
    }

    #[test]
    fn distinct_pairs_with_same_larger_endpoint_get_ascending_ports() {
        let alloc = PortAllocator::new();
        let p1 = alloc.alloc(3, 10);
        let p2 = alloc.alloc(7, 10);
        assert_eq!(p2, p1 + 1);
    }

    #[test]
    fn unrelated_larger_endpoints_start_fresh_at_port_start() {
        let alloc = PortAllocator::new();
        alloc.alloc(1, 2);
        let p = alloc.alloc(10, 20);
        assert_eq!(p, PORT_START);
    }
}

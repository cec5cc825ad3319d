//! Live-stream registry and the lingering list.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use h3_machine::StreamId;

/// Recently reset stream handles are remembered so that late data and
/// messages can be dropped without a spurious warning.
const LINGERING_MAX: usize = 100;

/// Receive-side parsing state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Peer-opened unidirectional stream awaiting its type varint.
    Header,
    /// Parsing frames.
    Normal,
    /// Inside a DATA frame body with this many bytes left.
    Data { remaining: u64 },
    /// Receive side aborted; bytes are dropped.
    Discard,
}

#[derive(Debug)]
pub(crate) struct Stream<S> {
    pub id: StreamId,
    pub status: Status,
    /// At most one incomplete frame of unparsed bytes.
    pub buffer: Bytes,
    /// Handler state, present once `init` has run.
    pub state: Option<S>,
}

pub(crate) struct Registry<R, S> {
    streams: HashMap<R, Stream<S>>,
    refs: HashMap<StreamId, R>,
    lingering: VecDeque<(R, StreamId)>,
    next_id: u64,
}

impl<R, S> Default for Registry<R, S> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            refs: HashMap::new(),
            lingering: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<R, S> Registry<R, S>
where
    R: Clone + Eq + std::hash::Hash,
{
    /// Registers a stream and assigns it a connection-scoped id.
    pub fn insert(&mut self, r: R, status: Status) -> StreamId {
        let id = StreamId::new(self.next_id);
        self.next_id += 1;
        self.refs.insert(id, r.clone());
        self.streams.insert(
            r,
            Stream {
                id,
                status,
                buffer: Bytes::new(),
                state: None,
            },
        );
        id
    }

    pub fn get_mut(&mut self, r: &R) -> Option<&mut Stream<S>> {
        self.streams.get_mut(r)
    }

    pub fn contains(&self, r: &R) -> bool {
        self.streams.contains_key(r)
    }

    pub fn ref_of(&self, id: StreamId) -> Option<&R> {
        self.refs.get(&id)
    }

    pub fn remove(&mut self, r: &R) -> Option<Stream<S>> {
        let stream = self.streams.remove(r)?;
        self.refs.remove(&stream.id);
        Some(stream)
    }

    /// Drains every live stream, for connection termination.
    pub fn drain(&mut self) -> Vec<(R, Stream<S>)> {
        self.refs.clear();
        self.streams.drain().collect()
    }

    /// Remembers a dead stream, most recent first, bounded.
    pub fn linger(&mut self, r: R, id: StreamId) {
        self.lingering.push_front((r, id));
        self.lingering.truncate(LINGERING_MAX);
    }

    pub fn is_lingering(&self, r: &R) -> bool {
        self.lingering.iter().any(|(lr, _)| lr == r)
    }

    pub fn is_lingering_id(&self, id: StreamId) -> bool {
        self.lingering.iter().any(|(_, lid)| *lid == id)
    }

    #[cfg(test)]
    pub fn lingering_len(&self) -> usize {
        self.lingering.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_increasing_ids() {
        let mut registry: Registry<u64, ()> = Registry::default();
        let a = registry.insert(10, Status::Normal);
        let b = registry.insert(11, Status::Header);
        assert!(a < b);
        assert_eq!(registry.ref_of(a), Some(&10));
        assert_eq!(registry.ref_of(b), Some(&11));
    }

    #[test]
    fn remove_clears_both_maps() {
        let mut registry: Registry<u64, ()> = Registry::default();
        let id = registry.insert(10, Status::Normal);
        let stream = registry.remove(&10).unwrap();
        assert_eq!(stream.id, id);
        assert!(!registry.contains(&10));
        assert_eq!(registry.ref_of(id), None);
    }

    #[test]
    fn lingering_is_bounded() {
        let mut registry: Registry<u64, ()> = Registry::default();
        for n in 0..150u64 {
            let id = registry.insert(n, Status::Normal);
            registry.remove(&n);
            registry.linger(n, id);
        }
        assert_eq!(registry.lingering_len(), 100);
        // most recent kept, oldest evicted
        assert!(registry.is_lingering(&149));
        assert!(!registry.is_lingering(&0));
        assert!(registry.is_lingering_id(StreamId::new(149)));
        assert!(!registry.is_lingering_id(StreamId::new(49)));
    }
}

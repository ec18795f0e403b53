use std::fmt;

use crate::fdwait::FdRequest;


/// A stable handle for a connection managed by a [`Scheduler`](crate::Scheduler).
///
/// The handle encodes a slot index and a generation. Slots are reused once a
/// connection is torn down, but the generation changes with every reuse, so
/// a stale [`ConnId`] never refers to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    #[inline]
    #[must_use]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index of this connection. Useful for indexing into
    /// per-connection arrays kept by the I/O layer.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Returns the generation of the slot this connection occupies.
    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}


/// The scheduler-visible state of a connection.
///
/// Transitions follow `Runnable -> Running -> {Runnable | Parked | Terminal}`,
/// `Parked -> Runnable` on admission and `Parked -> Terminal` on disconnect.
/// [`ConnState::Terminal`] is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnState {
    /// Waiting in the Ready Queue (or the batch being drained) for a turn.
    Runnable,
    /// A stage handler is currently executing for this connection.
    Running,
    /// Parked in the FD-Wait Queue.
    Parked,
    /// Torn down. The connection is never scheduled again.
    Terminal,
}

impl fmt::Display for ConnState {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.into())
    }
}


bitflags::bitflags! {
    /// Queue membership markers of a connection.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Queued: u8 {
        /// Present in the Ready Queue or in the batch currently being drained.
        const READY = 1;
        /// Present in the FD-Wait Queue.
        const PARKED = 1 << 1;
    }
}


/// The scheduler's record of a single connection.
#[derive(Debug)]
pub struct Record<C> {
    /// The connection state owned by the I/O layer and the pipeline.
    pub data: C,
    pub(crate) state: ConnState,
    pub(crate) queued: Queued,
    /// Index of the pipeline stage to run next.
    pub(crate) stage: usize,
    /// Set when a descriptor slot was reserved for this connection on
    /// admission from the FD-Wait Queue.
    pub(crate) reservation: bool,
    /// The request that was satisfied by the most recent admission.
    pub(crate) admitted: Option<FdRequest>,
}

impl<C> Record<C> {
    #[must_use]
    fn new(data: C) -> Self {
        Self {
            data,
            state: ConnState::Runnable,
            queued: Queued::empty(),
            stage: 0,
            reservation: false,
            admitted: None,
        }
    }

    /// Returns the scheduler-visible state of this connection.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Returns the queue membership markers of this connection.
    #[inline]
    #[must_use]
    pub fn queued(&self) -> Queued {
        self.queued
    }

    /// Returns the index of the pipeline stage this connection runs next.
    #[inline]
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }
}


#[derive(Debug)]
struct Slot<C> {
    generation: u32,
    record: Option<Record<C>>,
}

/// A generational slab of connection records.
#[derive(Debug)]
pub struct ConnTable<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
    len: usize,
}

impl<C> Default for ConnTable<C> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConnTable<C> {
    /// Creates an empty [`ConnTable`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), len: 0 }
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Tests whether the table holds no live connections.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a new connection in a free slot and returns its handle.
    /// The connection starts out as [`ConnState::Runnable`].
    ///
    /// # Panics
    /// Panics if more than [`u32::MAX`] slots would be required.
    pub fn insert(&mut self, data: C) -> ConnId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.record.is_none());
            slot.record = Some(Record::new(data));
            return ConnId::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).expect("connection slots should fit into u32");
        self.slots.push(Slot { generation: 0, record: Some(Record::new(data)) });
        ConnId::new(index, 0)
    }

    /// Returns the record for `id`, unless the connection is gone.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&Record<C>> {
        self.slots.get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.record.as_ref())
    }

    /// Returns the mutable record for `id`, unless the connection is gone.
    #[must_use]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Record<C>> {
        self.slots.get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.record.as_mut())
    }

    /// Removes the connection and frees its slot for reuse.
    ///
    /// The returned record is marked [`ConnState::Terminal`].
    pub fn remove(&mut self, id: ConnId) -> Option<Record<C>> {
        let slot = self.slots.get_mut(id.index())
            .filter(|s| s.generation == id.generation)?;
        let mut record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        record.state = ConnState::Terminal;
        Some(record)
    }

    /// Returns an iterator over all live connections.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Record<C>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            // Slot indices always fit into u32, see ConnTable::insert
            #[allow(clippy::cast_possible_truncation)]
            let id = ConnId::new(i as u32, s.generation);
            s.record.as_ref().map(|r| (id, r))
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_reuse() {
        let mut table = ConnTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(table.len(), 2);
        assert_ne!(a, b);

        let rec = table.remove(a).expect("a should be live");
        assert_eq!(rec.data, "a");
        assert_eq!(rec.state(), ConnState::Terminal);
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());

        // The slot of a is reused, but under a new generation
        let c = table.insert("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(c).map(|r| r.data), Some("c"));
        assert_eq!(table.get(b).map(|r| r.data), Some("b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn fresh_record() {
        let mut table = ConnTable::new();
        let id = table.insert(());
        let rec = table.get(id).expect("connection should be live");
        assert_eq!(rec.state(), ConnState::Runnable);
        assert_eq!(rec.queued(), Queued::empty());
        assert_eq!(rec.stage(), 0);
        assert!(!rec.reservation);
        assert!(rec.admitted.is_none());
    }

    #[test]
    fn iter_live() {
        let mut table = ConnTable::new();
        let ids: Vec<_> = (0..5).map(|i| table.insert(i)).collect();
        table.remove(ids[1]);
        table.remove(ids[3]);

        let live: Vec<_> = table.iter().map(|(id, r)| (id, r.data)).collect();
        assert_eq!(live, [(ids[0], 0), (ids[2], 2), (ids[4], 4)]);
    }

    #[test]
    fn display() {
        assert_eq!(ConnId::new(7, 3).to_string(), "#7.3");
        assert_eq!(ConnState::Parked.to_string(), "parked");
    }
}

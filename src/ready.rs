use std::collections::VecDeque;

use crate::conn::{ConnId, Queued};
use crate::macros::trace;


/// A batch of connections taken from the [`ReadyQueue`] in FIFO order.
pub type Batch = VecDeque<ConnId>;


/// The FIFO set of connections due for another pipeline step.
///
/// Membership is tracked by the [`Queued::READY`] marker on each connection
/// rather than by the queue itself, which keeps enqueueing O(1). The queue
/// never clears the marker when it hands out entries via
/// `ReadyQueue::drain`: the owner of the [`Batch`] clears it once the entry
/// is actually taken for processing.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: VecDeque<ConnId>,
}

impl ReadyQueue {
    /// Creates an empty [`ReadyQueue`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Tests whether the queue is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Tests whether `id` is currently queued. This is O(n).
    #[must_use]
    pub fn contains(&self, id: ConnId) -> bool {
        self.queue.contains(&id)
    }

    /// Appends `id` to the tail of the queue unless its `queued` markers say
    /// it is already present.
    ///
    /// Returns whether the connection was appended. Enqueueing a connection
    /// twice is not an error, so handlers may call this defensively.
    pub fn enqueue(&mut self, id: ConnId, queued: &mut Queued) -> bool {
        if queued.contains(Queued::READY) {
            trace!(conn = %id, "already queued");
            return false;
        }
        queued.insert(Queued::READY);
        self.queue.push_back(id);
        true
    }

    /// Takes all queued connections in FIFO order and leaves the queue empty.
    ///
    /// Connections enqueued while the returned [`Batch`] is processed end up
    /// in the next call to `ReadyQueue::drain`.
    #[inline]
    #[must_use = "drained connections must be processed or re-queued"]
    pub fn drain(&mut self) -> Batch {
        std::mem::take(&mut self.queue)
    }

    /// Removes `id` from wherever it sits in the queue. This is O(n).
    ///
    /// Returns whether the connection was present. Its [`Queued::READY`]
    /// marker is cleared either way.
    pub fn remove(&mut self, id: ConnId, queued: &mut Queued) -> bool {
        queued.remove(Queued::READY);
        let Some(pos) = self.queue.iter().position(|&q| q == id) else {
            return false;
        };
        self.queue.remove(pos);
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ids, FlagMap};

    #[test]
    fn drain_in_order() {
        let [a, b, c] = ids();
        let mut flags = FlagMap::default();
        let mut rq = ReadyQueue::new();
        for id in [a, b, c] {
            assert!(rq.enqueue(id, flags.get(id)));
        }
        assert_eq!(rq.len(), 3);

        let batch = rq.drain();
        assert_eq!(batch, [a, b, c]);
        assert!(rq.is_empty());

        // Re-queueing a during processing of b only shows up in the next drain
        for id in batch {
            flags.get(id).remove(Queued::READY);
            if id == b {
                assert!(rq.enqueue(a, flags.get(a)));
            }
        }
        assert_eq!(rq.drain(), [a]);
    }

    #[test]
    fn no_duplicates() {
        let [a, b, _] = ids();
        let mut flags = FlagMap::default();
        let mut rq = ReadyQueue::new();
        assert!(rq.enqueue(a, flags.get(a)));
        assert!(rq.enqueue(b, flags.get(b)));
        assert!(!rq.enqueue(a, flags.get(a)));
        assert!(!rq.enqueue(b, flags.get(b)));
        assert_eq!(rq.drain(), [a, b]);

        // Marker is still set until the batch owner clears it
        assert!(!rq.enqueue(a, flags.get(a)));
        assert!(rq.is_empty());
    }

    #[test]
    fn remove_anywhere() {
        let [a, b, c] = ids();
        let mut flags = FlagMap::default();
        let mut rq = ReadyQueue::new();
        for id in [a, b, c] {
            rq.enqueue(id, flags.get(id));
        }

        assert!(rq.remove(b, flags.get(b)));
        assert!(!flags.get(b).contains(Queued::READY));
        assert!(!rq.contains(b));
        assert!(!rq.remove(b, flags.get(b)));
        assert_eq!(rq.drain(), [a, c]);
    }

    #[test]
    fn random_fifo() {
        let pool: Vec<_> = (0..32).map(|i| ConnId::new(i, 0)).collect();
        let mut flags = FlagMap::default();
        let mut rq = ReadyQueue::new();

        for _ in 0..64 {
            let mut expected = Vec::new();
            for _ in 0..fastrand::usize(0..128) {
                let id = pool[fastrand::usize(..pool.len())];
                if rq.enqueue(id, flags.get(id)) {
                    expected.push(id);
                }
            }

            let batch = rq.drain();
            // First-enqueue order is preserved and every connection shows up once
            assert_eq!(batch, expected);
            let mut dedup = batch.clone().into_iter().collect::<Vec<_>>();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), batch.len());

            for id in batch {
                flags.get(id).remove(Queued::READY);
            }
        }
    }
}

//! Per-frame retirement buckets.
//!
//! A resource freed while frame `i` is being recorded may still be referenced by
//! that frame's command buffer. It is parked in bucket `i` and only destroyed the
//! next time frame index `i` begins, once the in-flight fence for that slot has
//! been waited on.

/// Resources waiting for the frame slot that last used them to complete.
pub struct RetirementBuckets<T> {
    buckets: Vec<Vec<T>>,
}

impl<T> RetirementBuckets<T> {
    /// Create one bucket per frame in flight.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            buckets: (0..frames_in_flight.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    /// Number of buckets (frames in flight).
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Always false; there is at least one bucket.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Park a resource in the bucket of the frame that is being recorded.
    pub fn retire(&mut self, frame_index: usize, item: T) {
        let slot = frame_index % self.buckets.len();
        self.buckets[slot].push(item);
    }

    /// Take every resource parked for `frame_index`.
    ///
    /// Call only after the fence of that frame slot has signaled.
    pub fn drain(&mut self, frame_index: usize) -> std::vec::Drain<'_, T> {
        let slot = frame_index % self.buckets.len();
        self.buckets[slot].drain(..)
    }

    /// Take everything from every bucket. Only valid after a device wait-idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.buckets.iter_mut().flat_map(|b| b.drain(..)).collect()
    }

    /// Whether the bucket for `frame_index` holds nothing.
    pub fn bucket_is_empty(&self, frame_index: usize) -> bool {
        self.buckets[frame_index % self.buckets.len()].is_empty()
    }

    /// Total number of parked resources.
    pub fn pending_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_survive_until_their_slot_comes_around() {
        let mut buckets = RetirementBuckets::new(2);
        buckets.retire(0, "a");
        buckets.retire(1, "b");

        assert_eq!(buckets.pending_count(), 2);
        assert!(!buckets.bucket_is_empty(0));

        let drained: Vec<_> = buckets.drain(1).collect();
        assert_eq!(drained, vec!["b"]);
        assert!(!buckets.bucket_is_empty(0));

        let drained: Vec<_> = buckets.drain(0).collect();
        assert_eq!(drained, vec!["a"]);
        assert_eq!(buckets.pending_count(), 0);
    }

    #[test]
    fn frame_indices_wrap() {
        let mut buckets = RetirementBuckets::new(2);
        buckets.retire(3, 7);
        assert!(!buckets.bucket_is_empty(1));
        assert_eq!(buckets.drain(5).collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn drain_all_empties_everything() {
        let mut buckets = RetirementBuckets::new(2);
        buckets.retire(0, 1);
        buckets.retire(1, 2);
        let mut all = buckets.drain_all();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(buckets.pending_count(), 0);
    }
}

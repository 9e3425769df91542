use crate::{
    DistinctId, Error, Result, TimeSource, allocator::SequenceAllocator, store::CounterStore,
};
use core::ops::Range;
use std::collections::HashMap;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Serves ids from ranges claimed ahead of time, one store round trip per
/// `size` ids per shard.
///
/// A buffer is owned by a single generator and needs `&mut` access; it never
/// shares its ranges. Each id is stamped with the clock reading at the time
/// it is served rather than when its range was claimed.
///
/// Dropping a buffer abandons the unused part of its ranges. The store's
/// counters have already moved past them, so nobody else will issue those
/// values.
///
/// # Across processes
///
/// Two processes stamping raw values `k * 2^sequence_bits` apart in the same
/// millisecond produce the same id: each only knows its own stamps. Ids for a
/// shard stay distinct across processes while the raw values stamped in any
/// one millisecond span fewer than `2^sequence_bits` counter values. A
/// buffer keeps serving an old range while other processes claim new ones,
/// so with buffering that means: between refilling a range and serving its
/// last value, the shard's counter must advance by less than
/// `2^sequence_bits - size`. Workers draining their buffers at very different
/// rates break this first. Keep `size * workers` per shard well below
/// `2^sequence_bits`, or give each process its own shards.
#[derive(Debug)]
pub struct LocalBuffer {
    size: u64,
    /// Unused raw values of the current claim, per shard.
    shards: HashMap<u64, Range<u64>>,
}

impl LocalBuffer {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `size` is zero.
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::validation("buffer_size", "must be positive"));
        }
        Ok(Self {
            size,
            shards: HashMap::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Raw values left in the current range for `shard`.
    pub fn remaining(&self, shard: u64) -> u64 {
        self.shards
            .get(&shard)
            .map_or(0, |range| range.end - range.start)
    }

    /// Returns the next id for `shard`, claiming a new range of `size` values
    /// first if the current one is used up.
    ///
    /// Cancel safe: if the future is dropped before it completes, no range is
    /// installed and no buffered value is consumed.
    ///
    /// # Errors
    ///
    /// Propagates allocation and stamping errors. A failed call leaves the
    /// buffer as it was.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, allocator)))]
    pub async fn next<S, C>(
        &mut self,
        allocator: &SequenceAllocator<S, C>,
        shard: u64,
    ) -> Result<DistinctId>
    where
        S: CounterStore,
        C: TimeSource,
    {
        let range = self.shards.entry(shard).or_default();
        if range.is_empty() {
            let allocation = allocator.allocate(shard, self.size).await?;
            #[cfg(feature = "tracing")]
            tracing::debug!(shard, start = allocation.start, len = allocation.len, "buffer refilled");
            *range = allocation.raw_values();
        }

        let issued = allocator.issue(shard, range.start).await?;
        range.start += 1;
        Ok(issued.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RetryPolicy, StoreClient};
    use crate::time::ManualClock;
    use crate::{Layout, StoreError};
    use core::time::Duration;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn allocator<S: CounterStore>(store: S) -> SequenceAllocator<S, Arc<ManualClock>> {
        SequenceAllocator::new(
            StoreClient::new(store, RetryPolicy::no_retry()),
            Arc::new(ManualClock::at(1_000)),
            Layout::TWITTER,
        )
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            LocalBuffer::new(0),
            Err(Error::Validation { field: "buffer_size", .. })
        ));
    }

    #[tokio::test]
    async fn exhausting_the_range_costs_exactly_one_more_round_trip() {
        let alloc = allocator(MemoryStore::new());
        let mut buffer = LocalBuffer::new(100).unwrap();

        for _ in 0..100 {
            buffer.next(&alloc, 1).await.unwrap();
        }
        assert_eq!(alloc.client().stats().round_trips, 1);
        assert_eq!(buffer.remaining(1), 0);

        buffer.next(&alloc, 1).await.unwrap();
        assert_eq!(alloc.client().stats().round_trips, 2);
        assert_eq!(buffer.remaining(1), 99);
        assert_eq!(alloc.client().store().get("shard:1:seq"), Some(200));
    }

    #[tokio::test]
    async fn ids_from_one_buffer_strictly_increase() {
        let alloc = allocator(MemoryStore::new());
        // Start just below a sequence boundary so the range wraps.
        alloc.client().store().set("shard:4:seq", 4090);
        let mut buffer = LocalBuffer::new(64).unwrap();

        let layout = alloc.layout();
        let mut prev: Option<DistinctId> = None;
        for _ in 0..500 {
            let id = buffer.next(&alloc, 4).await.unwrap();
            assert_eq!(layout.decode(id).shard, 4);
            if let Some(prev) = prev {
                assert!(id > prev, "{id} <= {prev}");
            }
            prev = Some(id);
        }
    }

    #[tokio::test]
    async fn shards_use_separate_ranges() {
        let alloc = allocator(MemoryStore::new());
        let mut buffer = LocalBuffer::new(10).unwrap();
        buffer.next(&alloc, 1).await.unwrap();
        buffer.next(&alloc, 2).await.unwrap();
        assert_eq!(buffer.remaining(1), 9);
        assert_eq!(buffer.remaining(2), 9);
        assert_eq!(alloc.client().stats().round_trips, 2);
    }

    #[tokio::test]
    async fn failed_refill_installs_nothing() {
        let store = crate::store::testing::FlakyStore::default();
        store.fail_next(1);
        let alloc = allocator(store);
        let mut buffer = LocalBuffer::new(10).unwrap();

        assert!(matches!(
            buffer.next(&alloc, 1).await,
            Err(Error::CoordinationUnavailable {
                source: StoreError::ConnectionClosed,
                ..
            })
        ));
        assert_eq!(buffer.remaining(1), 0);

        buffer.next(&alloc, 1).await.unwrap();
        assert_eq!(buffer.remaining(1), 9);
    }

    /// One generator process: its own allocator on the shared store and clock.
    fn process(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
    ) -> SequenceAllocator<Arc<MemoryStore>, Arc<ManualClock>> {
        SequenceAllocator::new(
            StoreClient::new(Arc::clone(store), RetryPolicy::no_retry()),
            Arc::clone(clock),
            Layout::TWITTER,
        )
    }

    #[tokio::test]
    async fn processes_draining_at_the_same_rate_never_collide() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(1_000));
        let (a, b) = (process(&store, &clock), process(&store, &clock));
        // 2 workers x 1000 stays below 4096 sequences per tick.
        let mut buffer_a = LocalBuffer::new(1_000).unwrap();
        let mut buffer_b = LocalBuffer::new(1_000).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..5_000 {
            assert!(seen.insert(buffer_a.next(&a, 3).await.unwrap()));
            assert!(seen.insert(buffer_b.next(&b, 3).await.unwrap()));
            clock.advance(1);
        }
        assert_eq!(store.get("shard:3:seq"), Some(10_000));
    }

    #[tokio::test]
    async fn stale_range_in_another_process_repeats_an_id() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(1_000));
        let (a, b) = (process(&store, &clock), process(&store, &clock));
        let mut buffer_a = LocalBuffer::new(100).unwrap();
        let mut buffer_b = LocalBuffer::new(100).unwrap();

        // A claims 1..=100 and serves raw 1, then idles while B serves
        // 101..=4097: the counter moves a full 4096 past A's live range.
        buffer_a.next(&a, 3).await.unwrap();
        for _ in 101..=4097 {
            buffer_b.next(&b, 3).await.unwrap();
        }

        // Raw 2 and raw 4098 share sequence 2 and now share a millisecond.
        clock.advance(10);
        let from_a = buffer_a.next(&a, 3).await.unwrap();
        let from_b = buffer_b.next(&b, 3).await.unwrap();
        assert_eq!(from_a, from_b);
        assert_eq!(
            a.layout().decode(from_a),
            crate::Parts {
                timestamp: 1_010,
                shard: 3,
                sequence: 2
            }
        );
    }

    /// A store whose increments wait for a permit.
    #[derive(Debug)]
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
    }

    impl CounterStore for GatedStore {
        async fn incr_by(&self, key: &str, by: u64) -> core::result::Result<u64, StoreError> {
            let _permit = self.gate.acquire().await.map_err(|_| StoreError::PoolClosed)?;
            self.inner.incr_by(key, by).await
        }

        async fn ping(&self) -> core::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancelled_refill_consumes_nothing() {
        let alloc = allocator(GatedStore {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        });
        let mut buffer = LocalBuffer::new(10).unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), buffer.next(&alloc, 1)).await;
        assert!(cancelled.is_err());
        assert_eq!(buffer.remaining(1), 0);
        assert_eq!(alloc.client().store().inner.get("shard:1:seq"), None);

        alloc.client().store().gate.add_permits(1);
        let id = buffer.next(&alloc, 1).await.unwrap();
        assert_eq!(alloc.layout().decode(id).sequence, 1);
        assert_eq!(buffer.remaining(1), 9);
    }
}

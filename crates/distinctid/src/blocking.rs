use crate::{
    DistinctId, Error, Generator, GeneratorConfig, Layout, MonotonicClock, Result, StoreError,
    TimeSource,
    store::{
        CounterStore, StoreStats,
        redis::{RedisStore, StoreConfig},
    },
};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// The synchronous generation API.
///
/// Wraps a [`Generator`] and drives it on a private tokio runtime with a
/// single I/O worker. Clones share the runtime, the allocator and the
/// connection pool, and start with an empty buffer, so the usual pattern is
/// one clone per worker thread.
///
/// Must not be called from inside an async context; use [`Generator`]
/// there. Dropping the last clone inside an async context panics.
///
/// ```no_run
/// use distinctid::{BlockingGenerator, GeneratorConfig, StoreConfig};
///
/// let mut generator = BlockingGenerator::connect(
///     StoreConfig::standalone("localhost", 6379).with_db(2),
///     GeneratorConfig::default(),
/// )?;
/// let id = generator.distinct(1)?;
/// println!("{id}");
/// # Ok::<(), distinctid::Error>(())
/// ```
#[derive(Debug)]
pub struct BlockingGenerator<S, C = MonotonicClock> {
    inner: Generator<S, C>,
    runtime: Arc<Runtime>,
}

impl BlockingGenerator<RedisStore> {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn connect(store: StoreConfig, config: GeneratorConfig) -> Result<Self> {
        Self::from_async(Generator::connect(store, config)?)
    }
}

impl<S: CounterStore> BlockingGenerator<S> {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn new(store: S, config: GeneratorConfig) -> Result<Self> {
        Self::from_async(Generator::new(store, config)?)
    }
}

impl<S, C> BlockingGenerator<S, C>
where
    S: CounterStore,
    C: TimeSource,
{
    /// Wraps an existing generator, starting the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinationUnavailable`] if the runtime's I/O driver
    /// cannot be started.
    pub fn from_async(inner: Generator<S, C>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("distinctid-io")
            .enable_all()
            .build()
            .map_err(|err| Error::CoordinationUnavailable {
                attempts: 0,
                source: StoreError::Io(err),
            })?;
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }

    /// The wrapped generator.
    pub fn get_ref(&self) -> &Generator<S, C> {
        &self.inner
    }

    pub fn layout(&self) -> Layout {
        self.inner.layout()
    }

    pub fn buffer_size(&self) -> Option<u64> {
        self.inner.buffer_size()
    }

    /// See [`Generator::enable_buffering`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `buffer_size` is not positive.
    pub fn enable_buffering(&mut self, buffer_size: i64) -> Result<()> {
        self.inner.enable_buffering(buffer_size)
    }

    pub fn disable_buffering(&mut self) {
        self.inner.disable_buffering();
    }

    /// Generates one id for `shard_id`, blocking the calling thread.
    ///
    /// # Errors
    ///
    /// See [`Generator::distinct_async`].
    pub fn distinct(&mut self, shard_id: i64) -> Result<DistinctId> {
        self.runtime.block_on(self.inner.distinct_async(shard_id))
    }

    /// Generates `count` ids for `shard_id`, blocking the calling thread.
    ///
    /// # Errors
    ///
    /// See [`Generator::distinct_batch_async`].
    pub fn distinct_batch(&mut self, count: i64, shard_id: i64) -> Result<Vec<DistinctId>> {
        self.runtime
            .block_on(self.inner.distinct_batch_async(count, shard_id))
    }

    pub fn health_check(&self) -> bool {
        self.runtime.block_on(self.inner.health_check())
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}

impl<S, C> Clone for BlockingGenerator<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            runtime: Arc::clone(&self.runtime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, testing::FlakyStore};
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn sync_calls_mirror_the_async_api() {
        let mut generator =
            BlockingGenerator::new(MemoryStore::new(), GeneratorConfig::default()).unwrap();

        let single = generator.distinct(1).unwrap();
        let batch = generator.distinct_batch(1000, 1).unwrap();
        assert_eq!(batch.len(), 1000);
        assert!(!batch.contains(&single));
        assert!(generator.health_check());
        assert_eq!(generator.stats().round_trips, 2);
    }

    #[test]
    fn validation_matches_the_async_api() {
        let mut generator =
            BlockingGenerator::new(FlakyStore::default(), GeneratorConfig::default()).unwrap();
        assert!(matches!(
            generator.distinct(-1),
            Err(Error::Validation { field: "shard_id", .. })
        ));
        assert!(matches!(
            generator.distinct_batch(0, 1),
            Err(Error::Validation { field: "count", .. })
        ));
        assert_eq!(generator.stats().round_trips, 0);
    }

    #[test]
    fn worker_threads_with_clones_never_collide() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let mut base =
            BlockingGenerator::new(Arc::new(MemoryStore::new()), GeneratorConfig::default())
                .unwrap();
        base.enable_buffering(100).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mut generator = base.clone();
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| generator.distinct(3))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(base.stats().round_trips, (THREADS * PER_THREAD / 100) as u64);
    }

    #[test]
    fn buffering_can_be_toggled() {
        let mut generator =
            BlockingGenerator::new(MemoryStore::new(), GeneratorConfig::default()).unwrap();
        generator.enable_buffering(50).unwrap();
        assert_eq!(generator.buffer_size(), Some(50));
        generator.distinct(0).unwrap();
        generator.disable_buffering();
        assert_eq!(generator.buffer_size(), None);
        generator.distinct(0).unwrap();
        let store = generator.get_ref().allocator().client().store();
        assert_eq!(store.get("shard:0:seq"), Some(51));
    }
}

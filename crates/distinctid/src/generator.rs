use crate::{
    DistinctId, Error, Layout, MonotonicClock, Result, TimeSource,
    allocator::SequenceAllocator,
    batch::{self, DEFAULT_MAX_BATCH_SIZE},
    buffer::LocalBuffer,
    store::{
        CounterStore, RetryPolicy, StoreClient, StoreStats,
        redis::{RedisStore, StoreConfig},
    },
};
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Generation settings. Built once and handed to a [`Generator`];
/// changing them means building a new generator.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub layout: Layout,
    /// Counter keys are `<key_prefix>:<shard>:seq`.
    pub key_prefix: String,
    /// Values claimed per round trip when buffering; zero disables
    /// buffering.
    pub buffer_size: u64,
    pub max_batch_size: u64,
    /// Clock regressions up to this long are waited out; longer ones fail
    /// with [`Error::ClockSkew`].
    pub max_clock_wait: Duration,
    pub retry: RetryPolicy,
    /// Emit a `tracing` event with the elapsed time of every call.
    pub log_timings: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            key_prefix: "shard".to_owned(),
            buffer_size: 0,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_clock_wait: Duration::from_millis(10),
            retry: RetryPolicy::default(),
            log_timings: false,
        }
    }
}

impl GeneratorConfig {
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_buffer_size(mut self, size: u64) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_max_batch_size(mut self, size: u64) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_clock_wait(mut self, wait: Duration) -> Self {
        self.max_clock_wait = wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_timings(mut self, enabled: bool) -> Self {
        self.log_timings = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(Error::validation("key_prefix", "must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::validation("max_batch_size", "must be positive"));
        }
        Ok(())
    }
}

/// The asynchronous generation API.
///
/// A generator owns its [`LocalBuffer`] (when buffering is enabled) and
/// shares its allocator, store client and connection pool with its clones.
/// Hand each task or worker its own clone: a clone starts with an empty
/// buffer of the same size.
///
/// ```no_run
/// use distinctid::{Generator, GeneratorConfig, StoreConfig};
///
/// # async fn run() -> distinctid::Result<()> {
/// let mut generator = Generator::connect(
///     StoreConfig::standalone("localhost", 6379),
///     GeneratorConfig::default(),
/// )?;
/// generator.enable_buffering(1000)?;
/// let id = generator.distinct_async(1).await?;
/// let batch = generator.distinct_batch_async(100, 1).await?;
/// assert!(batch.iter().all(|next| *next != id));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Generator<S, C = MonotonicClock> {
    allocator: Arc<SequenceAllocator<S, C>>,
    buffer: Option<LocalBuffer>,
    max_batch_size: u64,
    log_timings: bool,
}

impl Generator<RedisStore> {
    /// A generator backed by Redis. No connection is opened until the first
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn connect(store: StoreConfig, config: GeneratorConfig) -> Result<Self> {
        Self::new(RedisStore::new(store)?, config)
    }
}

impl<S: CounterStore> Generator<S> {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn new(store: S, config: GeneratorConfig) -> Result<Self> {
        Self::with_clock(store, MonotonicClock::default(), config)
    }
}

impl<S, C> Generator<S, C>
where
    S: CounterStore,
    C: TimeSource,
{
    /// A generator reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn with_clock(store: S, clock: C, config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let buffer = match config.buffer_size {
            0 => None,
            size => Some(LocalBuffer::new(size)?),
        };
        let allocator = SequenceAllocator::new(
            StoreClient::new(store, config.retry),
            clock,
            config.layout,
        )
        .with_key_prefix(config.key_prefix)
        .with_max_clock_wait(config.max_clock_wait);

        Ok(Self {
            allocator: Arc::new(allocator),
            buffer,
            max_batch_size: config.max_batch_size,
            log_timings: config.log_timings,
        })
    }

    pub fn layout(&self) -> Layout {
        self.allocator.layout()
    }

    pub fn allocator(&self) -> &SequenceAllocator<S, C> {
        &self.allocator
    }

    /// The buffer size, or `None` when buffering is off.
    pub fn buffer_size(&self) -> Option<u64> {
        self.buffer.as_ref().map(LocalBuffer::size)
    }

    /// Serves single ids from locally claimed ranges of `buffer_size` values.
    ///
    /// Replaces any current buffer; its unused values are abandoned.
    ///
    /// Other processes on the same shard only stay clear of these ids while
    /// the shard's counter advances by less than
    /// `2^sequence_bits - buffer_size` between a refill and the last value
    /// served from it. See [`LocalBuffer`] for the details.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `buffer_size` is not positive.
    pub fn enable_buffering(&mut self, buffer_size: i64) -> Result<()> {
        let size = u64::try_from(buffer_size)
            .map_err(|_| Error::validation("buffer_size", "must be positive"))?;
        self.buffer = Some(LocalBuffer::new(size)?);
        Ok(())
    }

    /// Goes back to one round trip per id. Unused buffered values are
    /// abandoned.
    pub fn disable_buffering(&mut self) {
        self.buffer = None;
    }

    fn shard(&self, shard_id: i64) -> Result<u64> {
        let max = self.layout().max_shard();
        u64::try_from(shard_id)
            .ok()
            .filter(|shard| *shard <= max)
            .ok_or_else(|| {
                Error::validation("shard_id", format!("{shard_id} is outside 0..={max}"))
            })
    }

    /// Generates one id for `shard_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `shard_id` is negative or too large. The
    ///   store is not contacted.
    /// - [`Error::CoordinationUnavailable`] once the store's retry budget is
    ///   spent.
    /// - [`Error::ClockSkew`] if the clock moved backward past the wait
    ///   budget.
    /// - [`Error::EncodingRange`] if the timestamp outgrew its field.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn distinct_async(&mut self, shard_id: i64) -> Result<DistinctId> {
        let shard = self.shard(shard_id)?;
        let started = Instant::now();

        let id = match &mut self.buffer {
            Some(buffer) => buffer.next(&*self.allocator, shard).await?,
            None => {
                let allocation = self.allocator.allocate(shard, 1).await?;
                self.allocator.issue(shard, allocation.start).await?.id
            }
        };

        self.log_timing("distinct", shard, 1, started);
        Ok(id)
    }

    /// Generates `count` ids for `shard_id` with one store round trip.
    ///
    /// Bypasses the buffer. All or nothing.
    ///
    /// # Errors
    ///
    /// As [`distinct_async`](Self::distinct_async), plus
    /// [`Error::Validation`] when `count` is not positive or exceeds the
    /// configured maximum batch size.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn distinct_batch_async(
        &mut self,
        count: i64,
        shard_id: i64,
    ) -> Result<Vec<DistinctId>> {
        let count = u64::try_from(count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| Error::validation("count", format!("{count} is not positive")))?;
        let shard = self.shard(shard_id)?;
        let started = Instant::now();

        let ids = batch::generate_batch(&*self.allocator, count, shard, self.max_batch_size).await?;

        self.log_timing("distinct_batch", shard, ids.len(), started);
        Ok(ids)
    }

    /// Whether the coordination store answers a ping. Never retried.
    pub async fn health_check(&self) -> bool {
        self.allocator.client().health_check().await
    }

    pub fn stats(&self) -> StoreStats {
        self.allocator.client().stats()
    }

    fn log_timing(&self, op: &'static str, shard: u64, count: usize, started: Instant) {
        if !self.log_timings {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(
            op,
            shard,
            count,
            elapsed_us = started.elapsed().as_micros() as u64,
            "generated"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = (op, shard, count, started);
    }
}

impl<S, C> Clone for Generator<S, C> {
    /// Shares the allocator and store; the buffer starts empty.
    fn clone(&self) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
            buffer: self
                .buffer
                .as_ref()
                .and_then(|buffer| LocalBuffer::new(buffer.size()).ok()),
            max_batch_size: self.max_batch_size,
            log_timings: self.log_timings,
        }
    }
}

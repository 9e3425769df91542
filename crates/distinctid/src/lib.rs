//! Distinct, time-sortable 64-bit identifiers per shard.
//!
//! Every identifier packs a millisecond timestamp (relative to
//! [`CUSTOM_EPOCH`]), a caller-chosen shard id and a sequence value. The
//! sequence comes from a per-shard counter in a shared coordination store
//! (Redis `INCRBY`), so processes that never talk to each other still hand
//! out distinct ids for the same shard, as long as the counter values they
//! stamp within one millisecond span fewer than `2^sequence_bits` (see
//! [`LocalBuffer`] for what that means once ranges are buffered).
//!
//! - [`Generator`]: the async API (`distinct_async`, `distinct_batch_async`).
//! - [`BlockingGenerator`]: the same API for synchronous callers.
//! - [`LocalBuffer`]: claims ranges of counter values ahead of time so that
//!   most ids cost no round trip. Enabled with
//!   [`Generator::enable_buffering`].
//! - [`Layout`]: the bit split, [`Layout::TWITTER`] (41/10/12) by default or
//!   [`Layout::LEGACY`] (40/13/10).
//!
//! ```no_run
//! use distinctid::{Generator, GeneratorConfig, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> distinctid::Result<()> {
//!     let mut generator = Generator::connect(StoreConfig::default(), GeneratorConfig::default())?;
//!     let id = generator.distinct_async(1).await?;
//!     println!("{id} -> {:?}", generator.layout().decode(id));
//!     Ok(())
//! }
//! ```
//!
//! Any store with an atomic increment can back a generator by implementing
//! [`CounterStore`]; [`MemoryStore`] keeps counters in process.

mod allocator;
mod batch;
mod blocking;
mod buffer;
mod error;
mod generator;
mod id;
mod status;
pub mod store;
mod time;

pub use crate::allocator::{Allocation, Issued, SequenceAllocator, Stamp};
pub use crate::batch::{DEFAULT_MAX_BATCH_SIZE, generate_batch};
pub use crate::blocking::BlockingGenerator;
pub use crate::buffer::LocalBuffer;
pub use crate::error::*;
pub use crate::generator::{Generator, GeneratorConfig};
pub use crate::id::*;
pub use crate::status::*;
pub use crate::store::redis::{PoolStats, RedisStore, StoreConfig, Topology};
pub use crate::store::{CounterStore, MemoryStore, RetryPolicy, StoreClient, StoreStats};
pub use crate::time::{CUSTOM_EPOCH, MonotonicClock, SystemClock, TimeSource, UNIX_EPOCH_MILLIS};

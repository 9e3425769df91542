//! Claims ranges of raw counter values from the coordination store and stamps
//! each value with a timestamp tick.
//!
//! The store guarantees that raw values are never handed out twice. Reducing
//! them into the sequence field can still repeat inside one millisecond (two
//! raw values `2^sequence_bits` apart), so every shard has a `TickGuard`
//! holding the last (tick, sequence) pair issued in this process. Each new
//! pair must be strictly greater; a sequence that wrapped below the last one
//! moves to the next tick.
//!
//! The guard only sees this process. Another process stamping a raw value
//! `k * 2^sequence_bits` away in the same millisecond produces the same id,
//! see [`Generator::enable_buffering`](crate::Generator::enable_buffering)
//! for what that means with buffering enabled.

use crate::{
    DistinctId, Error, Layout, Poll, Result, TimeSource,
    store::{CounterStore, StoreClient},
};
use core::{ops::Range, time::Duration};
use parking_lot::Mutex;
use std::collections::HashMap;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A contiguous range of raw counter values reserved by one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First reserved raw value.
    pub start: u64,
    /// Number of reserved values.
    pub len: u64,
    /// Clock reading taken when the increment returned.
    pub epoch_offset: u64,
}

impl Allocation {
    /// The reserved raw values, `start..start + len`.
    pub fn raw_values(&self) -> Range<u64> {
        self.start..self.start + self.len
    }
}

/// Where an identifier landed: its timestamp tick and sequence value.
///
/// Ordered like the ids themselves (for one shard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub tick: u64,
    pub sequence: u64,
}

/// An encoded identifier and the stamp it was encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    pub id: DistinctId,
    pub stamp: Stamp,
}

#[derive(Debug, Default)]
struct TickGuard {
    /// Highest wall-clock reading seen.
    last_wall: u64,
    /// Last stamp issued for the shard. Its tick never decreases and may run
    /// ahead of the wall clock after a sequence wrap.
    last: Option<Stamp>,
}

impl TickGuard {
    /// The smallest stamp for `sequence` at `wall` that is above `last`.
    fn next(&self, wall: u64, sequence: u64) -> Stamp {
        let candidate = Stamp {
            tick: wall,
            sequence,
        };
        match self.last {
            Some(last) if candidate <= last => Stamp {
                tick: if sequence > last.sequence {
                    last.tick
                } else {
                    last.tick + 1
                },
                sequence,
            },
            _ => candidate,
        }
    }
}

/// Issues raw counter values for a shard and turns them into identifiers.
///
/// One allocator is shared by every buffer and batch of a generator (and its
/// clones), so all of them draw from one per-shard order: ids for a shard
/// come out strictly increasing in the order they are stamped.
#[derive(Debug)]
pub struct SequenceAllocator<S, C> {
    client: StoreClient<S>,
    clock: C,
    layout: Layout,
    key_prefix: String,
    max_clock_wait: Duration,
    guards: Mutex<HashMap<u64, TickGuard>>,
}

impl<S, C> SequenceAllocator<S, C>
where
    S: CounterStore,
    C: TimeSource,
{
    pub const DEFAULT_KEY_PREFIX: &'static str = "shard";
    pub const DEFAULT_MAX_CLOCK_WAIT: Duration = Duration::from_millis(10);

    pub fn new(client: StoreClient<S>, clock: C, layout: Layout) -> Self {
        Self {
            client,
            clock,
            layout,
            key_prefix: Self::DEFAULT_KEY_PREFIX.to_owned(),
            max_clock_wait: Self::DEFAULT_MAX_CLOCK_WAIT,
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Counter keys are `<prefix>:<shard>:seq`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Longest clock regression waited out before failing with
    /// [`Error::ClockSkew`].
    pub fn with_max_clock_wait(mut self, wait: Duration) -> Self {
        self.max_clock_wait = wait;
        self
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn client(&self) -> &StoreClient<S> {
        &self.client
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn key_for(&self, shard: u64) -> String {
        format!("{}:{}:seq", self.key_prefix, shard)
    }

    fn check_shard(&self, shard: u64) -> Result<()> {
        if shard > self.layout.max_shard() {
            return Err(Error::validation(
                "shard_id",
                format!("{shard} is outside 0..={}", self.layout.max_shard()),
            ));
        }
        Ok(())
    }

    /// Reserves `count` raw values for `shard` with one atomic increment.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `count` is zero or `shard` is out of range.
    ///   The store is not contacted.
    /// - [`Error::CoordinationUnavailable`] once the store client gives up.
    /// - [`Error::CounterReset`] if the counter reads lower than the increment
    ///   just applied to it.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn allocate(&self, shard: u64, count: u64) -> Result<Allocation> {
        self.check_shard(shard)?;
        if count == 0 {
            return Err(Error::validation("count", "must be positive"));
        }

        let key = self.key_for(shard);
        let end = self.client.increment(&key, count).await?;
        let epoch_offset = self.clock.current_millis();

        // Raw value 0 is never handed out, so after adding `count` the
        // counter must be at least `count`.
        let start = end
            .checked_sub(count - 1)
            .filter(|start| *start > 0)
            .ok_or(Error::CounterReset {
                key,
                value: end,
                increment: count,
            })?;

        Ok(Allocation {
            start,
            len: count,
            epoch_offset,
        })
    }

    /// Stamps `raw` with the current tick for `shard` and encodes it.
    ///
    /// The stamp is strictly greater than every stamp this allocator issued
    /// for `shard` before.
    ///
    /// Returns [`Poll::Pending`] when the clock is behind the last reading by
    /// no more than the configured wait. Nothing is recorded when the call
    /// returns `Pending` or an error.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockSkew`] if the clock regressed further than the wait.
    /// - [`Error::EncodingRange`] if the tick outgrew the timestamp field.
    pub fn try_issue(&self, shard: u64, raw: u64) -> Result<Poll<Issued>> {
        self.stamp(shard, raw, self.max_clock_wait.as_millis() as u64)
    }

    /// Like [`try_issue`](Self::try_issue), but sleeps through short clock
    /// regressions. The total time slept stays within the configured wait.
    pub async fn issue(&self, shard: u64, raw: u64) -> Result<Issued> {
        let budget = self.max_clock_wait.as_millis() as u64;
        let mut waited = 0;
        loop {
            match self.stamp(shard, raw, budget.saturating_sub(waited))? {
                Poll::Ready { value } => return Ok(value),
                Poll::Pending { yield_for } => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(shard, yield_for, "clock moved backward, waiting");
                    tokio::time::sleep(Duration::from_millis(yield_for)).await;
                    waited += yield_for;
                }
            }
        }
    }

    fn stamp(&self, shard: u64, raw: u64, wait_budget: u64) -> Result<Poll<Issued>> {
        self.check_shard(shard)?;
        let sequence = self.layout.reduce(raw);
        let wall = self.clock.current_millis();

        let mut guards = self.guards.lock();
        let guard = guards.entry(shard).or_default();

        if wall < guard.last_wall {
            let behind = guard.last_wall - wall;
            if behind <= wait_budget {
                return Ok(Poll::Pending { yield_for: behind });
            }
            return Err(Error::ClockSkew {
                last_seen_ms: guard.last_wall,
                now_ms: wall,
                behind_ms: behind,
            });
        }

        let stamp = guard.next(wall, sequence);
        #[cfg(feature = "tracing")]
        if stamp.tick > wall {
            tracing::trace!(shard, tick = stamp.tick, wall, sequence, "stamping ahead of the clock");
        }
        let id = self.layout.encode(stamp.tick, shard, sequence)?;

        guard.last_wall = wall;
        guard.last = Some(stamp);
        Ok(Poll::Ready {
            value: Issued { id, stamp },
        })
    }
}

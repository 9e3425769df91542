use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
#[cfg(test)]
use portable_atomic::{AtomicU64, Ordering};

/// Reference epoch for the timestamp field: 2025-01-01T00:00:00Z.
///
/// A 41-bit timestamp field counted from here lasts until 2094.
pub const CUSTOM_EPOCH: Duration = Duration::from_millis(1_735_689_600_000);

/// 1970-01-01T00:00:00Z, for ids whose timestamp is plain UNIX time.
pub const UNIX_EPOCH_MILLIS: Duration = Duration::from_millis(0);

/// Milliseconds since a reference epoch.
///
/// ```
/// use distinctid::TimeSource;
///
/// struct Frozen;
/// impl TimeSource for Frozen {
///     fn current_millis(&self) -> u64 {
///         42
///     }
/// }
///
/// assert_eq!(Frozen.current_millis(), 42);
/// ```
pub trait TimeSource {
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// Zero if the system clock is set before 1970.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The default time source: reads the wall clock once, then counts with
/// [`Instant`].
///
/// Readings never go backward, even when NTP steps the system clock, and
/// drift from the wall clock only by what the monotonic timer drifts. Long
/// lived processes that must follow wall-clock corrections can use
/// [`SystemClock`] instead and rely on the allocator's skew handling.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    anchor: Instant,
    anchor_millis: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::with_epoch(CUSTOM_EPOCH)
    }
}

impl MonotonicClock {
    /// A clock whose zero is `epoch` (measured from 1970-01-01 UTC). Starts at
    /// zero if the system clock reads earlier than `epoch`.
    ///
    /// ```
    /// use distinctid::{MonotonicClock, TimeSource, UNIX_EPOCH_MILLIS};
    ///
    /// let clock = MonotonicClock::with_epoch(UNIX_EPOCH_MILLIS);
    /// let a = clock.current_millis();
    /// std::thread::sleep(std::time::Duration::from_millis(2));
    /// assert!(clock.current_millis() > a);
    /// ```
    pub fn with_epoch(epoch: Duration) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_millis: unix_millis().saturating_sub(epoch.as_millis() as u64),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as u64
    }
}

/// A time source that reads the wall clock on every call.
///
/// Unlike [`MonotonicClock`] this follows system clock adjustments, including
/// backward steps. The generator detects such regressions and either waits
/// them out or fails with [`Error::ClockSkew`].
///
/// [`Error::ClockSkew`]: crate::Error::ClockSkew
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::with_epoch(CUSTOM_EPOCH)
    }
}

impl SystemClock {
    pub const fn with_epoch(epoch: Duration) -> Self {
        Self {
            epoch_millis: epoch.as_millis() as u64,
        }
    }
}

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        unix_millis().saturating_sub(self.epoch_millis)
    }
}

/// A hand-driven clock for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn at(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    pub(crate) fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Outcome of trying to stamp a sequence value with a timestamp tick.
///
/// - [`Poll::Ready`] carries the tick the value was stamped with.
/// - [`Poll::Pending`] means the clock is behind the last observed time and the
///   caller should wait `yield_for` milliseconds before trying again. Nothing
///   was recorded, so retrying with the same value is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll<T> {
    Ready {
        value: T,
    },
    Pending {
        /// Milliseconds until the clock is expected to catch up.
        yield_for: u64,
    },
}

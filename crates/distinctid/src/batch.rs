use crate::{
    DistinctId, Error, Result, TimeSource, allocator::SequenceAllocator, store::CounterStore,
};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default upper bound on the size of one batch.
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 1_000_000;

/// Generates `count` ids for `shard` from a single allocation.
///
/// Ids are strictly increasing in the returned order. When the claimed range
/// wraps the sequence field inside one tick, the overflowing ids move to the
/// next tick.
///
/// The call is all or nothing: on any error no id is returned, and the raw
/// values already claimed are abandoned.
///
/// # Errors
///
/// - [`Error::Validation`] if `count` is zero or above `max_batch_size`, or
///   `shard` is out of range. The store is not contacted.
/// - [`Error::CoordinationUnavailable`], [`Error::ClockSkew`] and
///   [`Error::EncodingRange`] as for single ids.
#[cfg_attr(feature = "tracing", instrument(level = "trace", skip(allocator)))]
pub async fn generate_batch<S, C>(
    allocator: &SequenceAllocator<S, C>,
    count: u64,
    shard: u64,
    max_batch_size: u64,
) -> Result<Vec<DistinctId>>
where
    S: CounterStore,
    C: TimeSource,
{
    if count == 0 {
        return Err(Error::validation("count", "must be positive"));
    }
    if count > max_batch_size {
        return Err(Error::validation(
            "count",
            format!("{count} exceeds the maximum batch size of {max_batch_size}"),
        ));
    }

    let allocation = allocator.allocate(shard, count).await?;

    let mut ids = Vec::with_capacity(count as usize);
    for raw in allocation.raw_values() {
        ids.push(allocator.issue(shard, raw).await?.id);
    }
    Ok(ids)
}

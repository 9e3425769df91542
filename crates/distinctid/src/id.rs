use crate::{Error, Result};
use core::fmt;

/// The bit split of an identifier.
///
/// Fields from the most significant bit down: one reserved bit (always zero so
/// ids stay positive as signed 64-bit integers), the timestamp offset, the
/// shard id and the sequence.
///
/// ```text
///  Bit Index:  63           63 62            22 21           12 11             0
///              +--------------+----------------+---------------+---------------+
///  Field:      | reserved (1) | timestamp (41) |  shard (10)   | sequence (12) |
///              +--------------+----------------+---------------+---------------+
///              |<----------- MSB ---------- 64 bits ----------- LSB ---------->|
/// ```
///
/// The diagram shows [`Layout::TWITTER`], the default.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "RawLayout")
)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    timestamp_bits: u8,
    shard_bits: u8,
    sequence_bits: u8,
}

/// Unchecked widths as they appear in a config file; turned into a
/// [`Layout`] through [`Layout::new`].
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawLayout {
    timestamp_bits: u8,
    shard_bits: u8,
    sequence_bits: u8,
}

#[cfg(feature = "serde")]
impl TryFrom<RawLayout> for Layout {
    type Error = Error;

    fn try_from(raw: RawLayout) -> Result<Self> {
        Self::new(raw.timestamp_bits, raw.shard_bits, raw.sequence_bits)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::TWITTER
    }
}

impl Layout {
    /// 41 bits of milliseconds (~69 years), 1024 shards, 4096 ids per
    /// millisecond per shard.
    pub const TWITTER: Self = Self {
        timestamp_bits: 41,
        shard_bits: 10,
        sequence_bits: 12,
    };

    /// The historical distinctid split: 40 bits of milliseconds, 8192 shards,
    /// 1024 ids per millisecond per shard.
    pub const LEGACY: Self = Self {
        timestamp_bits: 40,
        shard_bits: 13,
        sequence_bits: 10,
    };

    /// Builds a custom layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if any width is zero or if the widths add
    /// up to more than 63 bits.
    pub fn new(timestamp_bits: u8, shard_bits: u8, sequence_bits: u8) -> Result<Self> {
        if timestamp_bits == 0 || shard_bits == 0 || sequence_bits == 0 {
            return Err(Error::validation("layout", "every field needs at least one bit"));
        }
        let total = u32::from(timestamp_bits) + u32::from(shard_bits) + u32::from(sequence_bits);
        if total > 63 {
            return Err(Error::validation(
                "layout",
                format!("{total} bits requested, at most 63 fit beside the reserved bit"),
            ));
        }
        Ok(Self {
            timestamp_bits,
            shard_bits,
            sequence_bits,
        })
    }

    pub const fn timestamp_bits(&self) -> u8 {
        self.timestamp_bits
    }

    pub const fn shard_bits(&self) -> u8 {
        self.shard_bits
    }

    pub const fn sequence_bits(&self) -> u8 {
        self.sequence_bits
    }

    /// Largest representable timestamp offset.
    pub const fn max_timestamp(&self) -> u64 {
        (1 << self.timestamp_bits) - 1
    }

    /// Largest valid shard id.
    pub const fn max_shard(&self) -> u64 {
        (1 << self.shard_bits) - 1
    }

    /// Largest sequence value in one tick.
    pub const fn max_sequence(&self) -> u64 {
        (1 << self.sequence_bits) - 1
    }

    /// Number of distinct sequence values per tick per shard.
    pub const fn sequences_per_tick(&self) -> u64 {
        1 << self.sequence_bits
    }

    const fn shard_shift(&self) -> u32 {
        self.sequence_bits as u32
    }

    const fn timestamp_shift(&self) -> u32 {
        self.sequence_bits as u32 + self.shard_bits as u32
    }

    /// Reduces a raw counter value into the sequence field.
    pub const fn reduce(&self, raw: u64) -> u64 {
        raw & self.max_sequence()
    }

    /// Packs the three fields into one identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncodingRange`] if any field exceeds its width; values
    /// are never truncated.
    ///
    /// # Example
    ///
    /// ```
    /// use distinctid::Layout;
    ///
    /// let layout = Layout::TWITTER;
    /// let id = layout.encode(1000, 2, 1).unwrap();
    /// let parts = layout.decode(id);
    /// assert_eq!((parts.timestamp, parts.shard, parts.sequence), (1000, 2, 1));
    /// ```
    pub fn encode(&self, timestamp: u64, shard: u64, sequence: u64) -> Result<DistinctId> {
        check_field("timestamp", timestamp, self.timestamp_bits, self.max_timestamp())?;
        check_field("shard_id", shard, self.shard_bits, self.max_shard())?;
        check_field("sequence", sequence, self.sequence_bits, self.max_sequence())?;
        Ok(DistinctId::from_raw(
            (timestamp << self.timestamp_shift()) | (shard << self.shard_shift()) | sequence,
        ))
    }

    /// Splits an identifier back into its fields.
    pub const fn decode(&self, id: DistinctId) -> Parts {
        let raw = id.to_raw();
        Parts {
            timestamp: (raw >> self.timestamp_shift()) & self.max_timestamp(),
            shard: (raw >> self.shard_shift()) & self.max_shard(),
            sequence: raw & self.max_sequence(),
        }
    }

    /// Whether `id` has the reserved bit and any bits above the timestamp
    /// field cleared.
    pub const fn is_valid(&self, id: DistinctId) -> bool {
        let used = self.timestamp_shift() + self.timestamp_bits as u32;
        id.to_raw() >> used == 0
    }

    /// Wraps `id` so that its `Debug` output renders the bit layout.
    pub const fn describe(&self, id: DistinctId) -> Described {
        Described { layout: *self, id }
    }
}

fn check_field(field: &'static str, value: u64, bits: u8, max: u64) -> Result<()> {
    if value > max {
        return Err(Error::EncodingRange {
            field,
            value,
            bits,
            max,
        });
    }
    Ok(())
}

/// The decoded fields of a [`DistinctId`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Parts {
    /// Milliseconds since the reference epoch.
    pub timestamp: u64,
    pub shard: u64,
    pub sequence: u64,
}

/// A generated identifier.
///
/// Ordering follows the raw integer, so ids of one shard sort by
/// (timestamp, sequence).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DistinctId {
    id: u64,
}

impl DistinctId {
    pub const fn from_raw(raw: u64) -> Self {
        Self { id: raw }
    }

    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    /// Returns the ID as a zero-padded 20-digit string.
    pub fn to_padded_string(&self) -> String {
        format!("{:020}", self.id)
    }
}

impl From<DistinctId> for u64 {
    fn from(id: DistinctId) -> Self {
        id.id
    }
}

impl fmt::Display for DistinctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for DistinctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DistinctId").field(&self.id).finish()
    }
}

/// A [`DistinctId`] paired with its [`Layout`]; `Debug` prints one row per
/// bit field, most significant first.
///
/// ```text
/// DistinctId 00000000000176189443 (0x000000000a807003)
///   field          | dec | hex
///   reserved (1)   | 0   | 0x0
///   timestamp (41) | 42  | 0x2a
///   shard (10)     | 7   | 0x7
///   sequence (12)  | 3   | 0x3
/// ```
pub struct Described {
    layout: Layout,
    id: DistinctId,
}

impl fmt::Debug for Described {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Parts {
            timestamp,
            shard,
            sequence,
        } = self.layout.decode(self.id);
        let used = self.layout.timestamp_shift() + self.layout.timestamp_bits as u32;
        let reserved = self.id.id.checked_shr(used).unwrap_or(0);

        let rows = [
            (format!("reserved ({})", 64 - used), reserved),
            (format!("timestamp ({})", self.layout.timestamp_bits), timestamp),
            (format!("shard ({})", self.layout.shard_bits), shard),
            (format!("sequence ({})", self.layout.sequence_bits), sequence),
        ];
        let name_w = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        let dec_w = rows
            .iter()
            .map(|(_, value)| value.to_string().len())
            .max()
            .unwrap_or(0)
            .max(3);

        writeln!(
            f,
            "DistinctId {} (0x{:016x})",
            self.id.to_padded_string(),
            self.id.id
        )?;
        writeln!(f, "  {:<name_w$} | {:<dec_w$} | hex", "field", "dec")?;
        for (name, value) in &rows {
            writeln!(f, "  {name:<name_w$} | {value:<dec_w$} | 0x{value:x}")?;
        }
        Ok(())
    }
}

//! Parsed flow records.
//!
//! A [`Flow`] keeps every field in its raw IPFIX encoding (big-endian, with
//! reduced-size integer encodings allowed). [`FieldView`] converts those bytes
//! into host values on demand.

use super::element::{reverse_lookup, ElementType, ReverseLookup, REVERSE_PEN};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Bit set of record halves that should be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Direction(u8);

impl Direction {
    pub const NONE: Direction = Direction(0);
    pub const FWD: Direction = Direction(1);
    pub const REV: Direction = Direction(2);
    pub const BOTH: Direction = Direction(3);

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Direction) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Returns true if no direction is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Direction) {
        self.0 &= !other.0;
    }
}

/// Which half of a record a field is being read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Forward,
    Reverse,
}

/// A single field of a flow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowField {
    pub pen: u32,
    pub id: u16,
    pub data: Vec<u8>,
}

/// A parsed flow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub fields: Vec<FlowField>,
    /// True if the record carries both directions of a bidirectional flow.
    pub biflow: bool,
    /// Record halves that passed filtering.
    pub dir: Direction,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    /// Creates an empty uniflow record.
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            biflow: false,
            dir: Direction::FWD,
        }
    }

    /// Creates an empty biflow record with both halves enabled.
    pub fn new_biflow() -> Self {
        Self {
            fields: Vec::new(),
            biflow: true,
            dir: Direction::BOTH,
        }
    }

    /// Appends a field with raw IPFIX-encoded data.
    pub fn push(&mut self, pen: u32, id: u16, data: impl Into<Vec<u8>>) {
        self.fields.push(FlowField {
            pen,
            id,
            data: data.into(),
        });
    }

    /// Finds a field as seen from the given direction.
    ///
    /// The reverse half of a biflow record swaps source and destination
    /// elements and reads per-direction counters from the reverse enterprise.
    pub fn find(&self, pen: u32, id: u16, dir: FlowDirection) -> Option<&FlowField> {
        match dir {
            FlowDirection::Forward => self.find_exact(pen, id),
            FlowDirection::Reverse => {
                if !self.biflow {
                    return None;
                }
                match reverse_lookup(pen, id) {
                    ReverseLookup::Same => self.find_exact(pen, id),
                    ReverseLookup::Swap(other) => self.find_exact(pen, other),
                    ReverseLookup::Reverse(rev_id) => self.find_exact(REVERSE_PEN, rev_id),
                    ReverseLookup::Missing => None,
                }
            }
        }
    }

    /// Iterates all fields matching `(pen, id)` from the given direction.
    pub fn find_all(
        &self,
        pen: u32,
        id: u16,
        dir: FlowDirection,
    ) -> impl Iterator<Item = &FlowField> + '_ {
        let target = match dir {
            FlowDirection::Forward => Some((pen, id)),
            FlowDirection::Reverse if self.biflow => match reverse_lookup(pen, id) {
                ReverseLookup::Same => Some((pen, id)),
                ReverseLookup::Swap(other) => Some((pen, other)),
                ReverseLookup::Reverse(rev_id) => Some((REVERSE_PEN, rev_id)),
                ReverseLookup::Missing => None,
            },
            FlowDirection::Reverse => None,
        };
        self.fields
            .iter()
            .filter(move |f| target == Some((f.pen, f.id)))
    }

    fn find_exact(&self, pen: u32, id: u16) -> Option<&FlowField> {
        self.fields.iter().find(|f| f.pen == pen && f.id == id)
    }
}

/// Typed accessors over a raw IPFIX field encoding.
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    data: &'a [u8],
}

impl<'a> FieldView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Big-endian unsigned integer of 1 to 8 bytes.
    pub fn as_uint(&self) -> Option<u64> {
        if self.data.is_empty() || self.data.len() > 8 {
            return None;
        }
        Some(self.data.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Big-endian signed integer of 1 to 8 bytes, sign extended.
    pub fn as_int(&self) -> Option<i64> {
        let raw = self.as_uint()?;
        let shift = 64 - 8 * self.data.len() as u32;
        Some(((raw << shift) as i64) >> shift)
    }

    /// Timestamp converted to Unix milliseconds.
    pub fn as_datetime_ms(&self, data_type: ElementType) -> Option<u64> {
        match data_type {
            ElementType::DateTimeSeconds if self.data.len() == 4 => {
                self.as_uint().map(|secs| secs * 1000)
            }
            ElementType::DateTimeMilliseconds if self.data.len() == 8 => self.as_uint(),
            ElementType::DateTimeMicroseconds | ElementType::DateTimeNanoseconds
                if self.data.len() == 8 =>
            {
                let raw = self.as_uint()?;
                let secs = (raw >> 32).checked_sub(NTP_EPOCH_OFFSET)?;
                let frac = raw & 0xFFFF_FFFF;
                let millis = (frac * 1000) >> 32;
                Some(secs * 1000 + millis)
            }
            _ => None,
        }
    }
}

/// Encodes a Unix timestamp as an NTP 64-bit timestamp.
///
/// `fraction` is the sub-second part expressed in `units_per_sec` units.
pub fn encode_ntp(unix_secs: u64, fraction: u64, units_per_sec: u64) -> u64 {
    let secs = unix_secs + NTP_EPOCH_OFFSET;
    let frac = (fraction << 32) / units_per_sec;
    // Round up so that decoding recovers the exact sub-second value.
    (secs << 32) | (frac + 1).min(0xFFFF_FFFF)
}

/// Encodes Unix milliseconds as an NTP 64-bit timestamp.
pub fn encode_ntp_ms(unix_ms: u64) -> u64 {
    encode_ntp(unix_ms / 1000, unix_ms % 1000, 1000)
}

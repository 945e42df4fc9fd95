//! Scalar value slots.
//!
//! An aggregation record is a flat byte buffer; every field owns a fixed-size
//! slot inside it. Slots carry no type tag of their own: the owning field's
//! [`DataType`] decides how the bytes are read, written and compared.
//! Integers are stored in native byte order, addresses and strings as raw
//! bytes.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size of the fixed-length string and octet array slots.
pub const STRING_SIZE: usize = 128;

/// Largest fixed slot of any data type.
pub const MAX_VALUE_SIZE: usize = STRING_SIZE;

/// Prefix of an IPv4-mapped IPv6 address (`::ffff:0:0/96`).
const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Storage type of a field's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Unassigned,
    /// IPv4 or IPv6 address, IPv4 stored IPv4-mapped.
    IpAddress,
    Ipv4Address,
    Ipv6Address,
    MacAddress,
    Unsigned8,
    Signed8,
    Unsigned16,
    Signed16,
    Unsigned32,
    Signed32,
    Unsigned64,
    Signed64,
    /// Unix timestamp in milliseconds.
    DateTime,
    String128B,
    Octets128B,
}

impl DataType {
    /// Fixed slot size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Unassigned => 0,
            Self::IpAddress | Self::Ipv6Address => 16,
            Self::Ipv4Address => 4,
            Self::MacAddress => 6,
            Self::Unsigned8 | Self::Signed8 => 1,
            Self::Unsigned16 | Self::Signed16 => 2,
            Self::Unsigned32 | Self::Signed32 => 4,
            Self::Unsigned64 | Self::Signed64 | Self::DateTime => 8,
            Self::String128B | Self::Octets128B => STRING_SIZE,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Self::Unsigned8 | Self::Unsigned16 | Self::Unsigned32 | Self::Unsigned64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Signed8 | Self::Signed16 | Self::Signed32 | Self::Signed64
        )
    }

    /// Integer types that can be summed.
    pub fn is_number(self) -> bool {
        self.is_unsigned() || self.is_signed()
    }

    pub fn is_ip(self) -> bool {
        matches!(self, Self::IpAddress | Self::Ipv4Address | Self::Ipv6Address)
    }

    /// Returns the display name of the type.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::IpAddress => "ipaddress",
            Self::Ipv4Address => "ipv4address",
            Self::Ipv6Address => "ipv6address",
            Self::MacAddress => "macaddress",
            Self::Unsigned8 => "unsigned8",
            Self::Signed8 => "signed8",
            Self::Unsigned16 => "unsigned16",
            Self::Signed16 => "signed16",
            Self::Unsigned32 => "unsigned32",
            Self::Signed32 => "signed32",
            Self::Unsigned64 => "unsigned64",
            Self::Signed64 => "signed64",
            Self::DateTime => "datetime",
            Self::String128B => "string128b",
            Self::Octets128B => "octets128b",
        }
    }

    /// Smallest type both `a` and `b` widen into without loss.
    pub fn common(a: DataType, b: DataType) -> Option<DataType> {
        if a == b {
            return Some(a);
        }
        if a.is_unsigned() && b.is_unsigned() {
            return Some(if a.size() >= b.size() { a } else { b });
        }
        if a.is_signed() && b.is_signed() {
            return Some(if a.size() >= b.size() { a } else { b });
        }
        if a.is_ip() && b.is_ip() {
            return Some(Self::IpAddress);
        }
        None
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Slot accessors
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_fixed<const N: usize>(slot: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slot[..N]);
    out
}

/// Reads an unsigned integer slot of the given type, zero extended.
#[inline]
pub fn get_uint(data_type: DataType, slot: &[u8]) -> u64 {
    match data_type.size() {
        1 => u64::from(slot[0]),
        2 => u64::from(u16::from_ne_bytes(read_fixed(slot))),
        4 => u64::from(u32::from_ne_bytes(read_fixed(slot))),
        _ => u64::from_ne_bytes(read_fixed(slot)),
    }
}

/// Reads a signed integer slot of the given type, sign extended.
#[inline]
pub fn get_int(data_type: DataType, slot: &[u8]) -> i64 {
    match data_type.size() {
        1 => i64::from(slot[0] as i8),
        2 => i64::from(i16::from_ne_bytes(read_fixed(slot))),
        4 => i64::from(i32::from_ne_bytes(read_fixed(slot))),
        _ => i64::from_ne_bytes(read_fixed(slot)),
    }
}

/// Writes an unsigned integer into a slot, truncating to the slot width.
#[inline]
pub fn set_uint(data_type: DataType, slot: &mut [u8], value: u64) {
    match data_type.size() {
        1 => slot[0] = value as u8,
        2 => slot[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
        4 => slot[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
        _ => slot[..8].copy_from_slice(&value.to_ne_bytes()),
    }
}

/// Writes a signed integer into a slot, truncating to the slot width.
#[inline]
pub fn set_int(data_type: DataType, slot: &mut [u8], value: i64) {
    match data_type.size() {
        1 => slot[0] = value as i8 as u8,
        2 => slot[..2].copy_from_slice(&(value as i16).to_ne_bytes()),
        4 => slot[..4].copy_from_slice(&(value as i32).to_ne_bytes()),
        _ => slot[..8].copy_from_slice(&value.to_ne_bytes()),
    }
}

/// Reads a `DateTime` slot.
#[inline]
pub fn get_datetime(slot: &[u8]) -> u64 {
    u64::from_ne_bytes(read_fixed(slot))
}

/// Writes a `DateTime` slot.
#[inline]
pub fn set_datetime(slot: &mut [u8], millis: u64) {
    slot[..8].copy_from_slice(&millis.to_ne_bytes());
}

/// Writes an IPv4 address into a generic `IpAddress` slot.
pub fn set_ip_from_v4(slot: &mut [u8], addr: &[u8]) {
    slot[..12].copy_from_slice(&IPV4_MAPPED_PREFIX);
    slot[12..16].copy_from_slice(&addr[..4]);
}

/// Returns true if a generic `IpAddress` slot holds an IPv4 address.
pub fn ip_is_v4(slot: &[u8]) -> bool {
    slot[..12] == IPV4_MAPPED_PREFIX
}

/// Copies `src` of type `from` into `dst` of type `to`, widening as needed.
///
/// Returns false if `from` does not widen into `to`.
pub fn widen(from: DataType, src: &[u8], to: DataType, dst: &mut [u8]) -> bool {
    if from == to {
        let size = to.size();
        dst[..size].copy_from_slice(&src[..size]);
        return true;
    }
    match (from, to) {
        (f, t) if f.is_unsigned() && t.is_unsigned() && f.size() <= t.size() => {
            set_uint(t, dst, get_uint(f, src));
            true
        }
        (f, t) if f.is_signed() && t.is_signed() && f.size() <= t.size() => {
            set_int(t, dst, get_int(f, src));
            true
        }
        (DataType::Ipv4Address, DataType::IpAddress) => {
            set_ip_from_v4(dst, src);
            true
        }
        (DataType::Ipv6Address, DataType::IpAddress) => {
            dst[..16].copy_from_slice(&src[..16]);
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Compares two slots of the same type.
pub fn compare(data_type: DataType, a: &[u8], b: &[u8]) -> Ordering {
    match data_type {
        t if t.is_unsigned() => get_uint(t, a).cmp(&get_uint(t, b)),
        t if t.is_signed() => get_int(t, a).cmp(&get_int(t, b)),
        DataType::DateTime => get_datetime(a).cmp(&get_datetime(b)),
        t => {
            let size = t.size();
            a[..size].cmp(&b[..size])
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded values
// ---------------------------------------------------------------------------

/// A slot decoded into a host value, used for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Ip(IpAddr),
    Mac([u8; 6]),
    DateTime(u64),
    String(String),
    Octets(Vec<u8>),
    Empty,
}

impl Value {
    /// Decodes a slot according to its type.
    pub fn decode(data_type: DataType, slot: &[u8]) -> Value {
        match data_type {
            t if t.is_unsigned() => Value::Unsigned(get_uint(t, slot)),
            t if t.is_signed() => Value::Signed(get_int(t, slot)),
            DataType::IpAddress => {
                if ip_is_v4(slot) {
                    Value::Ip(IpAddr::V4(Ipv4Addr::from(read_fixed::<4>(&slot[12..]))))
                } else {
                    Value::Ip(IpAddr::V6(Ipv6Addr::from(read_fixed::<16>(slot))))
                }
            }
            DataType::Ipv4Address => Value::Ip(IpAddr::V4(Ipv4Addr::from(read_fixed::<4>(slot)))),
            DataType::Ipv6Address => {
                Value::Ip(IpAddr::V6(Ipv6Addr::from(read_fixed::<16>(slot))))
            }
            DataType::MacAddress => Value::Mac(read_fixed(slot)),
            DataType::DateTime => Value::DateTime(get_datetime(slot)),
            DataType::String128B => Value::String(
                String::from_utf8_lossy(trim_trailing_zeros(&slot[..STRING_SIZE], 0)).into_owned(),
            ),
            DataType::Octets128B => {
                Value::Octets(trim_trailing_zeros(&slot[..STRING_SIZE], 1).to_vec())
            }
            _ => Value::Empty,
        }
    }
}

/// Strips trailing zero bytes, keeping at least `keep` bytes.
fn trim_trailing_zeros(bytes: &[u8], keep: usize) -> &[u8] {
    let mut end = bytes.len();
    while end > keep && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Signed(v) => write!(f, "{v}"),
            Value::Ip(addr) => write!(f, "{addr}"),
            Value::Mac(m) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            ),
            Value::DateTime(ms) => {
                let secs = (*ms / 1000) as i64;
                let nanos = ((*ms % 1000) * 1_000_000) as u32;
                match chrono::DateTime::from_timestamp(secs, nanos) {
                    Some(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.3f")),
                    None => write!(f, "{ms}"),
                }
            }
            Value::String(s) => {
                for c in s.chars() {
                    if c.is_control() {
                        write!(f, "\\x{:02X}", c as u32)?;
                    } else {
                        write!(f, "{c}")?;
                    }
                }
                Ok(())
            }
            Value::Octets(bytes) => write!(f, "0x{}", hex::encode_upper(bytes)),
            Value::Empty => Ok(()),
        }
    }
}

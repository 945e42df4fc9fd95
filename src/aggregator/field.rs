//! Field model.
//!
//! A [`Field`] knows how to produce or fold a value for one slot of an
//! aggregation record. Key fields implement `load`; value fields implement
//! `init`, `aggregate` and `merge`. All variants share `compare` (by their
//! data type) and structural equality.

use std::cmp::Ordering;
use std::fmt;

use super::error::ViewError;
use super::value::{self, DataType, MAX_VALUE_SIZE, STRING_SIZE};
use crate::ipfix::element::{Alias, Element, ElementType, Registry};
use crate::ipfix::flow::{FieldView, Flow, FlowDirection, FlowField};

/// Value of the direction pseudo-field for the forward half of a record.
pub const FWD_VALUE: u8 = 1;
/// Value of the direction pseudo-field for the reverse half of a record.
pub const REV_VALUE: u8 = 2;

/// Logical side of a record when a view folds in/out fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDirection {
    None,
    In,
    Out,
}

/// A flow record as seen by field loaders.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext<'a> {
    pub flow: &'a Flow,
    pub flow_dir: FlowDirection,
    pub view_dir: ViewDirection,
}

impl<'a> FlowContext<'a> {
    pub fn new(flow: &'a Flow) -> Self {
        Self {
            flow,
            flow_dir: FlowDirection::Forward,
            view_dir: ViewDirection::None,
        }
    }

    /// Finds an element in the current half of the record.
    #[inline]
    pub fn find(&self, pen: u32, id: u16) -> Option<&'a FlowField> {
        self.flow.find(pen, id, self.flow_dir)
    }
}

/// How a value field combines partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Min,
    Max,
    /// Key fields and other non-aggregated fields.
    None,
}

// --- Variants ---

/// A protocol element read straight from the record.
#[derive(Debug, Clone)]
pub struct DirectField {
    pen: u32,
    id: u16,
    element_type: ElementType,
    data_type: DataType,
}

/// The first present of several elements, widened to a common type.
#[derive(Debug, Clone)]
pub struct AliasField {
    sources: Vec<DirectField>,
    data_type: DataType,
}

/// A timestamp rounded down to a multiple of a window.
#[derive(Debug, Clone)]
pub struct TimeWindowField {
    source: Box<Field>,
    window_ms: u64,
}

/// An address with host bits beyond a prefix cleared.
#[derive(Debug, Clone)]
pub struct SubnetField {
    source: Box<Field>,
    prefix_len: u8,
}

/// Sum, min or max over a source field.
#[derive(Debug, Clone)]
pub struct AggregatedField {
    source: Box<Field>,
    data_type: DataType,
}

/// A key field resolving to one of two fields by view direction.
#[derive(Debug, Clone)]
pub struct InOutKeyField {
    in_field: Box<Field>,
    out_field: Box<Field>,
}

/// A value field that only folds records of one view direction.
#[derive(Debug, Clone)]
pub struct InOutValueField {
    field: Box<Field>,
    dir: ViewDirection,
}

/// Closed set of field kinds.
#[derive(Debug, Clone)]
pub enum Field {
    Direct(DirectField),
    Alias(AliasField),
    TimeWindow(TimeWindowField),
    Subnet(SubnetField),
    FlowCount,
    Direction,
    Sum(AggregatedField),
    Min(AggregatedField),
    Max(AggregatedField),
    InOutKey(InOutKeyField),
    InOutValue(InOutValueField),
}

impl DirectField {
    /// Creates a field reading `elem`.
    pub fn new(elem: &Element) -> Result<Self, ViewError> {
        let data_type = match elem.data_type {
            ElementType::Unsigned8 => DataType::Unsigned8,
            ElementType::Unsigned16 => DataType::Unsigned16,
            ElementType::Unsigned32 => DataType::Unsigned32,
            ElementType::Unsigned64 => DataType::Unsigned64,
            ElementType::Signed8 => DataType::Signed8,
            ElementType::Signed16 => DataType::Signed16,
            ElementType::Signed32 => DataType::Signed32,
            ElementType::Signed64 => DataType::Signed64,
            ElementType::Ipv4Address => DataType::Ipv4Address,
            ElementType::Ipv6Address => DataType::Ipv6Address,
            ElementType::MacAddress => DataType::MacAddress,
            ElementType::String => DataType::String128B,
            ElementType::OctetArray => DataType::Octets128B,
            t if t.is_datetime() => DataType::DateTime,
            _ => return Err(ViewError::UnsupportedType(elem.name.clone())),
        };

        Ok(Self {
            pen: elem.pen,
            id: elem.id,
            element_type: elem.data_type,
            data_type,
        })
    }

    pub fn pen(&self) -> u32 {
        self.pen
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Loads the element into `slot`.
    ///
    /// Returns false if the element is absent or its encoding does not fit
    /// the data type; the slot content is unspecified in that case.
    fn load(&self, ctx: &FlowContext<'_>, slot: &mut [u8]) -> bool {
        let Some(field) = ctx.find(self.pen, self.id) else {
            return false;
        };
        let view = FieldView::new(&field.data);
        if self.data_type.is_number() && field.data.len() > self.data_type.size() {
            return false;
        }

        match self.data_type {
            t if t.is_unsigned() => match view.as_uint() {
                Some(v) => value::set_uint(t, slot, v),
                None => return false,
            },
            t if t.is_signed() => match view.as_int() {
                Some(v) => value::set_int(t, slot, v),
                None => return false,
            },
            DataType::DateTime => match view.as_datetime_ms(self.element_type) {
                Some(ms) => value::set_datetime(slot, ms),
                None => return false,
            },
            DataType::String128B | DataType::Octets128B => {
                let n = field.data.len().min(STRING_SIZE);
                slot[..n].copy_from_slice(&field.data[..n]);
                slot[n..STRING_SIZE].fill(0);
            }
            t @ (DataType::Ipv4Address | DataType::Ipv6Address | DataType::MacAddress) => {
                if field.data.len() != t.size() {
                    return false;
                }
                slot[..t.size()].copy_from_slice(&field.data);
            }
            _ => return false,
        }

        true
    }
}

impl PartialEq for DirectField {
    fn eq(&self, other: &Self) -> bool {
        self.pen == other.pen && self.id == other.id
    }
}

impl AliasField {
    /// Creates a field over the sources of `alias`.
    pub fn new(alias: &Alias, registry: &Registry) -> Result<Self, ViewError> {
        let mut sources = Vec::with_capacity(alias.sources.len());
        for &(pen, id) in &alias.sources {
            let elem = registry
                .find_id(pen, id)
                .ok_or_else(|| ViewError::EmptyAlias(alias.name.clone()))?;
            sources.push(DirectField::new(elem)?);
        }

        let Some(first) = sources.first() else {
            return Err(ViewError::EmptyAlias(alias.name.clone()));
        };

        let mut data_type = first.data_type;
        for source in &sources {
            data_type = DataType::common(data_type, source.data_type)
                .ok_or_else(|| ViewError::IncompatibleAlias(alias.name.clone()))?;
        }

        Ok(Self { sources, data_type })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Source elements in lookup order.
    pub fn sources(&self) -> &[DirectField] {
        &self.sources
    }

    fn load(&self, ctx: &FlowContext<'_>, slot: &mut [u8]) -> bool {
        let mut tmp = [0u8; MAX_VALUE_SIZE];
        for source in &self.sources {
            let size = source.data_type.size();
            if source.load(ctx, &mut tmp[..size]) {
                return value::widen(source.data_type, &tmp, self.data_type, slot);
            }
        }
        false
    }
}

impl TimeWindowField {
    /// Creates a window of `window_ms` milliseconds over a timestamp field.
    pub fn new(source: Field, window_ms: u64) -> Result<Self, ViewError> {
        if source.data_type() != DataType::DateTime {
            return Err(ViewError::InvalidArguments {
                def: source.to_string(),
                reason: "time window requires a timestamp field".into(),
            });
        }
        if window_ms == 0 {
            return Err(ViewError::InvalidArguments {
                def: source.to_string(),
                reason: "time window must be positive".into(),
            });
        }
        Ok(Self {
            source: Box::new(source),
            window_ms,
        })
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

impl SubnetField {
    /// Creates a subnet of `prefix_len` bits over an address field.
    pub fn new(source: Field, prefix_len: u8) -> Result<Self, ViewError> {
        let max_len = match source.data_type() {
            DataType::Ipv4Address => 32,
            DataType::Ipv6Address | DataType::IpAddress => 128,
            _ => {
                return Err(ViewError::InvalidArguments {
                    def: source.to_string(),
                    reason: "subnet requires an address field".into(),
                })
            }
        };
        if prefix_len > max_len {
            return Err(ViewError::InvalidArguments {
                def: source.to_string(),
                reason: format!("prefix length {prefix_len} exceeds {max_len}"),
            });
        }
        Ok(Self {
            source: Box::new(source),
            prefix_len,
        })
    }

    pub fn source(&self) -> &Field {
        &self.source
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn load(&self, ctx: &FlowContext<'_>, slot: &mut [u8]) -> bool {
        if !self.source.load(ctx, slot) {
            return false;
        }
        match self.source.data_type() {
            DataType::Ipv4Address => mask_prefix(&mut slot[..4], self.prefix_len),
            DataType::IpAddress if value::ip_is_v4(slot) => {
                mask_prefix(&mut slot[12..16], self.prefix_len.min(32))
            }
            _ => mask_prefix(&mut slot[..16], self.prefix_len),
        }
        true
    }
}

/// Clears every bit past the first `prefix_len` bits of `addr`.
fn mask_prefix(addr: &mut [u8], prefix_len: u8) {
    let prefix_len = usize::from(prefix_len);
    if prefix_len >= addr.len() * 8 {
        return;
    }
    let start = prefix_len / 8;
    addr[start] &= !(0xFFu8 >> (prefix_len % 8));
    addr[start + 1..].fill(0);
}

impl AggregatedField {
    /// Sum over a numeric source, accumulated as 64-bit.
    pub fn sum(source: Field) -> Result<Field, ViewError> {
        let data_type = match source.data_type() {
            t if t.is_signed() => DataType::Signed64,
            t if t.is_unsigned() => DataType::Unsigned64,
            _ => return Err(ViewError::InvalidAggregate(source.to_string())),
        };
        Ok(Field::Sum(Self {
            source: Box::new(source),
            data_type,
        }))
    }

    /// Minimum over a numeric or timestamp source.
    pub fn min(source: Field) -> Result<Field, ViewError> {
        let data_type = Self::extremum_type(&source)?;
        Ok(Field::Min(Self {
            source: Box::new(source),
            data_type,
        }))
    }

    /// Maximum over a numeric or timestamp source.
    pub fn max(source: Field) -> Result<Field, ViewError> {
        let data_type = Self::extremum_type(&source)?;
        Ok(Field::Max(Self {
            source: Box::new(source),
            data_type,
        }))
    }

    fn extremum_type(source: &Field) -> Result<DataType, ViewError> {
        match source.data_type() {
            t if t.is_number() || t == DataType::DateTime => Ok(t),
            _ => Err(ViewError::InvalidAggregate(source.to_string())),
        }
    }

    pub fn source(&self) -> &Field {
        &self.source
    }

    /// Loads the source value into `tmp`, returning false if absent.
    #[inline]
    fn load_source(&self, ctx: &FlowContext<'_>, tmp: &mut [u8; MAX_VALUE_SIZE]) -> bool {
        let size = self.source.size();
        self.source.load(ctx, &mut tmp[..size])
    }
}

impl InOutKeyField {
    /// Pairs the field read for inbound traffic with the one for outbound.
    pub fn new(in_field: Field, out_field: Field) -> Result<Self, ViewError> {
        if in_field.data_type() != out_field.data_type() {
            return Err(ViewError::InOutMismatch(format!("{in_field}/{out_field}")));
        }
        Ok(Self {
            in_field: Box::new(in_field),
            out_field: Box::new(out_field),
        })
    }
}

impl InOutValueField {
    /// Restricts `field` to records folded in direction `dir`.
    pub fn new(field: Field, dir: ViewDirection) -> Self {
        Self {
            field: Box::new(field),
            dir,
        }
    }

    pub fn dir(&self) -> ViewDirection {
        self.dir
    }
}

// --- Dispatch ---

impl Field {
    /// Storage type of this field's slot.
    pub fn data_type(&self) -> DataType {
        match self {
            Field::Direct(f) => f.data_type,
            Field::Alias(f) => f.data_type,
            Field::TimeWindow(_) => DataType::DateTime,
            Field::Subnet(f) => f.source.data_type(),
            Field::FlowCount => DataType::Unsigned64,
            Field::Direction => DataType::Unsigned8,
            Field::Sum(f) | Field::Min(f) | Field::Max(f) => f.data_type,
            Field::InOutKey(f) => f.in_field.data_type(),
            Field::InOutValue(f) => f.field.data_type(),
        }
    }

    /// Slot size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.data_type().size()
    }

    /// Reducer applied when partial results are merged.
    pub fn reducer(&self) -> Reducer {
        match self {
            Field::Sum(_) => Reducer::Sum,
            Field::Min(_) => Reducer::Min,
            Field::Max(_) => Reducer::Max,
            Field::InOutValue(f) => f.field.reducer(),
            _ => Reducer::None,
        }
    }

    /// Computes this field's value for the current record into `slot`.
    ///
    /// Returns false if the record lacks the data; the caller must then
    /// ignore the slot.
    pub fn load(&self, ctx: &FlowContext<'_>, slot: &mut [u8]) -> bool {
        match self {
            Field::Direct(f) => f.load(ctx, slot),
            Field::Alias(f) => f.load(ctx, slot),
            Field::TimeWindow(f) => {
                if !f.source.load(ctx, slot) {
                    return false;
                }
                let ts = value::get_datetime(slot);
                value::set_datetime(slot, ts / f.window_ms * f.window_ms);
                true
            }
            Field::Subnet(f) => f.load(ctx, slot),
            Field::FlowCount => {
                value::set_uint(DataType::Unsigned64, slot, 1);
                true
            }
            Field::Direction => {
                slot[0] = match ctx.flow_dir {
                    FlowDirection::Forward => FWD_VALUE,
                    FlowDirection::Reverse => REV_VALUE,
                };
                true
            }
            Field::InOutKey(f) => match ctx.view_dir {
                ViewDirection::In => f.in_field.load(ctx, slot),
                ViewDirection::Out => f.out_field.load(ctx, slot),
                ViewDirection::None => false,
            },
            Field::Sum(_) | Field::Min(_) | Field::Max(_) | Field::InOutValue(_) => false,
        }
    }

    /// Writes the identity value of the reducer into `slot`.
    pub fn init(&self, slot: &mut [u8]) {
        match self {
            Field::Sum(f) => slot[..f.data_type.size()].fill(0),
            Field::Min(f) => set_type_max(f.data_type, slot),
            Field::Max(f) => set_type_min(f.data_type, slot),
            Field::InOutValue(f) => f.field.init(slot),
            other => slot[..other.size()].fill(0),
        }
    }

    /// Folds the current record into `slot`.
    ///
    /// Returns false if the source was absent; the slot is left untouched.
    #[inline]
    pub fn aggregate(&self, ctx: &FlowContext<'_>, slot: &mut [u8]) -> bool {
        let mut tmp = [0u8; MAX_VALUE_SIZE];
        match self {
            Field::Sum(f) => {
                if !f.load_source(ctx, &mut tmp) {
                    return false;
                }
                add_widened(f.source.data_type(), &tmp, f.data_type, slot);
                true
            }
            Field::Min(f) => {
                if !f.load_source(ctx, &mut tmp) {
                    return false;
                }
                if value::compare(f.data_type, &tmp, slot) == Ordering::Less {
                    let size = f.data_type.size();
                    slot[..size].copy_from_slice(&tmp[..size]);
                }
                true
            }
            Field::Max(f) => {
                if !f.load_source(ctx, &mut tmp) {
                    return false;
                }
                if value::compare(f.data_type, &tmp, slot) == Ordering::Greater {
                    let size = f.data_type.size();
                    slot[..size].copy_from_slice(&tmp[..size]);
                }
                true
            }
            Field::InOutValue(f) => {
                if f.dir == ctx.view_dir {
                    f.field.aggregate(ctx, slot)
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Combines a partial result `other` into `slot`.
    #[inline]
    pub fn merge(&self, slot: &mut [u8], other: &[u8]) {
        match self {
            Field::Sum(f) => add_widened(f.data_type, other, f.data_type, slot),
            Field::Min(f) => {
                if value::compare(f.data_type, other, slot) == Ordering::Less {
                    let size = f.data_type.size();
                    slot[..size].copy_from_slice(&other[..size]);
                }
            }
            Field::Max(f) => {
                if value::compare(f.data_type, other, slot) == Ordering::Greater {
                    let size = f.data_type.size();
                    slot[..size].copy_from_slice(&other[..size]);
                }
            }
            Field::InOutValue(f) => f.field.merge(slot, other),
            _ => {}
        }
    }

    /// Orders two slots of this field.
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        value::compare(self.data_type(), a, b)
    }
}

/// Adds a numeric `src` of type `from` to the 64-bit accumulator `slot`.
#[inline]
fn add_widened(from: DataType, src: &[u8], to: DataType, slot: &mut [u8]) {
    if to.is_signed() {
        let acc = value::get_int(to, slot);
        value::set_int(to, slot, acc.wrapping_add(value::get_int(from, src)));
    } else {
        let acc = value::get_uint(to, slot);
        value::set_uint(to, slot, acc.wrapping_add(value::get_uint(from, src)));
    }
}

fn set_type_max(data_type: DataType, slot: &mut [u8]) {
    match data_type {
        t if t.is_signed() => value::set_int(t, slot, signed_bounds(t).1),
        t if t.is_unsigned() => value::set_uint(t, slot, u64::MAX),
        DataType::DateTime => value::set_datetime(slot, u64::MAX),
        t => slot[..t.size()].fill(0xFF),
    }
}

fn set_type_min(data_type: DataType, slot: &mut [u8]) {
    match data_type {
        t if t.is_signed() => value::set_int(t, slot, signed_bounds(t).0),
        t => slot[..t.size()].fill(0),
    }
}

fn signed_bounds(data_type: DataType) -> (i64, i64) {
    match data_type.size() {
        1 => (i64::from(i8::MIN), i64::from(i8::MAX)),
        2 => (i64::from(i16::MIN), i64::from(i16::MAX)),
        4 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        _ => (i64::MIN, i64::MAX),
    }
}

// --- Equality and description ---

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Field::Direct(a), Field::Direct(b)) => a == b,
            (Field::Alias(a), Field::Alias(b)) => a.sources == b.sources,
            (Field::TimeWindow(a), Field::TimeWindow(b)) => {
                a.window_ms == b.window_ms && a.source == b.source
            }
            (Field::Subnet(a), Field::Subnet(b)) => {
                a.prefix_len == b.prefix_len && a.source == b.source
            }
            (Field::FlowCount, Field::FlowCount) => true,
            (Field::Direction, Field::Direction) => true,
            (Field::Sum(a), Field::Sum(b))
            | (Field::Min(a), Field::Min(b))
            | (Field::Max(a), Field::Max(b)) => a.source == b.source,
            (Field::InOutKey(a), Field::InOutKey(b)) => {
                a.in_field == b.in_field && a.out_field == b.out_field
            }
            (Field::InOutValue(a), Field::InOutValue(b)) => a.dir == b.dir && a.field == b.field,
            _ => false,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Direct(d) => write!(
                f,
                "Direct(pen={}, id={}, type={})",
                d.pen, d.id, d.data_type
            ),
            Field::Alias(a) => {
                write!(f, "Alias(type={}, sources=[", a.data_type)?;
                for (i, s) in a.sources.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}:{}", s.pen, s.id)?;
                }
                f.write_str("])")
            }
            Field::TimeWindow(t) => write!(f, "TimeWindow({}, {}ms)", t.source, t.window_ms),
            Field::Subnet(s) => write!(f, "Subnet({}, /{})", s.source, s.prefix_len),
            Field::FlowCount => f.write_str("FlowCount"),
            Field::Direction => f.write_str("Direction"),
            Field::Sum(a) => write!(f, "Sum({})", a.source),
            Field::Min(a) => write!(f, "Min({})", a.source),
            Field::Max(a) => write!(f, "Max({})", a.source),
            Field::InOutKey(k) => write!(f, "InOutKey(in={}, out={})", k.in_field, k.out_field),
            Field::InOutValue(v) => write!(f, "InOutValue({:?}, {})", v.dir, v.field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfix::element::{IANA_PEN, REVERSE_PEN};

    fn direct(name: &str) -> Field {
        let registry = Registry::builtin();
        let elem = registry.find_name(name).expect("element");
        Field::Direct(DirectField::new(elem).expect("direct"))
    }

    fn alias(name: &str, registry: &Registry) -> Field {
        let alias = registry.find_alias(name).expect("alias");
        Field::Alias(AliasField::new(alias, registry).expect("alias field"))
    }

    fn load(field: &Field, ctx: &FlowContext<'_>) -> Option<Vec<u8>> {
        let mut slot = vec![0u8; field.size()];
        field.load(ctx, &mut slot).then_some(slot)
    }

    #[test]
    fn test_direct_load_reduced_size_integer() {
        let field = direct("octetDeltaCount");
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 1, [0x01, 0x00]);
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(value::get_uint(DataType::Unsigned64, &slot), 256);
    }

    #[test]
    fn test_direct_load_missing_or_malformed() {
        let field = direct("sourceIPv4Address");
        let mut flow = Flow::new();
        assert!(load(&field, &FlowContext::new(&flow)).is_none());

        flow.push(IANA_PEN, 8, [10, 0, 0]);
        assert!(load(&field, &FlowContext::new(&flow)).is_none());
    }

    #[test]
    fn test_direct_load_string_is_zero_padded() {
        let field = direct("applicationName");
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 96, b"dns".to_vec());
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(&slot[..3], b"dns");
        assert!(slot[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alias_widens_first_present_source() {
        let mut registry = Registry::new();
        registry.add_element(IANA_PEN, 1000, "small", ElementType::Unsigned8);
        registry.add_element(IANA_PEN, 1001, "wide", ElementType::Unsigned16);
        registry.add_alias("either", &["small", "wide"]);
        let field = alias("either", &registry);
        assert_eq!(field.data_type(), DataType::Unsigned16);

        let mut flow = Flow::new();
        flow.push(IANA_PEN, 1001, 0x1234u16.to_be_bytes());
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(value::get_uint(DataType::Unsigned16, &slot), 0x1234);
    }

    #[test]
    fn test_alias_incompatible_types() {
        let mut registry = Registry::new();
        registry.add_element(IANA_PEN, 1000, "num", ElementType::Unsigned8);
        registry.add_element(IANA_PEN, 1001, "addr", ElementType::Ipv4Address);
        registry.add_alias("bad", &["num", "addr"]);
        let alias = registry.find_alias("bad").expect("alias");
        let err = AliasField::new(alias, &registry).unwrap_err();
        assert_eq!(err, ViewError::IncompatibleAlias("bad".into()));
    }

    #[test]
    fn test_alias_over_ip_versions() {
        let registry = Registry::builtin();
        let field = alias("srcip", &registry);
        assert_eq!(field.data_type(), DataType::IpAddress);

        let mut flow = Flow::new();
        flow.push(IANA_PEN, 8, [192, 168, 0, 1]);
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert!(value::ip_is_v4(&slot));
        assert_eq!(&slot[12..], &[192, 168, 0, 1]);
    }

    #[test]
    fn test_subnet_masks_host_bits() {
        let field = Field::Subnet(SubnetField::new(direct("sourceIPv4Address"), 24).expect("subnet"));
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 8, [10, 1, 2, 3]);
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(slot, vec![10, 1, 2, 0]);

        let field = Field::Subnet(SubnetField::new(direct("sourceIPv4Address"), 12).expect("subnet"));
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(slot, vec![10, 0, 0, 0]);
    }

    #[test]
    fn test_subnet_on_mapped_ipv4_alias() {
        let registry = Registry::builtin();
        let field = Field::Subnet(SubnetField::new(alias("srcip", &registry), 16).expect("subnet"));
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 8, [172, 16, 5, 4]);
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert!(value::ip_is_v4(&slot));
        assert_eq!(&slot[12..], &[172, 16, 0, 0]);
    }

    #[test]
    fn test_subnet_rejects_bad_source_and_prefix() {
        assert!(SubnetField::new(direct("protocolIdentifier"), 8).is_err());
        assert!(SubnetField::new(direct("sourceIPv4Address"), 33).is_err());
        assert!(SubnetField::new(direct("sourceIPv6Address"), 128).is_ok());
    }

    #[test]
    fn test_time_window_rounds_down() {
        let field = Field::TimeWindow(
            TimeWindowField::new(direct("flowStartMilliseconds"), 60_000).expect("window"),
        );
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 152, 1_700_000_059_999u64.to_be_bytes());
        let slot = load(&field, &FlowContext::new(&flow)).expect("present");
        assert_eq!(value::get_datetime(&slot), 1_700_000_040_000);

        assert!(TimeWindowField::new(direct("octetDeltaCount"), 1000).is_err());
        assert!(TimeWindowField::new(direct("flowStartMilliseconds"), 0).is_err());
    }

    #[test]
    fn test_direction_and_flow_count() {
        let mut flow = Flow::new_biflow();
        flow.push(IANA_PEN, 1, [1]);
        let mut ctx = FlowContext::new(&flow);
        assert_eq!(load(&Field::Direction, &ctx), Some(vec![FWD_VALUE]));
        ctx.flow_dir = FlowDirection::Reverse;
        assert_eq!(load(&Field::Direction, &ctx), Some(vec![REV_VALUE]));

        let slot = load(&Field::FlowCount, &ctx).expect("count");
        assert_eq!(value::get_uint(DataType::Unsigned64, &slot), 1);
    }

    #[test]
    fn test_sum_widens_and_accumulates() {
        let field = AggregatedField::sum(direct("protocolIdentifier")).expect("sum");
        assert_eq!(field.data_type(), DataType::Unsigned64);

        let mut flow = Flow::new();
        flow.push(IANA_PEN, 4, [200]);
        let ctx = FlowContext::new(&flow);

        let mut slot = [0xAAu8; 8];
        field.init(&mut slot);
        assert!(field.aggregate(&ctx, &mut slot));
        assert!(field.aggregate(&ctx, &mut slot));
        assert_eq!(value::get_uint(DataType::Unsigned64, &slot), 400);
    }

    #[test]
    fn test_sum_signed_source() {
        let field = AggregatedField::sum(direct("mibObjectValueInteger")).expect("sum");
        assert_eq!(field.data_type(), DataType::Signed64);

        let mut flow = Flow::new();
        flow.push(IANA_PEN, 434, (-7i32).to_be_bytes());
        let ctx = FlowContext::new(&flow);
        let mut slot = [0u8; 8];
        field.init(&mut slot);
        field.aggregate(&ctx, &mut slot);
        field.aggregate(&ctx, &mut slot);
        assert_eq!(value::get_int(DataType::Signed64, &slot), -14);
    }

    #[test]
    fn test_sum_rejects_non_numeric() {
        let err = AggregatedField::sum(direct("sourceIPv4Address")).unwrap_err();
        assert!(matches!(err, ViewError::InvalidAggregate(_)));
    }

    #[test]
    fn test_min_max_init_and_fold() {
        let min = AggregatedField::min(direct("flowStartMilliseconds")).expect("min");
        let max = AggregatedField::max(direct("flowStartMilliseconds")).expect("max");

        let mut min_slot = [0u8; 8];
        let mut max_slot = [0u8; 8];
        min.init(&mut min_slot);
        max.init(&mut max_slot);
        assert_eq!(value::get_datetime(&min_slot), u64::MAX);
        assert_eq!(value::get_datetime(&max_slot), 0);

        for ts in [500u64, 100, 900] {
            let mut flow = Flow::new();
            flow.push(IANA_PEN, 152, ts.to_be_bytes());
            let ctx = FlowContext::new(&flow);
            assert!(min.aggregate(&ctx, &mut min_slot));
            assert!(max.aggregate(&ctx, &mut max_slot));
        }
        assert_eq!(value::get_datetime(&min_slot), 100);
        assert_eq!(value::get_datetime(&max_slot), 900);

        // Missing source leaves the slot alone.
        let empty = Flow::new();
        assert!(!min.aggregate(&FlowContext::new(&empty), &mut min_slot));
        assert_eq!(value::get_datetime(&min_slot), 100);
    }

    #[test]
    fn test_signed_max_init_is_type_min() {
        let max = AggregatedField::max(direct("mibObjectValueInteger")).expect("max");
        let mut slot = [0u8; 4];
        max.init(&mut slot);
        assert_eq!(value::get_int(DataType::Signed32, &slot), i64::from(i32::MIN));
    }

    #[test]
    fn test_merge_semantics() {
        let sum = AggregatedField::sum(direct("octetDeltaCount")).expect("sum");
        let mut a = 10u64.to_ne_bytes();
        sum.merge(&mut a, &5u64.to_ne_bytes());
        assert_eq!(u64::from_ne_bytes(a), 15);

        let min = AggregatedField::min(direct("octetDeltaCount")).expect("min");
        let mut a = 10u64.to_ne_bytes();
        min.merge(&mut a, &5u64.to_ne_bytes());
        assert_eq!(u64::from_ne_bytes(a), 5);

        let max = AggregatedField::max(direct("octetDeltaCount")).expect("max");
        let mut a = 10u64.to_ne_bytes();
        max.merge(&mut a, &5u64.to_ne_bytes());
        assert_eq!(u64::from_ne_bytes(a), 10);
    }

    #[test]
    fn test_inout_value_only_folds_its_direction() {
        let inner = AggregatedField::sum(direct("octetDeltaCount")).expect("sum");
        let field = Field::InOutValue(InOutValueField::new(inner, ViewDirection::In));
        assert_eq!(field.reducer(), Reducer::Sum);

        let mut flow = Flow::new();
        flow.push(IANA_PEN, 1, 100u64.to_be_bytes());
        let mut ctx = FlowContext::new(&flow);
        let mut slot = [0u8; 8];
        field.init(&mut slot);

        ctx.view_dir = ViewDirection::Out;
        assert!(field.aggregate(&ctx, &mut slot));
        assert_eq!(u64::from_ne_bytes(slot), 0);

        ctx.view_dir = ViewDirection::In;
        assert!(field.aggregate(&ctx, &mut slot));
        assert_eq!(u64::from_ne_bytes(slot), 100);
    }

    #[test]
    fn test_inout_key_resolves_by_view_direction() {
        let field = Field::InOutKey(
            InOutKeyField::new(direct("destinationIPv4Address"), direct("sourceIPv4Address"))
                .expect("inout"),
        );
        let mut flow = Flow::new();
        flow.push(IANA_PEN, 8, [1, 1, 1, 1]);
        flow.push(IANA_PEN, 12, [2, 2, 2, 2]);
        let mut ctx = FlowContext::new(&flow);

        assert!(load(&field, &ctx).is_none());
        ctx.view_dir = ViewDirection::In;
        assert_eq!(load(&field, &ctx), Some(vec![2, 2, 2, 2]));
        ctx.view_dir = ViewDirection::Out;
        assert_eq!(load(&field, &ctx), Some(vec![1, 1, 1, 1]));

        assert!(InOutKeyField::new(direct("sourceIPv4Address"), direct("sourceIPv6Address")).is_err());
    }

    #[test]
    fn test_reverse_direction_reads_reverse_counters() {
        let field = direct("octetDeltaCount");
        let mut flow = Flow::new_biflow();
        flow.push(IANA_PEN, 1, 10u64.to_be_bytes());
        flow.push(REVERSE_PEN, 1, 20u64.to_be_bytes());
        let mut ctx = FlowContext::new(&flow);
        ctx.flow_dir = FlowDirection::Reverse;
        let slot = load(&field, &ctx).expect("present");
        assert_eq!(value::get_uint(DataType::Unsigned64, &slot), 20);
    }

    #[test]
    fn test_equality_by_variant() {
        assert_eq!(direct("octetDeltaCount"), direct("octetDeltaCount"));
        assert_ne!(direct("octetDeltaCount"), direct("packetDeltaCount"));
        assert_eq!(Field::FlowCount, Field::FlowCount);
        assert_ne!(Field::FlowCount, Field::Direction);

        let sum = AggregatedField::sum(direct("octetDeltaCount")).expect("sum");
        let max = AggregatedField::max(direct("octetDeltaCount")).expect("max");
        assert_ne!(sum, max);
        assert_ne!(sum, direct("octetDeltaCount"));
    }
}

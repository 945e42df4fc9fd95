//! Compiled record layout.

use std::cmp::Ordering;

use super::field::{Field, FlowContext};
use super::value::Value;

/// A field placed at a fixed offset of the record buffer.
#[derive(Debug, Clone)]
pub struct ViewField {
    /// Name the field was requested by.
    pub name: String,
    pub offset: usize,
    pub field: Field,
}

impl ViewField {
    /// Slot size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.field.size()
    }

    /// This field's slot within `record`.
    #[inline]
    pub fn slot<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[self.offset..self.offset + self.size()]
    }

    #[inline]
    fn slot_mut<'a>(&self, record: &'a mut [u8]) -> &'a mut [u8] {
        let size = self.size();
        &mut record[self.offset..self.offset + size]
    }
}

/// Sort direction of an order field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// One component of the record ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderField {
    /// Index into [`View::fields`].
    pub index: usize,
    pub dir: OrderDirection,
}

/// Layout of an aggregation record: key fields from offset 0, value fields
/// right after them.
#[derive(Debug, Clone)]
pub struct View {
    fields: Vec<ViewField>,
    key_count: usize,
    key_size: usize,
    value_size: usize,
    order: Vec<OrderField>,
    output_limit: Option<usize>,
    has_inout_fields: bool,
}

impl View {
    /// Lays out `keys` followed by `values` contiguously.
    pub fn new(keys: Vec<(String, Field)>, values: Vec<(String, Field)>) -> Self {
        let key_count = keys.len();
        let has_inout_fields = values
            .iter()
            .any(|(_, f)| matches!(f, Field::InOutValue(_)));

        let mut fields = Vec::with_capacity(keys.len() + values.len());
        let mut offset = 0;
        for (name, field) in keys.into_iter().chain(values) {
            let size = field.size();
            fields.push(ViewField {
                name,
                offset,
                field,
            });
            offset += size;
        }

        let key_size = fields[..key_count].iter().map(ViewField::size).sum();

        Self {
            fields,
            key_count,
            key_size,
            value_size: offset - key_size,
            order: Vec::new(),
            output_limit: None,
            has_inout_fields,
        }
    }

    pub fn fields(&self) -> &[ViewField] {
        &self.fields
    }

    pub fn key_fields(&self) -> &[ViewField] {
        &self.fields[..self.key_count]
    }

    pub fn value_fields(&self) -> &[ViewField] {
        &self.fields[self.key_count..]
    }

    /// Index of the field requested by `name`.
    pub fn find_field(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn record_size(&self) -> usize {
        self.key_size + self.value_size
    }

    pub fn order(&self) -> &[OrderField] {
        &self.order
    }

    pub fn set_order(&mut self, order: Vec<OrderField>) {
        self.order = order;
    }

    pub fn output_limit(&self) -> Option<usize> {
        self.output_limit
    }

    pub fn set_output_limit(&mut self, limit: Option<usize>) {
        self.output_limit = limit;
    }

    /// True if records are folded once per in/out direction.
    pub fn has_inout_fields(&self) -> bool {
        self.has_inout_fields
    }

    // --- Record operations ---

    /// Builds the composite key of the current record into `key`.
    ///
    /// Returns false if any key field could not be loaded.
    #[inline]
    pub fn load_key(&self, ctx: &FlowContext<'_>, key: &mut [u8]) -> bool {
        self.key_fields()
            .iter()
            .all(|f| f.field.load(ctx, f.slot_mut(key)))
    }

    /// Initialises every value slot of a new record.
    pub fn init_values(&self, record: &mut [u8]) {
        for f in self.value_fields() {
            f.field.init(f.slot_mut(record));
        }
    }

    /// Folds the current flow record into the value slots.
    #[inline]
    pub fn aggregate_values(&self, ctx: &FlowContext<'_>, record: &mut [u8]) {
        for f in self.value_fields() {
            f.field.aggregate(ctx, f.slot_mut(record));
        }
    }

    /// Merges the value slots of `other` into `record`.
    pub fn merge_values(&self, record: &mut [u8], other: &[u8]) {
        for f in self.value_fields() {
            f.field.merge(f.slot_mut(record), f.slot(other));
        }
    }

    /// Orders two records by the order fields, then by raw key bytes.
    pub fn compare_records(&self, a: &[u8], b: &[u8]) -> Ordering {
        for o in &self.order {
            let f = &self.fields[o.index];
            let ord = f.field.compare(f.slot(a), f.slot(b));
            let ord = match o.dir {
                OrderDirection::Ascending => ord,
                OrderDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a[..self.key_size].cmp(&b[..self.key_size])
    }

    /// True if `a` sorts before `b`.
    #[inline]
    pub fn ordered_before(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare_records(a, b) == Ordering::Less
    }

    /// Decodes every field of a record for output.
    pub fn decode(&self, record: &[u8]) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| Value::decode(f.field.data_type(), f.slot(record)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::field::AggregatedField;

    fn sample_view() -> View {
        let packets = AggregatedField::sum(Field::FlowCount).expect("sum");
        View::new(
            vec![
                ("dir".into(), Field::Direction),
                ("flows".into(), Field::FlowCount),
            ],
            vec![("count".into(), packets)],
        )
    }

    #[test]
    fn test_offsets_are_contiguous() {
        let view = sample_view();
        let offsets: Vec<_> = view.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 1, 9]);
        assert_eq!(view.key_size(), 9);
        assert_eq!(view.value_size(), 8);
        assert_eq!(view.record_size(), 17);
        assert_eq!(view.key_fields().len(), 2);
        assert_eq!(view.value_fields().len(), 1);
        assert_eq!(view.find_field("count"), Some(2));
        assert!(!view.has_inout_fields());
    }

    #[test]
    fn test_compare_records_with_order_and_tiebreak() {
        let mut view = sample_view();
        let record = |dir: u8, count: u64| {
            let mut r = vec![dir];
            r.extend_from_slice(&1u64.to_ne_bytes());
            r.extend_from_slice(&count.to_ne_bytes());
            r
        };

        let a = record(1, 10);
        let b = record(2, 20);
        let c = record(1, 20);

        // Without order fields only the key decides.
        assert_eq!(view.compare_records(&a, &b), Ordering::Less);

        view.set_order(vec![OrderField {
            index: 2,
            dir: OrderDirection::Descending,
        }]);
        assert!(view.ordered_before(&b, &a));
        assert!(view.ordered_before(&c, &b));
        assert_eq!(view.compare_records(&c, &c), Ordering::Equal);

        view.set_order(vec![OrderField {
            index: 2,
            dir: OrderDirection::Ascending,
        }]);
        assert!(view.ordered_before(&a, &c));
    }
}

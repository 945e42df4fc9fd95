//! Flow record aggregation.
//!
//! A [`View`] compiled by [`ViewFactory`] describes the record layout; an
//! [`Aggregator`] folds flow records into a record table keyed by that
//! layout. [`ThreadedAggregator`] runs one aggregator per worker thread and
//! merges their results.

pub mod allocator;
pub mod channel;
pub mod error;
pub mod factory;
pub mod field;
pub mod hash_table;
pub mod threaded;
pub mod threshold;
pub mod value;
pub mod view;

use crate::ipfix::flow::{Direction, Flow, FlowDirection};

use self::allocator::AllocError;
use self::field::{FlowContext, ViewDirection};
use self::hash_table::{FastHashTable, RecordTable};

pub use self::error::ViewError;
pub use self::factory::ViewFactory;
pub use self::threaded::{AggregationOutput, AggregatorOptions, AggregatorState, ThreadedAggregator};
pub use self::view::View;

const HALVES: [(Direction, FlowDirection); 2] = [
    (Direction::FWD, FlowDirection::Forward),
    (Direction::REV, FlowDirection::Reverse),
];

/// Folds flow records into a table of aggregation records.
pub struct Aggregator<T: RecordTable = FastHashTable> {
    view: View,
    table: T,
    key_buffer: Vec<u8>,
}

impl Aggregator<FastHashTable> {
    /// Creates an aggregator backed by the SIMD table.
    pub fn new(view: View) -> Self {
        Self::with_table(view)
    }
}

impl<T: RecordTable> Aggregator<T> {
    /// Creates an aggregator backed by any record table.
    pub fn with_table(view: View) -> Self {
        let table = T::new(view.key_size(), view.record_size());
        let key_buffer = vec![0; view.key_size()];
        Self {
            view,
            table,
            key_buffer,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Folds every enabled half of `flow` into the table.
    ///
    /// A half whose key cannot be built is skipped; value fields missing from
    /// the record leave their slots untouched.
    pub fn process_record(&mut self, flow: &Flow) -> Result<(), AllocError> {
        let view_dirs: &[ViewDirection] = if self.view.has_inout_fields() {
            &[ViewDirection::In, ViewDirection::Out]
        } else {
            &[ViewDirection::None]
        };
        let record_size = self.view.record_size();

        for (half, flow_dir) in HALVES {
            if !flow.dir.contains(half) {
                continue;
            }
            for &view_dir in view_dirs {
                let ctx = FlowContext {
                    flow,
                    flow_dir,
                    view_dir,
                };
                if !self.view.load_key(&ctx, &mut self.key_buffer) {
                    continue;
                }

                let (rec, found) = self.table.find_or_create(&self.key_buffer)?;
                // SAFETY: the record belongs to our table and nothing else
                // references it during this call.
                let record = unsafe { rec.as_mut_slice(record_size) };
                if !found {
                    self.view.init_values(record);
                }
                self.view.aggregate_values(&ctx, record);
            }
        }
        Ok(())
    }

    /// Merges one record built with the same view into the table.
    ///
    /// Returns true if the key already existed.
    pub fn merge_record(&mut self, record: &[u8]) -> Result<bool, AllocError> {
        let key_size = self.view.key_size();
        let record_size = self.view.record_size();

        let (rec, found) = self.table.find_or_create(&record[..key_size])?;
        // SAFETY: as in `process_record`; `record` comes from another table.
        let dst = unsafe { rec.as_mut_slice(record_size) };
        if found {
            self.view.merge_values(dst, record);
        } else {
            dst[key_size..].copy_from_slice(&record[key_size..record_size]);
        }
        Ok(found)
    }

    /// Merges every record of `other`, which must share this view's layout.
    pub fn merge<U: RecordTable>(&mut self, other: &Aggregator<U>) -> Result<(), AllocError> {
        for record in other.records() {
            self.merge_record(record)?;
        }
        Ok(())
    }

    /// Sorts the records by the view's order. No-op without order fields.
    pub fn sort_items(&mut self) {
        if self.view.order().is_empty() {
            return;
        }
        let view = &self.view;
        let record_size = view.record_size();
        // SAFETY: shared reads of records owned by our table.
        self.table.items_mut().sort_unstable_by(|a, b| unsafe {
            view.compare_records(a.as_slice(record_size), b.as_slice(record_size))
        });
    }

    /// Records in table order.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        let record_size = self.view.record_size();
        // SAFETY: records live as long as `self`.
        self.table
            .items()
            .iter()
            .map(move |rec| unsafe { rec.as_slice(record_size) })
    }

    /// Record at position `index` in table order.
    pub fn record(&self, index: usize) -> Option<&[u8]> {
        let rec = self.table.items().get(index)?;
        // SAFETY: see `records`.
        Some(unsafe { rec.as_slice(self.view.record_size()) })
    }

    /// Looks up the record for `key`.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        let rec = self.table.find(key)?;
        // SAFETY: see `records`.
        Some(unsafe { rec.as_slice(self.view.record_size()) })
    }
}

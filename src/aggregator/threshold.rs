//! Top-K merge of per-thread tables without merging every row.
//!
//! Rows are consumed one depth at a time across all tables. Each newly seen
//! key is completed right away by looking it up in every other table, so a
//! candidate's values are final once it enters the heap. After each depth
//! the best value any unseen key could still reach is bounded from the rows
//! at the current depth; once the K-th best candidate beats that bound on the
//! first order field, no unseen key can enter the top K.
//!
//! Every input table must be sorted by the view's order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::debug;

use super::allocator::AllocError;
use super::field::Reducer;
use super::hash_table::{FastHashTable, RecordPtr, RecordTable};
use super::value::{self, MAX_VALUE_SIZE};
use super::view::{OrderDirection, View};
use super::Aggregator;

/// A result record ordered by the view; the greatest is the worst.
struct Candidate {
    rec: RecordPtr,
    view: Arc<View>,
}

impl Candidate {
    fn record(&self) -> &[u8] {
        // SAFETY: candidates point into the result table, which outlives the
        // heap and never moves its records.
        unsafe { self.rec.as_slice(self.view.record_size()) }
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.view.compare_records(self.record(), other.record())
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Incremental top-K merge over sorted tables.
pub struct ThresholdAlgorithm<'a, T: RecordTable = FastHashTable> {
    tables: &'a [Aggregator<T>],
    view: Arc<View>,
    result: Aggregator,
    heap: BinaryHeap<Candidate>,
    k: usize,
    row: usize,
    max_row: usize,
}

impl<'a, T: RecordTable> ThresholdAlgorithm<'a, T> {
    /// Prepares a merge keeping the best `k` records; `k == 0` keeps all.
    pub fn new(tables: &'a [Aggregator<T>], view: &View, k: usize) -> Self {
        let max_row = tables.iter().map(Aggregator::len).max().unwrap_or(0);
        Self {
            tables,
            view: Arc::new(view.clone()),
            result: Aggregator::new(view.clone()),
            heap: BinaryHeap::new(),
            k: if k == 0 { usize::MAX } else { k },
            row: 0,
            max_row,
        }
    }

    /// Stops after `max_row` rows of each table even if the top K is not
    /// proven yet.
    pub fn set_max_row(&mut self, max_row: usize) {
        self.max_row = self.max_row.min(max_row);
    }

    /// Number of rows consumed from each table so far.
    pub fn rows_processed(&self) -> usize {
        self.row
    }

    /// True once every table is consumed up to the row limit.
    pub fn out_of_items(&self) -> bool {
        self.row >= self.max_row
    }

    /// Consumes the next row of every table.
    pub fn process_row(&mut self) -> Result<(), AllocError> {
        let row = self.row;
        self.row += 1;

        let key_size = self.view.key_size();
        let record_size = self.view.record_size();

        for (source, table) in self.tables.iter().enumerate() {
            let Some(record) = table.record(row) else {
                continue;
            };
            let key = &record[..key_size];
            if self.result.find(key).is_some() {
                continue;
            }

            let (rec, _) = self.result.table.find_or_create(key)?;
            // SAFETY: fresh record of our result table, not referenced
            // elsewhere until it is pushed to the heap below.
            let dst = unsafe { rec.as_mut_slice(record_size) };
            dst[key_size..].copy_from_slice(&record[key_size..record_size]);
            for (other_index, other) in self.tables.iter().enumerate() {
                if other_index == source {
                    continue;
                }
                if let Some(other_record) = other.find(key) {
                    self.view.merge_values(dst, other_record);
                }
            }

            self.heap.push(Candidate {
                rec,
                view: Arc::clone(&self.view),
            });
            if self.heap.len() > self.k {
                self.heap.pop();
            }
        }
        Ok(())
    }

    /// True if no key unseen so far can enter the top K.
    pub fn check_finish_condition(&self) -> bool {
        if self.out_of_items() {
            return true;
        }
        if self.heap.len() < self.k {
            return false;
        }
        let Some(order) = self.view.order().first() else {
            return false;
        };
        let Some(worst) = self.heap.peek() else {
            return false;
        };

        let vf = &self.view.fields()[order.index];
        let worst_slot = vf.slot(worst.record());
        let rows = self.tables.iter().filter_map(|t| t.record(self.row));

        let ord = if vf.field.reducer() == Reducer::Sum {
            let data_type = vf.field.data_type();
            let read = |slot: &[u8]| -> i128 {
                if data_type.is_signed() {
                    i128::from(value::get_int(data_type, slot))
                } else {
                    i128::from(value::get_uint(data_type, slot))
                }
            };

            let values: Vec<i128> = rows.map(|r| read(vf.slot(r))).collect();
            let bound = match order.dir {
                OrderDirection::Descending => {
                    let positive: i128 = values.iter().map(|&v| v.max(0)).sum();
                    positive + values.iter().map(|&v| v.min(0)).max().unwrap_or(0)
                }
                OrderDirection::Ascending => {
                    let negative: i128 = values.iter().map(|&v| v.min(0)).sum();
                    negative + values.iter().map(|&v| v.max(0)).min().unwrap_or(0)
                }
            };
            read(worst_slot).cmp(&bound)
        } else {
            let mut bound = [0u8; MAX_VALUE_SIZE];
            let mut have_bound = false;
            for r in rows {
                let slot = vf.slot(r);
                let better = match vf.field.compare(slot, &bound[..slot.len()]) {
                    Ordering::Greater => order.dir == OrderDirection::Descending,
                    Ordering::Less => order.dir == OrderDirection::Ascending,
                    Ordering::Equal => false,
                };
                if !have_bound || better {
                    bound[..slot.len()].copy_from_slice(slot);
                    have_bound = true;
                }
            }
            if !have_bound {
                return true;
            }
            vf.field.compare(worst_slot, &bound[..worst_slot.len()])
        };

        match order.dir {
            OrderDirection::Descending => ord == Ordering::Greater,
            OrderDirection::Ascending => ord == Ordering::Less,
        }
    }

    /// Runs the merge to completion and returns the top records, sorted.
    pub fn run(mut self) -> Result<Aggregator, AllocError> {
        while !self.out_of_items() {
            self.process_row()?;
            if self.check_finish_condition() {
                break;
            }
        }
        debug!(
            rows = self.row,
            seen = self.result.len(),
            kept = self.heap.len(),
            "threshold merge finished"
        );
        self.finish()
    }

    fn finish(self) -> Result<Aggregator, AllocError> {
        let mut out = Aggregator::new(View::clone(&self.view));
        for candidate in self.heap.into_sorted_vec() {
            out.merge_record(candidate.record())?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ViewFactory;
    use crate::ipfix::element::{Registry, IANA_PEN};
    use crate::ipfix::flow::Flow;

    fn view(order: &str) -> View {
        let registry = Registry::builtin();
        ViewFactory::new(&registry)
            .create_view("sourceTransportPort", "bytes, max(flowEndMilliseconds)", order)
            .expect("view")
    }

    fn shard(view: &View, rows: &[(u16, u64, u64)]) -> Aggregator {
        let mut agg = Aggregator::new(view.clone());
        for &(port, bytes, end) in rows {
            let mut f = Flow::new();
            f.push(IANA_PEN, 7, port.to_be_bytes());
            f.push(IANA_PEN, 1, bytes.to_be_bytes());
            f.push(IANA_PEN, 153, end.to_be_bytes());
            agg.process_record(&f).expect("process");
        }
        agg.sort_items();
        agg
    }

    fn ports(agg: &Aggregator) -> Vec<u16> {
        agg.records()
            .map(|r| u16::from_ne_bytes([r[0], r[1]]))
            .collect()
    }

    fn full_merge(view: &View, shards: &[Aggregator]) -> Aggregator {
        let mut all = Aggregator::new(view.clone());
        for s in shards {
            all.merge(s).expect("merge");
        }
        all.sort_items();
        all
    }

    fn sample_shards(view: &View) -> Vec<Aggregator> {
        vec![
            shard(view, &[(1, 100, 5), (2, 90, 1), (3, 10, 9), (4, 5, 2)]),
            shard(view, &[(2, 50, 3), (5, 80, 4), (1, 1, 7), (6, 2, 8)]),
            shard(view, &[(7, 60, 6), (3, 95, 2)]),
        ]
    }

    #[test]
    fn test_matches_full_merge_for_all_k() {
        let view = view("bytes");
        let shards = sample_shards(&view);
        let full = ports(&full_merge(&view, &shards));
        assert_eq!(full, vec![2, 3, 1, 5, 7, 4, 6]);

        for k in 1..=full.len() + 1 {
            let top = ThresholdAlgorithm::new(&shards, &view, k).run().expect("run");
            let expect: Vec<u16> = full.iter().copied().take(k).collect();
            assert_eq!(ports(&top), expect, "k = {k}");
        }

        let all = ThresholdAlgorithm::new(&shards, &view, 0).run().expect("run");
        assert_eq!(ports(&all), full);
    }

    #[test]
    fn test_ascending_and_extremum_order() {
        for order in ["bytes/asc", "max(flowEndMilliseconds)", "max(flowEndMilliseconds)/asc"] {
            let view = view(order);
            let shards = sample_shards(&view);
            let full = ports(&full_merge(&view, &shards));
            for k in [1, 3, full.len()] {
                let top = ThresholdAlgorithm::new(&shards, &view, k).run().expect("run");
                let expect: Vec<u16> = full.iter().copied().take(k).collect();
                assert_eq!(ports(&top), expect, "order {order}, k = {k}");
            }
        }
    }

    #[test]
    fn test_stops_early_on_skewed_input() {
        let view = view("bytes");
        let big: Vec<(u16, u64, u64)> = (0..100u16).map(|p| (p, 1_000 - u64::from(p), 0)).collect();
        let small: Vec<(u16, u64, u64)> = (100..200u16).map(|p| (p, 1, 0)).collect();
        let shards = vec![shard(&view, &big), shard(&view, &small)];

        let mut algo = ThresholdAlgorithm::new(&shards, &view, 3);
        while !algo.out_of_items() {
            algo.process_row().expect("row");
            if algo.check_finish_condition() {
                break;
            }
        }
        assert!(algo.rows_processed() < 10, "read {} rows", algo.rows_processed());

        let top = algo.run().expect("run");
        assert_eq!(ports(&top), vec![0, 1, 2]);
    }

    #[test]
    fn test_max_row_bounds_exploration() {
        let view = view("bytes");
        let shards = sample_shards(&view);
        let mut algo = ThresholdAlgorithm::new(&shards, &view, 0);
        algo.set_max_row(1);
        let top = algo.run().expect("run");
        assert_eq!(top.len(), 3);
    }
}

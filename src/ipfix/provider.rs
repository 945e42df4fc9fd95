//! Flow record provider.
//!
//! Walks a queue of flow files and hands out records one at a time, applying
//! the record filter and biflow auto-ignore before the aggregator sees them.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::element::{Registry, IANA_PEN};
use super::flow::{Direction, FieldView, Flow, FlowDirection};
use super::reader::{count_records, FlowReader, ReadError};

const OCTET_DELTA_COUNT: u16 = 1;
const PACKET_DELTA_COUNT: u16 = 2;

/// Pluggable per-record predicate, evaluated once per record half.
#[derive(Clone)]
pub struct FlowFilter(Arc<dyn Fn(&Flow, FlowDirection) -> bool + Send + Sync>);

impl FlowFilter {
    /// Wraps an arbitrary predicate.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Flow, FlowDirection) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Matches record halves whose element equals `value` as an unsigned integer.
    pub fn uint_equals(pen: u32, id: u16, value: u64) -> Self {
        Self::new(move |flow, dir| {
            flow.find(pen, id, dir)
                .and_then(|f| FieldView::new(&f.data).as_uint())
                == Some(value)
        })
    }

    /// Evaluates the predicate.
    pub fn matches(&self, flow: &Flow, dir: FlowDirection) -> bool {
        (self.0)(flow, dir)
    }
}

impl fmt::Debug for FlowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlowFilter(..)")
    }
}

/// Sequential reader over a queue of flow files.
pub struct FlowProvider<'r> {
    registry: &'r Registry,
    remains: VecDeque<PathBuf>,
    reader: Option<FlowReader<'r>>,
    flow: Flow,
    filter: Option<FlowFilter>,
    biflow_autoignore: bool,
    processed_flows: u64,
    total_flows: u64,
}

impl<'r> FlowProvider<'r> {
    /// Creates a provider with an empty file queue.
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            remains: VecDeque::new(),
            reader: None,
            flow: Flow::new(),
            filter: None,
            biflow_autoignore: false,
            processed_flows: 0,
            total_flows: 0,
        }
    }

    /// Queues a file and adds its record count to the total.
    ///
    /// A file that cannot be counted is still queued; it contributes nothing
    /// to the total and is reported again when it is opened.
    pub fn add_file(&mut self, path: &Path) {
        match count_records(path) {
            Ok(count) => self.total_flows += count,
            Err(e) => warn!(path = %path.display(), error = %e, "cannot count flow records"),
        }
        self.remains.push_back(path.to_path_buf());
    }

    /// Queues a file without counting its records.
    pub fn queue_file(&mut self, path: &Path) {
        self.remains.push_back(path.to_path_buf());
    }

    /// Installs a record filter.
    pub fn set_filter(&mut self, filter: FlowFilter) {
        self.filter = Some(filter);
    }

    /// Enables dropping biflow halves that carry no octets and no packets.
    pub fn set_biflow_autoignore(&mut self, enable: bool) {
        self.biflow_autoignore = enable;
    }

    /// Number of records read so far, including filtered ones.
    pub fn processed_flows(&self) -> u64 {
        self.processed_flows
    }

    /// Sum of the record counts of all files added with [`add_file`](Self::add_file).
    pub fn total_flows(&self) -> u64 {
        self.total_flows
    }

    /// Number of queued files not opened yet.
    pub fn remaining_files(&self) -> usize {
        self.remains.len()
    }

    /// Returns the next record that passed filtering, or `None` once every
    /// queued file is exhausted.
    pub fn next_record(&mut self) -> Result<Option<&Flow>, ReadError> {
        loop {
            if self.reader.is_none() && !self.prepare_next_file() {
                return Ok(None);
            }

            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            if !reader.next_flow(&mut self.flow)? {
                debug!(path = %reader.path().display(), "flow file exhausted");
                self.reader = None;
                continue;
            }
            self.processed_flows += 1;

            let dir = self.filter_record();
            if dir.is_empty() {
                continue;
            }
            self.flow.dir = dir;
            return Ok(Some(&self.flow));
        }
    }

    fn prepare_next_file(&mut self) -> bool {
        while let Some(path) = self.remains.pop_front() {
            match FlowReader::open(&path, self.registry) {
                Ok(reader) => {
                    debug!(path = %path.display(), "opened flow file");
                    self.reader = Some(reader);
                    return true;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping flow file"),
            }
        }
        false
    }

    fn filter_record(&self) -> Direction {
        let flow = &self.flow;
        let mut dir = if flow.biflow {
            Direction::BOTH
        } else {
            Direction::FWD
        };

        if let Some(filter) = &self.filter {
            if !filter.matches(flow, FlowDirection::Forward) {
                dir.remove(Direction::FWD);
            }
            if flow.biflow && !filter.matches(flow, FlowDirection::Reverse) {
                dir.remove(Direction::REV);
            }
        }

        if self.biflow_autoignore && flow.biflow {
            if direction_is_empty(flow, FlowDirection::Forward) {
                dir.remove(Direction::FWD);
            }
            if direction_is_empty(flow, FlowDirection::Reverse) {
                dir.remove(Direction::REV);
            }
        }

        dir
    }
}

fn field_has_only_zero_value(flow: &Flow, id: u16, dir: FlowDirection) -> bool {
    let mut found = false;
    for field in flow.find_all(IANA_PEN, id, dir) {
        found = true;
        if FieldView::new(&field.data).as_uint() != Some(0) {
            return false;
        }
    }
    found
}

fn direction_is_empty(flow: &Flow, dir: FlowDirection) -> bool {
    field_has_only_zero_value(flow, OCTET_DELTA_COUNT, dir)
        && field_has_only_zero_value(flow, PACKET_DELTA_COUNT, dir)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
        file
    }

    #[test]
    fn test_reads_files_in_order_and_counts() {
        let registry = Registry::builtin();
        let a = write_lines(&[
            r#"{"fields": {"protocolIdentifier": 6}}"#,
            r#"{"fields": {"protocolIdentifier": 17}}"#,
        ]);
        let b = write_lines(&[r#"{"fields": {"protocolIdentifier": 1}}"#]);

        let mut provider = FlowProvider::new(&registry);
        provider.add_file(a.path());
        provider.add_file(b.path());
        assert_eq!(provider.total_flows(), 3);

        let mut protos = Vec::new();
        while let Some(flow) = provider.next_record().expect("read") {
            let proto = flow.find(0, 4, FlowDirection::Forward).expect("proto");
            protos.push(proto.data[0]);
        }
        assert_eq!(protos, vec![6, 17, 1]);
        assert_eq!(provider.processed_flows(), 3);
        assert_eq!(provider.remaining_files(), 0);
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let registry = Registry::builtin();
        let a = write_lines(&[r#"{"fields": {"protocolIdentifier": 6}}"#]);

        let mut provider = FlowProvider::new(&registry);
        provider.add_file(Path::new("/nonexistent/flows.jsonl"));
        provider.add_file(a.path());
        assert_eq!(provider.total_flows(), 1);

        assert!(provider.next_record().expect("read").is_some());
        assert!(provider.next_record().expect("read").is_none());
    }

    #[test]
    fn test_filter_drops_record_halves() {
        let registry = Registry::builtin();
        let a = write_lines(&[
            r#"{"fields": {"protocolIdentifier": 6}}"#,
            r#"{"fields": {"protocolIdentifier": 17}}"#,
            r#"{"biflow": true, "fields": {"sourceTransportPort": 53, "destinationTransportPort": 4000}}"#,
        ]);

        let mut provider = FlowProvider::new(&registry);
        provider.queue_file(a.path());
        provider.set_filter(FlowFilter::new(|flow, dir| {
            let proto = flow.find(0, 4, dir).map(|f| f.data[0]);
            let port = flow
                .find(0, 7, dir)
                .and_then(|f| FieldView::new(&f.data).as_uint());
            proto == Some(17) || port == Some(53)
        }));

        let first = provider.next_record().expect("read").expect("udp record");
        assert_eq!(first.dir, Direction::FWD);

        let second = provider.next_record().expect("read").expect("biflow record");
        // Source port 53 only holds for the forward half.
        assert_eq!(second.dir, Direction::FWD);

        assert!(provider.next_record().expect("read").is_none());
        assert_eq!(provider.processed_flows(), 3);
        assert_eq!(provider.total_flows(), 0);
    }

    #[test]
    fn test_biflow_autoignore() {
        let registry = Registry::builtin();
        let a = write_lines(&[
            r#"{"biflow": true, "fields": {"octetDeltaCount": 100, "packetDeltaCount": 1, "reverseOctetDeltaCount": 0, "reversePacketDeltaCount": 0}}"#,
            r#"{"biflow": true, "fields": {"octetDeltaCount": 0, "packetDeltaCount": 0, "reverseOctetDeltaCount": 0, "reversePacketDeltaCount": 0}}"#,
            r#"{"biflow": true, "fields": {"octetDeltaCount": 0, "packetDeltaCount": 0}}"#,
        ]);

        let mut provider = FlowProvider::new(&registry);
        provider.queue_file(a.path());
        provider.set_biflow_autoignore(true);

        let first = provider.next_record().expect("read").expect("first");
        assert_eq!(first.dir, Direction::FWD);

        // Second record is empty in both directions and skipped. Third has no
        // reverse counters at all, so the reverse half is kept.
        let third = provider.next_record().expect("read").expect("third");
        assert_eq!(third.dir, Direction::REV);

        assert!(provider.next_record().expect("read").is_none());
    }

    #[test]
    fn test_uint_equals_filter() {
        let mut flow = Flow::new();
        flow.push(0, 4, [17]);
        let udp = FlowFilter::uint_equals(0, 4, 17);
        let tcp = FlowFilter::uint_equals(0, 4, 6);
        assert!(udp.matches(&flow, FlowDirection::Forward));
        assert!(!tcp.matches(&flow, FlowDirection::Forward));
    }
}

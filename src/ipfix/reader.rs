//! JSON-lines flow file reader.
//!
//! Each non-empty line holds one record:
//!
//! ```text
//! {"biflow": true, "fields": {"sourceIPv4Address": "10.0.0.1", "octetDeltaCount": 100}}
//! ```
//!
//! Field keys are element names or `"<pen>:<id>"` references. Values are
//! converted to their raw IPFIX encoding using the element's data type, so
//! downstream code only ever sees wire-shaped records.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::element::{Element, ElementType, Registry};
use super::flow::{encode_ntp, Direction, Flow, FlowField};

/// Errors that can occur while reading a flow file.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("opening {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("reading line {line}: {source}")]
    Io { line: usize, source: io::Error },

    #[error("line {line}: invalid record: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },

    #[error("line {line}: unknown element \"{name}\"")]
    UnknownElement { line: usize, name: String },

    #[error("line {line}: invalid value for \"{name}\": {value}")]
    InvalidValue {
        line: usize,
        name: String,
        value: String,
    },
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    biflow: bool,
    fields: serde_json::Map<String, JsonValue>,
}

/// Streams flow records out of a single JSON-lines file.
pub struct FlowReader<'r> {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
    registry: &'r Registry,
}

impl<'r> FlowReader<'r> {
    /// Opens a flow file for reading.
    pub fn open(path: &Path, registry: &'r Registry) -> Result<Self, ReadError> {
        let file = File::open(path).map_err(|source| ReadError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line: 0,
            registry,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the next record into `flow`. Returns false at end of file.
    pub fn next_flow(&mut self, flow: &mut Flow) -> Result<bool, ReadError> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(false);
            };
            self.line += 1;
            let line_no = self.line;

            let line = line.map_err(|source| ReadError::Io {
                line: line_no,
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let raw: RawRecord = serde_json::from_str(&line).map_err(|source| ReadError::Json {
                line: line_no,
                source,
            })?;

            flow.fields.clear();
            flow.biflow = raw.biflow;
            flow.dir = if raw.biflow {
                Direction::BOTH
            } else {
                Direction::FWD
            };

            for (name, value) in &raw.fields {
                let elem = self
                    .registry
                    .find_name(name)
                    .or_else(|| self.registry.find_ref(name))
                    .ok_or_else(|| ReadError::UnknownElement {
                        line: line_no,
                        name: name.clone(),
                    })?;

                let data = encode_value(elem, value).ok_or_else(|| ReadError::InvalidValue {
                    line: line_no,
                    name: name.clone(),
                    value: value.to_string(),
                })?;

                flow.fields.push(FlowField {
                    pen: elem.pen,
                    id: elem.id,
                    data,
                });
            }

            return Ok(true);
        }
    }
}

/// Counts the records in a flow file without decoding them.
pub fn count_records(path: &Path) -> Result<u64, ReadError> {
    let file = File::open(path).map_err(|source| ReadError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut count = 0u64;
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| ReadError::Io {
            line: i + 1,
            source,
        })?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Value encoding
// ---------------------------------------------------------------------------

fn encode_value(elem: &Element, value: &JsonValue) -> Option<Vec<u8>> {
    use ElementType::*;

    match elem.data_type {
        Unsigned8 => encode_uint(value, 1),
        Unsigned16 => encode_uint(value, 2),
        Unsigned32 => encode_uint(value, 4),
        Unsigned64 => encode_uint(value, 8),
        Signed8 => encode_int(value, 1),
        Signed16 => encode_int(value, 2),
        Signed32 => encode_int(value, 4),
        Signed64 => encode_int(value, 8),
        Float64 => value.as_f64().map(|v| v.to_be_bytes().to_vec()),
        Boolean => value.as_bool().map(|v| vec![if v { 1 } else { 2 }]),
        Ipv4Address => value
            .as_str()?
            .parse::<Ipv4Addr>()
            .ok()
            .map(|addr| addr.octets().to_vec()),
        Ipv6Address => value
            .as_str()?
            .parse::<Ipv6Addr>()
            .ok()
            .map(|addr| addr.octets().to_vec()),
        MacAddress => parse_mac(value.as_str()?).map(|mac| mac.to_vec()),
        String => value.as_str().map(|s| s.as_bytes().to_vec()),
        OctetArray => parse_hex(value.as_str()?),
        DateTimeSeconds => {
            let secs = u32::try_from(value.as_u64()?).ok()?;
            Some(secs.to_be_bytes().to_vec())
        }
        DateTimeMilliseconds => value.as_u64().map(|ms| ms.to_be_bytes().to_vec()),
        DateTimeMicroseconds => {
            let us = value.as_u64()?;
            Some(encode_ntp(us / 1_000_000, us % 1_000_000, 1_000_000).to_be_bytes().to_vec())
        }
        DateTimeNanoseconds => {
            let ns = value.as_u64()?;
            Some(
                encode_ntp(ns / 1_000_000_000, ns % 1_000_000_000, 1_000_000_000)
                    .to_be_bytes()
                    .to_vec(),
            )
        }
    }
}

fn encode_uint(value: &JsonValue, width: usize) -> Option<Vec<u8>> {
    let v = value.as_u64()?;
    if width < 8 && v >> (8 * width) != 0 {
        return None;
    }
    Some(v.to_be_bytes()[8 - width..].to_vec())
}

fn encode_int(value: &JsonValue, width: usize) -> Option<Vec<u8>> {
    let v = value.as_i64()?;
    if width < 8 {
        let bits = 8 * width as u32;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if v < min || v > max {
            return None;
        }
    }
    Some(v.to_be_bytes()[8 - width..].to_vec())
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split([':', '-']);
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    hex::decode(digits).ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::ipfix::element::REVERSE_PEN;
    use crate::ipfix::flow::{FieldView, FlowDirection};

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
        file
    }

    #[test]
    fn test_read_uniflow_record() {
        let registry = Registry::builtin();
        let file = write_lines(&[
            r#"{"fields": {"sourceIPv4Address": "10.0.0.1", "protocolIdentifier": 6, "octetDeltaCount": 1500}}"#,
        ]);

        let mut reader = FlowReader::open(file.path(), &registry).expect("open");
        let mut flow = Flow::new();
        assert!(reader.next_flow(&mut flow).expect("read"));
        assert!(!flow.biflow);
        assert_eq!(flow.dir, Direction::FWD);

        let src = flow.find(0, 8, FlowDirection::Forward).expect("src");
        assert_eq!(src.data, vec![10, 0, 0, 1]);
        let proto = flow.find(0, 4, FlowDirection::Forward).expect("proto");
        assert_eq!(proto.data, vec![6]);
        let bytes = flow.find(0, 1, FlowDirection::Forward).expect("bytes");
        assert_eq!(FieldView::new(&bytes.data).as_uint(), Some(1500));

        assert!(!reader.next_flow(&mut flow).expect("eof"));
    }

    #[test]
    fn test_read_biflow_and_references() {
        let registry = Registry::builtin();
        let file = write_lines(&[
            "",
            r#"{"biflow": true, "fields": {"0:1": 10, "reverseOctetDeltaCount": 20, "sourceMacAddress": "aa:bb:cc:dd:ee:ff"}}"#,
        ]);

        let mut reader = FlowReader::open(file.path(), &registry).expect("open");
        let mut flow = Flow::new();
        assert!(reader.next_flow(&mut flow).expect("read"));
        assert!(flow.biflow);
        assert_eq!(flow.dir, Direction::BOTH);

        let rev = flow.find(0, 1, FlowDirection::Reverse).expect("rev");
        assert_eq!(rev.pen, REVERSE_PEN);
        assert_eq!(FieldView::new(&rev.data).as_uint(), Some(20));

        let mac = flow.find(0, 56, FlowDirection::Forward).expect("mac");
        assert_eq!(mac.data, vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_read_errors_carry_line_numbers() {
        let registry = Registry::builtin();
        let file = write_lines(&[
            r#"{"fields": {"protocolIdentifier": 6}}"#,
            r#"{"fields": {"protocolIdentifier": 300}}"#,
            r#"{"fields": {"bogusElement": 1}}"#,
            "not json",
        ]);

        let mut reader = FlowReader::open(file.path(), &registry).expect("open");
        let mut flow = Flow::new();
        assert!(reader.next_flow(&mut flow).expect("first ok"));

        let err = reader.next_flow(&mut flow).unwrap_err();
        assert!(matches!(err, ReadError::InvalidValue { line: 2, .. }), "{err}");

        let err = reader.next_flow(&mut flow).unwrap_err();
        assert!(matches!(err, ReadError::UnknownElement { line: 3, .. }), "{err}");

        let err = reader.next_flow(&mut flow).unwrap_err();
        assert!(matches!(err, ReadError::Json { line: 4, .. }), "{err}");
    }

    #[test]
    fn test_count_records_skips_blank_lines() {
        let file = write_lines(&[r#"{"fields": {}}"#, "", r#"{"fields": {}}"#, "  "]);
        assert_eq!(count_records(file.path()).expect("count"), 2);
    }

    #[test]
    fn test_open_missing_file() {
        let registry = Registry::builtin();
        let err = FlowReader::open(Path::new("/nonexistent/flows.jsonl"), &registry)
            .err()
            .expect("must fail");
        assert!(matches!(err, ReadError::Open { .. }));
    }

    #[test]
    fn test_encode_helpers() {
        assert_eq!(parse_hex("0x0aff"), Some(vec![0x0a, 0xff]));
        assert_eq!(parse_hex("0x0af"), None);
        assert_eq!(parse_hex("0aff"), None);
        assert_eq!(parse_mac("01-02-03-04-05-06"), Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(parse_mac("01:02:03"), None);
        assert_eq!(encode_int(&JsonValue::from(-1), 2), Some(vec![0xff, 0xff]));
        assert_eq!(encode_int(&JsonValue::from(200), 1), None);
        assert_eq!(encode_uint(&JsonValue::from(256), 1), None);
    }
}

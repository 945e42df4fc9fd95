//! Output rendering of aggregation records.

use std::io::{self, Write};

use serde_json::{Map, Number, Value as JsonValue};

use crate::aggregator::field::{Field, FWD_VALUE, REV_VALUE};
use crate::aggregator::value::Value;
use crate::aggregator::{AggregationOutput, View};
use crate::config::OutputFormat;
use crate::ipfix::element::IANA_PEN;

const PROTOCOL_IDENTIFIER: u16 = 4;

/// Renders a sequence of records built with one view.
pub trait Printer {
    fn print_prologue(&mut self, view: &View) -> io::Result<()>;
    fn print_record(&mut self, view: &View, record: &[u8]) -> io::Result<()>;
    fn print_epilogue(&mut self, view: &View) -> io::Result<()>;
}

/// Creates the printer for `format` writing to `out`.
pub fn create_printer<W: Write + 'static>(format: OutputFormat, out: W) -> Box<dyn Printer> {
    match format {
        OutputFormat::Table => Box::new(TablePrinter::new(out)),
        OutputFormat::Json => Box::new(JsonPrinter::new(out)),
    }
}

/// Prints a finished run: the merged records, or every per-thread table one
/// after another.
pub fn print_output(printer: &mut dyn Printer, output: &AggregationOutput) -> io::Result<()> {
    let view = output.view();
    if output.is_merged() {
        printer.print_prologue(view)?;
        for record in output.records() {
            printer.print_record(view, record)?;
        }
        return printer.print_epilogue(view);
    }

    for table in output.tables() {
        printer.print_prologue(view)?;
        for record in table.records().take(output.limit()) {
            printer.print_record(view, record)?;
        }
        printer.print_epilogue(view)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Aligned text columns. Rows are buffered until the epilogue so every
/// column can be sized to its widest cell.
pub struct TablePrinter<W: Write> {
    out: W,
    header: Vec<String>,
    right_aligned: Vec<bool>,
    rows: Vec<Vec<String>>,
}

impl<W: Write> TablePrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header: Vec::new(),
            right_aligned: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Consumes the printer and returns the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Printer for TablePrinter<W> {
    fn print_prologue(&mut self, view: &View) -> io::Result<()> {
        self.header = view.fields().iter().map(|f| f.name.clone()).collect();
        self.right_aligned = view
            .fields()
            .iter()
            .map(|f| {
                f.field.data_type().is_number()
                    && !is_protocol(&f.field)
                    && !matches!(f.field, Field::Direction)
            })
            .collect();
        self.rows.clear();
        Ok(())
    }

    fn print_record(&mut self, view: &View, record: &[u8]) -> io::Result<()> {
        let row = view
            .fields()
            .iter()
            .zip(view.decode(record))
            .map(|(vf, value)| format_cell(&vf.field, &value))
            .collect();
        self.rows.push(row);
        Ok(())
    }

    fn print_epilogue(&mut self, _view: &View) -> io::Result<()> {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.chars().count());
            }
        }

        write_row(&mut self.out, &self.header, &widths, &self.right_aligned)?;
        for row in &self.rows {
            write_row(&mut self.out, row, &widths, &self.right_aligned)?;
        }
        writeln!(self.out)?;
        self.rows.clear();
        self.out.flush()
    }
}

fn write_row<W: Write>(
    out: &mut W,
    cells: &[String],
    widths: &[usize],
    right_aligned: &[bool],
) -> io::Result<()> {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        let width = widths[i];
        if right_aligned[i] {
            line.push_str(&format!("{cell:>width$}"));
        } else {
            line.push_str(&format!("{cell:<width$}"));
        }
    }
    writeln!(out, "{}", line.trim_end())
}

fn format_cell(field: &Field, value: &Value) -> String {
    match (field, value) {
        (Field::Direction, Value::Unsigned(v)) => match *v {
            v if v == u64::from(FWD_VALUE) => "->".to_string(),
            v if v == u64::from(REV_VALUE) => "<-".to_string(),
            _ => String::new(),
        },
        (f, Value::Unsigned(v)) if is_protocol(f) => match protocol_name(*v) {
            Some(name) => name.to_string(),
            None => v.to_string(),
        },
        _ => value.to_string(),
    }
}

fn is_protocol(field: &Field) -> bool {
    match field {
        Field::Direct(d) => d.pen() == IANA_PEN && d.id() == PROTOCOL_IDENTIFIER,
        Field::Alias(a) => a
            .sources()
            .iter()
            .all(|d| d.pen() == IANA_PEN && d.id() == PROTOCOL_IDENTIFIER),
        _ => false,
    }
}

fn protocol_name(proto: u64) -> Option<&'static str> {
    Some(match proto {
        1 => "ICMP",
        2 => "IGMP",
        4 => "IPIP",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        89 => "OSPF",
        103 => "PIM",
        132 => "SCTP",
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// One JSON array of objects keyed by field name.
pub struct JsonPrinter<W: Write> {
    out: W,
    first: bool,
}

impl<W: Write> JsonPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out, first: true }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Printer for JsonPrinter<W> {
    fn print_prologue(&mut self, _view: &View) -> io::Result<()> {
        self.first = true;
        self.out.write_all(b"[")
    }

    fn print_record(&mut self, view: &View, record: &[u8]) -> io::Result<()> {
        let mut object = Map::new();
        for (vf, value) in view.fields().iter().zip(view.decode(record)) {
            object.insert(vf.name.clone(), json_value(value));
        }

        if !self.first {
            self.out.write_all(b",")?;
        }
        self.first = false;
        self.out.write_all(b"\n  ")?;
        serde_json::to_writer(&mut self.out, &object).map_err(io::Error::from)
    }

    fn print_epilogue(&mut self, _view: &View) -> io::Result<()> {
        if !self.first {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(b"]\n")?;
        self.out.flush()
    }
}

fn json_value(value: Value) -> JsonValue {
    match value {
        Value::Unsigned(v) => JsonValue::Number(Number::from(v)),
        Value::Signed(v) => JsonValue::Number(Number::from(v)),
        Value::Empty => JsonValue::Null,
        other => JsonValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, ViewFactory};
    use crate::ipfix::element::Registry;
    use crate::ipfix::flow::Flow;

    fn sample() -> Aggregator {
        let registry = Registry::builtin();
        let view = ViewFactory::new(&registry)
            .create_view("proto, dir", "bytes, max(flowEndMilliseconds)", "bytes")
            .expect("view");

        let mut agg = Aggregator::new(view);
        for (proto, bytes) in [(6u8, 1200u64), (17, 80), (200, 5)] {
            let mut f = Flow::new();
            f.push(IANA_PEN, 4, [proto]);
            f.push(IANA_PEN, 1, bytes.to_be_bytes());
            f.push(IANA_PEN, 153, 1_700_000_000_123u64.to_be_bytes());
            agg.process_record(&f).expect("process");
        }
        agg.sort_items();
        agg
    }

    fn render(printer: &mut dyn Printer, agg: &Aggregator) {
        printer.print_prologue(agg.view()).expect("prologue");
        for record in agg.records() {
            printer.print_record(agg.view(), record).expect("record");
        }
        printer.print_epilogue(agg.view()).expect("epilogue");
    }

    #[test]
    fn test_table_output() {
        let agg = sample();
        let mut printer = TablePrinter::new(Vec::new());
        render(&mut printer, &agg);
        let text = String::from_utf8(printer.into_inner()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "proto  dir  bytes  max(flowEndMilliseconds)"
        );
        assert_eq!(
            lines[1],
            "TCP    ->    1200  2023-11-14 22:13:20.123"
        );
        assert!(lines[2].starts_with("UDP    ->      80"));
        assert!(lines[3].starts_with("200    ->       5"));
    }

    #[test]
    fn test_json_output() {
        let agg = sample();
        let mut printer = JsonPrinter::new(Vec::new());
        render(&mut printer, &agg);
        let text = String::from_utf8(printer.into_inner()).expect("utf8");

        let parsed: JsonValue = serde_json::from_str(&text).expect("valid json");
        let rows = parsed.as_array().expect("array");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["proto"], 6);
        assert_eq!(rows[0]["dir"], 1);
        assert_eq!(rows[0]["bytes"], 1200);
        assert_eq!(
            rows[0]["max(flowEndMilliseconds)"],
            "2023-11-14 22:13:20.123"
        );
    }

    #[test]
    fn test_json_empty() {
        let agg = Aggregator::new(sample().view().clone());
        let mut printer = JsonPrinter::new(Vec::new());
        render(&mut printer, &agg);
        let text = String::from_utf8(printer.into_inner()).expect("utf8");
        assert_eq!(text, "[]\n");
    }
}

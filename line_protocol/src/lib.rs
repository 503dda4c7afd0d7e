//! Encoder and parser for the backend's textual line protocol.
//!
//! A point is rendered as
//!
//! ```text
//! measurement[,tag=value]* field=value[,field=value]* timestamp_ns
//! ```
//!
//! Timestamps in [`Point`] are seconds since the epoch; the wire format
//! always carries nanoseconds. Tag and field ordering within a line is not
//! guaranteed to be meaningful, so consumers must treat lines as unordered
//! on those axes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::Write;

use data_types::{FieldValue, Point};
use observability_deps::tracing::warn;
use snafu::Snafu;

mod parser;

pub use parser::{parse, parse_batch};

/// Multiplier from the model's second-precision timestamps to the wire's
/// nanosecond timestamps.
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Things that can go wrong encoding or parsing a point.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("point has an empty measurement name"))]
    EmptyMeasurement,

    #[snafu(display(r#"point for measurement "{}" has no fields"#, measurement))]
    NoFields { measurement: String },

    #[snafu(display(r#"empty value for tag "{}" on measurement "{}""#, tag, measurement))]
    EmptyTagValue { measurement: String, tag: String },

    #[snafu(display(r#"empty field key on measurement "{}""#, measurement))]
    EmptyFieldKey { measurement: String },

    #[snafu(display(r#"null value for field "{}" on measurement "{}""#, field, measurement))]
    NullFieldValue { measurement: String, field: String },

    #[snafu(display("malformed line at byte {}: {}", offset, reason))]
    Malformed { offset: usize, reason: String },
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encodes a single point to one line, without a trailing newline.
pub fn encode(point: &Point) -> Result<String> {
    if point.measurement.is_empty() {
        return Err(Error::EmptyMeasurement);
    }
    if point.fields.is_empty() {
        return Err(Error::NoFields {
            measurement: point.measurement.clone(),
        });
    }

    let mut line = String::new();
    escape_measurement(&mut line, &point.measurement);

    for (key, value) in &point.tags {
        if value.is_empty() {
            return Err(Error::EmptyTagValue {
                measurement: point.measurement.clone(),
                tag: key.clone(),
            });
        }
        line.push(',');
        escape_key(&mut line, key);
        line.push('=');
        escape_key(&mut line, value);
    }

    line.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if key.is_empty() {
            return Err(Error::EmptyFieldKey {
                measurement: point.measurement.clone(),
            });
        }
        if !first {
            line.push(',');
        }
        first = false;
        escape_key(&mut line, key);
        line.push('=');
        match value {
            FieldValue::Null => {
                return Err(Error::NullFieldValue {
                    measurement: point.measurement.clone(),
                    field: key.clone(),
                })
            }
            FieldValue::Integer(v) => write!(line, "{v}i").expect("writing to string"),
            FieldValue::Float(v) => write!(line, "{v}").expect("writing to string"),
            FieldValue::Boolean(v) => write!(line, "{v}").expect("writing to string"),
            FieldValue::String(v) => {
                line.push('"');
                for c in v.chars() {
                    if c == '"' || c == '\\' {
                        line.push('\\');
                    }
                    line.push(c);
                }
                line.push('"');
            }
        }
    }

    write!(line, " {}", point.timestamp * NANOS_PER_SECOND).expect("writing to string");
    Ok(line)
}

/// Encodes a batch of points, joining lines with `\n`. The first invalid
/// point fails the whole batch.
pub fn encode_batch(points: &[Point]) -> Result<String> {
    let lines = points.iter().map(encode).collect::<Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}

/// Encodes a batch of points, skipping points that cannot be encoded.
///
/// This is the write-path variant: a producer that ships one bad point
/// should not lose the rest of the batch. Skipped points are logged.
pub fn encode_batch_lenient(points: &[Point]) -> String {
    let mut lines = Vec::with_capacity(points.len());
    for point in points {
        match encode(point) {
            Ok(line) => lines.push(line),
            Err(e) => warn!(measurement=%point.measurement, error=%e, "skipping unencodable point"),
        }
    }
    lines.join("\n")
}

fn escape_measurement(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == ',' || c == ' ' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn escape_key(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == ',' || c == ' ' || c == '=' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn point(
        measurement: &str,
        timestamp: i64,
        tags: BTreeMap<String, String>,
        fields: &[(&str, FieldValue)],
    ) -> Point {
        Point {
            measurement: measurement.into(),
            timestamp,
            tags,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn encodes_simple_point() {
        let p = point(
            "cpu.idle",
            1_700_000_000,
            tags(&[("host", "h1")]),
            &[("value", FieldValue::Float(0.87))],
        );
        assert_eq!(
            encode(&p).unwrap(),
            "cpu.idle,host=h1 value=0.87 1700000000000000000"
        );
    }

    #[test]
    fn encodes_all_field_types() {
        let p = point(
            "m",
            1,
            tags(&[]),
            &[
                ("b", FieldValue::Boolean(true)),
                ("f", FieldValue::Float(1.5)),
                ("i", FieldValue::Integer(-3)),
                ("s", FieldValue::String("up".into())),
            ],
        );
        assert_eq!(
            encode(&p).unwrap(),
            r#"m b=true,f=1.5,i=-3i,s="up" 1000000000"#
        );
    }

    #[test]
    fn escapes_special_characters() {
        let p = point(
            "disk usage,total",
            2,
            tags(&[("mount point", "/var=data")]),
            &[("path", FieldValue::String(r#"a "quoted" \thing"#.into()))],
        );
        let line = encode(&p).unwrap();
        assert_eq!(
            line,
            r#"disk\ usage\,total,mount\ point=/var\=data path="a \"quoted\" \\thing" 2000000000"#
        );
    }

    #[test]
    fn rejects_invalid_points() {
        let p = point("", 1, tags(&[]), &[("value", FieldValue::Float(1.0))]);
        assert!(matches!(encode(&p), Err(Error::EmptyMeasurement)));

        let p = point("m", 1, tags(&[]), &[]);
        assert!(matches!(encode(&p), Err(Error::NoFields { .. })));

        let p = point(
            "m",
            1,
            tags(&[("host", "")]),
            &[("value", FieldValue::Float(1.0))],
        );
        assert!(matches!(encode(&p), Err(Error::EmptyTagValue { .. })));

        let p = point("m", 1, tags(&[]), &[("value", FieldValue::Null)]);
        assert!(matches!(encode(&p), Err(Error::NullFieldValue { .. })));

        let p = point("m", 1, tags(&[]), &[("", FieldValue::Float(1.0))]);
        assert!(matches!(encode(&p), Err(Error::EmptyFieldKey { .. })));
    }

    #[test]
    fn batch_encoding_joins_lines() {
        let a = point("a", 1, tags(&[]), &[("value", FieldValue::Integer(1))]);
        let b = point("b", 2, tags(&[]), &[("value", FieldValue::Integer(2))]);
        assert_eq!(
            encode_batch(&[a, b]).unwrap(),
            "a value=1i 1000000000\nb value=2i 2000000000"
        );
    }

    #[test]
    fn lenient_batch_encoding_skips_bad_points() {
        test_helpers::maybe_start_logging();

        let good = point("a", 1, tags(&[]), &[("value", FieldValue::Integer(1))]);
        let bad = point("b", 2, tags(&[("host", "")]), &[("value", FieldValue::Integer(2))]);
        let also_good = point("c", 3, tags(&[]), &[("value", FieldValue::Integer(3))]);

        assert_eq!(
            encode_batch_lenient(&[good, bad, also_good]),
            "a value=1i 1000000000\nc value=3i 3000000000"
        );
    }

    #[test]
    fn strict_batch_encoding_fails_on_bad_point() {
        let good = point("a", 1, tags(&[]), &[("value", FieldValue::Integer(1))]);
        let bad = point("b", 2, tags(&[]), &[]);
        assert!(encode_batch(&[good, bad]).is_err());
    }
}

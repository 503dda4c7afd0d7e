//! The JSON envelope every API answer wears, plus result shaping.

use data_types::Scalar;
use hyper::{Body, Response, StatusCode};
use influxdb_client::ResultSet;
use serde::Serialize;
use std::collections::BTreeMap;

/// The `{httpstatus, msg, data}` envelope.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    httpstatus: u16,
    msg: String,
    data: T,
}

/// Builds a 200 envelope response.
pub fn success_response(msg: &str, data: impl Serialize) -> Response<Body> {
    let body = serde_json::to_vec(&Envelope {
        httpstatus: StatusCode::OK.as_u16(),
        msg: msg.to_string(),
        data,
    })
    .expect("response envelope serializes");

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("valid response")
}

/// Builds an error envelope response carrying `status` both as the HTTP
/// status code and inside the envelope.
pub fn error_response(status: StatusCode, msg: &str) -> Response<Body> {
    let body = serde_json::to_vec(&Envelope {
        httpstatus: status.as_u16(),
        msg: msg.to_string(),
        data: serde_json::Value::Null,
    })
    .expect("response envelope serializes");

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("valid response")
}

/// Truncating decimal rounding: keeps `precision` decimal places of `from`
/// and drops the rest.
pub fn set_precision(from: f64, precision: i32) -> f64 {
    let base = 10f64.powi(precision);
    ((from * base) as i64) as f64 / base
}

/// A backend result with the numeric samples pulled out into `data`.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ParsedResults {
    /// One entry per statement.
    pub results: Vec<ParsedResult>,
}

/// One parsed statement result.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ParsedResult {
    /// Parsed series.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<ParsedSeries>,
    /// Statement error, passed through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One parsed series: raw rows replaced by [`SamplePoint`]s.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ParsedSeries {
    /// Measurement name.
    pub name: String,
    /// Group-by tags.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Column names of the original rows.
    pub columns: Vec<String>,
    /// The shaped samples.
    pub data: Vec<SamplePoint>,
}

/// One numeric sample, rounded to four decimal places. Columns beyond the
/// (time, value) pair, such as the hostname, are preserved in order.
#[derive(Debug, Serialize, PartialEq)]
pub struct SamplePoint {
    /// Sample time, as the backend delivered it.
    pub time: Scalar,
    /// Sample value after rounding.
    pub value: Scalar,
    /// Any extra row cells.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<Scalar>,
}

/// Shapes a raw result set: every numeric `(time, value, ...)` row becomes
/// a [`SamplePoint`] with the value rounded to four decimals; rows without
/// a numeric value (gaps filled with null) are dropped.
pub fn parse_results(rs: ResultSet) -> ParsedResults {
    ParsedResults {
        results: rs
            .results
            .into_iter()
            .map(|result| ParsedResult {
                error: result.error,
                series: result
                    .series
                    .into_iter()
                    .map(|series| {
                        let data = series
                            .values
                            .into_iter()
                            .filter_map(|mut row| {
                                if row.len() < 2 {
                                    return None;
                                }
                                let value = row[1].as_f64()?;
                                let extra = row.split_off(2);
                                let time = row.swap_remove(0);
                                Some(SamplePoint {
                                    time,
                                    value: Scalar::Float(set_precision(value, 4)),
                                    extra,
                                })
                            })
                            .collect();
                        ParsedSeries {
                            name: series.name,
                            tags: series.tags,
                            columns: series.columns,
                            data,
                        }
                    })
                    .collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_precision_truncates() {
        assert_eq!(set_precision(1.23456789, 4), 1.2345);
        assert_eq!(set_precision(0.00009, 4), 0.0);
        assert_eq!(set_precision(100.0, 4), 100.0);
        assert_eq!(set_precision(2.5, 0), 2.0);
        assert_eq!(set_precision(-1.23456, 2), -1.23);
    }

    #[test]
    fn parse_pulls_numeric_samples() {
        let rs: ResultSet = serde_json::from_str(
            r#"{"results": [{"series": [{
                "name": "cpu.idle",
                "columns": ["time", "mean", "host"],
                "values": [
                    [1700000000, 87.123456, "h1"],
                    [1700000060, null, "h1"],
                    [1700000120, 90.5, "h2"]
                ]
            }]}]}"#,
        )
        .unwrap();

        let parsed = parse_results(rs);
        let series = &parsed.results[0].series[0];
        assert_eq!(series.data.len(), 2);
        assert_eq!(series.data[0].value, Scalar::Float(87.1234));
        assert_eq!(series.data[0].extra, vec![Scalar::String("h1".into())]);
        assert_eq!(series.data[1].value, Scalar::Float(90.5));
        assert_eq!(series.data[1].time, Scalar::Integer(1700000120));
    }

    #[test]
    fn parse_keeps_plain_pairs_without_extras() {
        let rs: ResultSet = serde_json::from_str(
            r#"{"results": [{"series": [{
                "name": "m",
                "columns": ["time", "mean"],
                "values": [[1, 2.0]]
            }]}]}"#,
        )
        .unwrap();

        let parsed = parse_results(rs);
        let sample = &parsed.results[0].series[0].data[0];
        assert!(sample.extra.is_empty());
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json, serde_json::json!({"time": 1, "value": 2.0}));
    }
}

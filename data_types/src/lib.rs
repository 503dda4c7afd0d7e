//! Shared data types for the metrics routing pipeline.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single field value carried by a [`Point`].
///
/// Bus payloads are JSON, so the variants mirror the JSON scalar types. The
/// deserialization order matters: a bare integer must become
/// [`FieldValue::Integer`], not a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// JSON `null`. Tolerated at decode time so one bad field does not drop
    /// a whole batch; rejected when the point is encoded.
    Null,
    /// A signed integer value.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A boolean value.
    Boolean(bool),
    /// A string value.
    String(String),
}

impl FieldValue {
    /// Returns the value as a float, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// A single time series sample.
///
/// Invariants (enforced at encode time, not construction time, to match the
/// lenient bus ingest path): the measurement and every field key are
/// non-empty, no tag value is empty, and at least one field is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Measurement name, e.g. `cpu.idle`.
    pub measurement: String,
    /// Seconds since the unix epoch.
    pub timestamp: i64,
    /// Tag set. Values are always strings.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Field set. At least one entry for a well-formed point.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// A batch of points as carried in one bus message.
///
/// `database` is the logical namespace (e.g. `collect.api.myservice`), not
/// the name of a physical backend database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBatch {
    /// Timestamp precision declared by the producer. Outbound writes always
    /// use nanoseconds regardless of this value.
    #[serde(default)]
    pub precision: String,
    /// Logical namespace the batch belongs to.
    pub database: String,
    /// Retention policy hint from the producer, unused on the write path.
    #[serde(default)]
    pub retention_policy: String,
    /// The samples themselves.
    #[serde(default)]
    pub points: Vec<Point>,
}

/// A resolved route for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// The namespace this route belongs to.
    pub namespace: String,
    /// Backend hosts. The first entry is the primary; any additional entries
    /// are replicas written in parallel. Each entry may be a comma-separated
    /// list of addresses for one backend.
    pub backends: Vec<String>,
}

impl Route {
    /// Creates a route for `namespace` over `backends`.
    pub fn new(namespace: impl Into<String>, backends: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            backends,
        }
    }

    /// The primary backend, if any backend is configured at all.
    pub fn primary(&self) -> Option<&str> {
        self.backends.first().map(String::as_str)
    }

    /// The replica backends (everything after the primary).
    pub fn replicas(&self) -> &[String] {
        self.backends.get(1..).unwrap_or(&[])
    }

    /// True if no backend is configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// A dynamically typed scalar as found in backend query result rows.
///
/// Query results contain `[[time, value, optional host]]` arrays whose cells
/// can be any JSON scalar; this is the value-typed container for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// JSON `null`.
    Null,
    /// A boolean cell.
    Boolean(bool),
    /// An integer cell.
    Integer(i64),
    /// A float cell.
    Float(f64),
    /// A string cell.
    String(String),
}

impl Scalar {
    /// Returns the cell as a float, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the cell as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

//! Query configuration: normalization of the three accepted input forms.
//!
//! A configuration arrives as a structured JSON document on disk, as the
//! same document in a string, or as a binary protobuf payload. All three
//! forms decode to the same [`QueryConfig`] state; rank resolution then
//! selects the per-rank slice of any vector-valued fields.

use std::path::{Path, PathBuf};

use prost::Message;

use crate::common::{CoordRange, COORD_MAX};
use crate::err::{Error, Result};

/// Default upper bound of the in-memory read window (10 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 10 << 20;

/// Version of the configuration document this worker writes and reads.
pub const CONFIG_VERSION: u32 = 1;

/// Keys understood in the JSON document form.
const KNOWN_KEYS: &[&str] = &[
    "version",
    "workspace",
    "array_name",
    "query_row_ranges",
    "query_column_ranges",
    "query_attributes",
    "segment_size",
    "vid_mapping_file",
    "callset_mapping_file",
    "reference_genome",
];

/// A scalar-or-vector JSON field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    /// A single value, shared by all ranks.
    One(T),
    /// One value per rank.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// A range in the document: a `[lo, hi]` pair or a point scalar.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
enum RangeSpec {
    /// Single column/row.
    Point(u64),
    /// Inclusive `[lo, hi]` pair.
    Pair([u64; 2]),
}

impl RangeSpec {
    fn into_range(self) -> Result<CoordRange> {
        match self {
            RangeSpec::Point(at) => Ok(CoordRange { lo: at, hi: at }),
            RangeSpec::Pair([lo, hi]) => {
                if lo > hi {
                    Err(Error::config(format!("range [{}, {}] is inverted", lo, hi)))
                } else {
                    Ok(CoordRange { lo, hi })
                }
            }
        }
    }
}

/// The raw JSON document shape.
#[derive(Debug, Clone, serde::Deserialize)]
struct ConfigDocument {
    /// Handled before deserialization; kept for the document shape.
    #[allow(dead_code)]
    #[serde(default)]
    version: Option<u32>,
    workspace: Option<OneOrMany<String>>,
    array_name: Option<OneOrMany<String>>,
    #[serde(default)]
    query_row_ranges: Vec<Vec<RangeSpec>>,
    #[serde(default)]
    query_column_ranges: Vec<Vec<RangeSpec>>,
    #[serde(default)]
    query_attributes: Vec<String>,
    #[serde(default)]
    segment_size: Option<u64>,
    vid_mapping_file: Option<String>,
    callset_mapping_file: Option<String>,
    #[serde(default)]
    reference_genome: Option<String>,
}

/// Normalized query configuration, identical for all three input forms.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryConfig {
    /// Workspace path(s), one entry per rank or a single shared entry.
    pub workspaces: Vec<String>,
    /// Array name(s), one entry per rank or a single shared entry.
    pub arrays: Vec<String>,
    /// Row range lists per rank; empty means all rows.
    pub row_ranges: Vec<Vec<CoordRange>>,
    /// Column range lists per rank; empty means a full scan.
    pub column_ranges: Vec<Vec<CoordRange>>,
    /// Attribute subset; empty means all attributes.
    pub attributes: Vec<String>,
    /// Upper bound of the in-memory read window in bytes.
    pub segment_size: u64,
    /// Path to the VID mapping document.
    pub vid_mapping_file: String,
    /// Path to the callset mapping document.
    pub callset_mapping_file: String,
    /// Identifier of the reference genome.
    pub reference_genome: String,
}

impl QueryConfig {
    /// Parse the JSON document form from a file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let value: serde_json::Value =
            crate::common::read_json_document(path.as_ref(), "query")?;
        Self::from_json_value(value)
    }

    /// Parse the JSON document form from a string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("malformed query document: {}", e)))?;
        Self::from_json_value(value)
    }

    /// Parse the binary schema payload form.
    pub fn from_pb_bytes(bytes: &[u8]) -> Result<Self> {
        let pb = PbQueryConfig::decode(bytes)
            .map_err(|e| Error::config(format!("malformed query payload: {}", e)))?;
        let ranges = |lists: Vec<PbRangeList>| -> Result<Vec<Vec<CoordRange>>> {
            lists
                .into_iter()
                .map(|list| {
                    list.ranges
                        .into_iter()
                        .map(|range| {
                            if range.low > range.high {
                                Err(Error::config(format!(
                                    "range [{}, {}] is inverted",
                                    range.low, range.high
                                )))
                            } else {
                                Ok(CoordRange {
                                    lo: range.low,
                                    hi: range.high,
                                })
                            }
                        })
                        .collect()
                })
                .collect()
        };
        Self::normalize(
            pb.workspace,
            pb.array_name,
            ranges(pb.query_row_ranges)?,
            ranges(pb.query_column_ranges)?,
            pb.query_attributes,
            pb.segment_size,
            pb.vid_mapping_file,
            pb.callset_mapping_file,
            pb.reference_genome,
        )
    }

    fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::config("query document is not an object"))?;
        let version = object
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(CONFIG_VERSION as u64);
        let unknown = object
            .keys()
            .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !unknown.is_empty() && version <= CONFIG_VERSION as u64 {
            return Err(Error::config(format!(
                "unknown field(s) in query document: {}",
                unknown.join(", ")
            )));
        }

        let document: ConfigDocument = serde_json::from_value(value)
            .map_err(|e| Error::config(format!("malformed query document: {}", e)))?;
        let ranges = |lists: Vec<Vec<RangeSpec>>| -> Result<Vec<Vec<CoordRange>>> {
            lists
                .into_iter()
                .map(|list| list.into_iter().map(RangeSpec::into_range).collect())
                .collect()
        };
        Self::normalize(
            document
                .workspace
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            document
                .array_name
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
            ranges(document.query_row_ranges)?,
            ranges(document.query_column_ranges)?,
            document.query_attributes,
            document.segment_size,
            document.vid_mapping_file,
            document.callset_mapping_file,
            document.reference_genome,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn normalize(
        workspaces: Vec<String>,
        arrays: Vec<String>,
        row_ranges: Vec<Vec<CoordRange>>,
        column_ranges: Vec<Vec<CoordRange>>,
        attributes: Vec<String>,
        segment_size: Option<u64>,
        vid_mapping_file: Option<String>,
        callset_mapping_file: Option<String>,
        reference_genome: Option<String>,
    ) -> Result<Self> {
        if workspaces.is_empty() {
            return Err(Error::config("missing required field `workspace`"));
        }
        if arrays.is_empty() {
            return Err(Error::config("missing required field `array_name`"));
        }
        let segment_size = segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        if segment_size == 0 {
            return Err(Error::config("segment_size must be positive"));
        }
        Ok(Self {
            workspaces,
            arrays,
            row_ranges,
            column_ranges,
            attributes,
            segment_size,
            vid_mapping_file: vid_mapping_file
                .ok_or_else(|| Error::config("missing required field `vid_mapping_file`"))?,
            callset_mapping_file: callset_mapping_file
                .ok_or_else(|| Error::config("missing required field `callset_mapping_file`"))?,
            reference_genome: reference_genome.unwrap_or_default(),
        })
    }

    /// Select the slice of this configuration owned by `rank`.
    pub fn resolve(&self, rank: u32) -> Result<ResolvedQuery> {
        let workspace = pick("workspace", &self.workspaces, rank)?.clone();
        let array = pick("array_name", &self.arrays, rank)?.clone();
        let row_ranges = pick_ranges(&self.row_ranges, rank)?;
        let column_ranges = {
            let ranges = pick_ranges(&self.column_ranges, rank)?;
            if ranges.is_empty() {
                vec![CoordRange::full()]
            } else {
                ranges
            }
        };
        let workspace = PathBuf::from(workspace);
        // Relative document paths are resolved against the workspace.
        let resolve_path = |path: &str| -> PathBuf {
            let path = PathBuf::from(path);
            if path.is_relative() {
                workspace.join(path)
            } else {
                path
            }
        };
        let vid_mapping_file = resolve_path(&self.vid_mapping_file);
        let callset_mapping_file = resolve_path(&self.callset_mapping_file);
        Ok(ResolvedQuery {
            workspace,
            array,
            row_ranges,
            column_ranges,
            attributes: self.attributes.clone(),
            segment_size: self.segment_size,
            rank,
            vid_mapping_file,
            callset_mapping_file,
            reference_genome: self.reference_genome.clone(),
        })
    }
}

/// Pick the rank's element of a scalar-or-vector field.
fn pick<'a, T>(what: &str, items: &'a [T], rank: u32) -> Result<&'a T> {
    match items {
        [] => Err(Error::config(format!("missing required field `{}`", what))),
        [single] => Ok(single),
        items => items.get(rank as usize).ok_or_else(|| {
            Error::config(format!(
                "rank {} exceeds the {} {} entries",
                rank,
                items.len(),
                what
            ))
        }),
    }
}

fn pick_ranges(lists: &[Vec<CoordRange>], rank: u32) -> Result<Vec<CoordRange>> {
    match lists {
        [] => Ok(Vec::new()),
        [single] => Ok(single.clone()),
        lists => lists
            .get(rank as usize)
            .cloned()
            .ok_or_else(|| {
                Error::config(format!(
                    "rank {} exceeds the {} range list entries",
                    rank,
                    lists.len()
                ))
            }),
    }
}

/// One rank's slice of a query configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    /// Workspace path.
    pub workspace: PathBuf,
    /// Array name.
    pub array: String,
    /// Row ranges; empty means all rows.
    pub row_ranges: Vec<CoordRange>,
    /// Column ranges; never empty after resolution.
    pub column_ranges: Vec<CoordRange>,
    /// Attribute subset; empty means all attributes.
    pub attributes: Vec<String>,
    /// Upper bound of the in-memory read window in bytes.
    pub segment_size: u64,
    /// Concurrency rank this slice belongs to.
    pub rank: u32,
    /// Path to the VID mapping document.
    pub vid_mapping_file: PathBuf,
    /// Path to the callset mapping document.
    pub callset_mapping_file: PathBuf,
    /// Identifier of the reference genome.
    pub reference_genome: String,
}

impl ResolvedQuery {
    /// The `SCAN_FULL` column range list.
    pub fn scan_full() -> Vec<CoordRange> {
        vec![CoordRange {
            lo: 0,
            hi: COORD_MAX,
        }]
    }
}

/// Binary payload form of the query configuration.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbQueryConfig {
    /// Workspace path(s).
    #[prost(string, repeated, tag = "1")]
    pub workspace: Vec<String>,
    /// Array name(s).
    #[prost(string, repeated, tag = "2")]
    pub array_name: Vec<String>,
    /// Row range lists per rank.
    #[prost(message, repeated, tag = "3")]
    pub query_row_ranges: Vec<PbRangeList>,
    /// Column range lists per rank.
    #[prost(message, repeated, tag = "4")]
    pub query_column_ranges: Vec<PbRangeList>,
    /// Attribute subset.
    #[prost(string, repeated, tag = "5")]
    pub query_attributes: Vec<String>,
    /// Read window bound in bytes.
    #[prost(uint64, optional, tag = "6")]
    pub segment_size: Option<u64>,
    /// Path to the VID mapping document.
    #[prost(string, optional, tag = "7")]
    pub vid_mapping_file: Option<String>,
    /// Path to the callset mapping document.
    #[prost(string, optional, tag = "8")]
    pub callset_mapping_file: Option<String>,
    /// Reference genome identifier.
    #[prost(string, optional, tag = "9")]
    pub reference_genome: Option<String>,
    /// Document version.
    #[prost(uint32, optional, tag = "10")]
    pub version: Option<u32>,
}

/// One list of ranges in the binary payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbRangeList {
    /// The ranges of this list.
    #[prost(message, repeated, tag = "1")]
    pub ranges: Vec<PbRange>,
}

/// One inclusive range in the binary payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbRange {
    /// First coordinate.
    #[prost(uint64, tag = "1")]
    pub low: u64,
    /// Last coordinate, inclusive.
    #[prost(uint64, tag = "2")]
    pub high: u64,
}

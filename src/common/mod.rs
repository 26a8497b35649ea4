//! Common functionality.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flate2::bufread::MultiGzDecoder;

use crate::err::{Error, Result};

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Return the version of the `vararray-worker` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

/// Read and deserialize a JSON document, decoding gzip for `.gz` paths.
///
/// All of the worker's documents (VID map, callset map, query
/// configuration, array cells, FAM overrides) go through here; `what` names
/// the document kind in error messages.
pub fn read_json_document<T>(path: &Path, what: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let file = File::open(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let reader: Box<dyn Read> = if path.extension().and_then(std::ffi::OsStr::to_str) == Some("gz")
    {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };
    serde_json::from_reader(BufReader::new(reader)).map_err(|e| {
        Error::config(format!(
            "malformed {} document {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

/// An inclusive range of row or column coordinates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct CoordRange {
    /// First coordinate of the range.
    pub lo: u64,
    /// Last coordinate of the range (inclusive).
    pub hi: u64,
}

/// Largest usable coordinate; full scans run over `[0, COORD_MAX]`.
pub const COORD_MAX: u64 = (1u64 << 63) - 2;

impl CoordRange {
    /// Create a new range; `lo` must not exceed `hi`.
    pub fn new(lo: u64, hi: u64) -> Self {
        assert!(lo <= hi, "range lo {} exceeds hi {}", lo, hi);
        Self { lo, hi }
    }

    /// The range covering the full coordinate axis.
    pub fn full() -> Self {
        Self {
            lo: 0,
            hi: COORD_MAX,
        }
    }

    /// Number of coordinates covered by the range.
    pub fn width(&self) -> u64 {
        self.hi - self.lo + 1
    }

    /// Whether `coord` falls inside the range.
    pub fn contains(&self, coord: u64) -> bool {
        self.lo <= coord && coord <= self.hi
    }

    /// Intersection with another range, or `None` when disjoint.
    pub fn intersect(&self, other: &CoordRange) -> Option<CoordRange> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        (lo <= hi).then_some(CoordRange { lo, hi })
    }
}

/// Intersect each of `ranges` with `domain`, dropping empty results.
pub fn clamp_ranges(ranges: &[CoordRange], domain: &CoordRange) -> Vec<CoordRange> {
    ranges
        .iter()
        .filter_map(|range| range.intersect(domain))
        .collect()
}

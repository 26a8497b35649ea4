//! Contract with the array storage back end.
//!
//! The worker consumes arrays through the traits defined here; the actual
//! fragment and tile machinery lives behind them. The crate ships a
//! JSON-file-backed implementation in [`json`] that the CLI and the tests
//! use as their back end.

use std::path::Path;

use crate::common::CoordRange;
use crate::err::Result;

pub mod codec;
pub mod json;

/// A raw attribute buffer as delivered by the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBuffer {
    /// Contiguous buffer bytes.
    pub data: Vec<u8>,
    /// Number of elements encoded in `data`.
    pub elements: usize,
}

/// One non-empty array cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCell {
    /// Row coordinate (callset).
    pub row: u64,
    /// Column coordinate where the call starts.
    pub column: u64,
    /// Inclusive closing column of the call.
    pub end: u64,
    /// Attribute buffers, in the store's field order.
    pub fields: Vec<(String, FieldBuffer)>,
}

/// Row and column bounds of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDomain {
    /// Row bounds.
    pub rows: CoordRange,
    /// Column bounds.
    pub columns: CoordRange,
}

/// Parameters of one scan over an opened array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Attributes to materialize; empty means all.
    pub attributes: Vec<String>,
    /// Row ranges to restrict to.
    pub row_ranges: Vec<CoordRange>,
    /// Column ranges to restrict to.
    pub column_ranges: Vec<CoordRange>,
    /// Upper bound on the in-memory read window, in bytes per attribute.
    pub segment_size: u64,
}

/// Factory for opened arrays.
pub trait ArrayStore {
    /// Open the named array inside the workspace.
    fn open_array(&self, workspace: &Path, array: &str) -> Result<Box<dyn ArrayHandle>>;
}

/// An opened array.
pub trait ArrayHandle {
    /// The non-empty domain of the array, or `None` for an empty array.
    fn domain(&self) -> Option<ArrayDomain>;

    /// Start a scan restricted to the request's ranges and attributes.
    ///
    /// Cells are delivered in column-major order: primary key `column`
    /// ascending, secondary key `row` ascending.
    fn scan(&mut self, request: &ScanRequest) -> Result<Box<dyn CellStream + '_>>;

    /// Close the array, releasing fragment resources.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A stream of cells from one scan.
pub trait CellStream {
    /// Pull the next cell, or `None` at the end of the scan.
    fn next_cell(&mut self) -> Result<Option<RawCell>>;
}

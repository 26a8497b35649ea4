//! JSON-file-backed array store.
//!
//! One array is a directory `{workspace}/{array}/` holding an `array.json`
//! document with the non-empty cells. The store is used by the CLI and the
//! tests; production deployments plug a real fragment engine into the
//! [`ArrayStore`](super::ArrayStore) trait instead.
//!
//! Field values encode as follows: strings become UTF-8 char buffers,
//! integral numbers become `int32` elements, numbers with a fractional
//! representation become `float32` elements. Genotype buffers are stored as
//! the already-interleaved allele/phase integer list.

use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;

use crate::common::CoordRange;
use crate::err::{Error, Result};

use super::{ArrayDomain, ArrayHandle, ArrayStore, CellStream, FieldBuffer, RawCell, ScanRequest};

/// Name of the cell document inside an array directory.
pub const ARRAY_DOCUMENT: &str = "array.json";

/// Store implementation reading arrays from JSON documents.
#[derive(Debug, Default, Clone)]
pub struct JsonArrayStore;

impl ArrayStore for JsonArrayStore {
    fn open_array(&self, workspace: &Path, array: &str) -> Result<Box<dyn ArrayHandle>> {
        let path = workspace.join(array).join(ARRAY_DOCUMENT);
        if !path.is_file() {
            return Err(Error::not_found("array", format!("{}", path.display())));
        }
        let document: ArrayDocument = crate::common::read_json_document(&path, "array")?;
        JsonArrayHandle::new(path, document).map(|handle| Box::new(handle) as Box<dyn ArrayHandle>)
    }
}

/// The on-disk array document.
#[derive(Debug, Clone, serde::Deserialize)]
struct ArrayDocument {
    /// Cells of the array, in any order.
    cells: Vec<JsonCell>,
}

/// One cell in the array document.
#[derive(Debug, Clone, serde::Deserialize)]
struct JsonCell {
    /// Row coordinate.
    row: u64,
    /// Starting column coordinate.
    column: u64,
    /// Inclusive end column; defaults to `column`.
    end: Option<u64>,
    /// Field values by name.
    #[serde(default)]
    fields: IndexMap<String, serde_json::Value>,
}

struct JsonArrayHandle {
    path: PathBuf,
    cells: Vec<RawCell>,
}

impl JsonArrayHandle {
    fn new(path: PathBuf, document: ArrayDocument) -> Result<Self> {
        let mut cells = document
            .cells
            .into_iter()
            .map(|cell| {
                let end = cell.end.unwrap_or(cell.column);
                let fields = cell
                    .fields
                    .into_iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, value)| {
                        let buffer = encode_value(&name, &value)?;
                        Ok((name, buffer))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(RawCell {
                    row: cell.row,
                    column: cell.column,
                    end,
                    fields,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        cells.sort_by_key(|cell| (cell.column, cell.row));
        Ok(Self { path, cells })
    }
}

impl ArrayHandle for JsonArrayHandle {
    fn domain(&self) -> Option<ArrayDomain> {
        if self.cells.is_empty() {
            return None;
        }
        let rows = self.cells.iter().map(|cell| cell.row);
        let columns = self
            .cells
            .iter()
            .flat_map(|cell| [cell.column, cell.end]);
        Some(ArrayDomain {
            rows: CoordRange::new(
                rows.clone().min().expect("no cells"),
                rows.max().expect("no cells"),
            ),
            columns: CoordRange::new(
                columns.clone().min().expect("no cells"),
                columns.max().expect("no cells"),
            ),
        })
    }

    fn scan(&mut self, request: &ScanRequest) -> Result<Box<dyn CellStream + '_>> {
        tracing::debug!(
            "scanning {} with {} row range(s), {} column range(s)",
            self.path.display(),
            request.row_ranges.len(),
            request.column_ranges.len()
        );
        Ok(Box::new(JsonCellStream {
            cells: &self.cells,
            request: request.clone(),
            next: 0,
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        tracing::debug!("closing array {}", self.path.display());
        Ok(())
    }
}

struct JsonCellStream<'a> {
    cells: &'a [RawCell],
    request: ScanRequest,
    next: usize,
}

impl JsonCellStream<'_> {
    fn selected(&self, cell: &RawCell) -> bool {
        let row_hit = self
            .request
            .row_ranges
            .iter()
            .any(|range| range.contains(cell.row));
        let column_hit = self
            .request
            .column_ranges
            .iter()
            .any(|range| range.contains(cell.column));
        row_hit && column_hit
    }
}

impl CellStream for JsonCellStream<'_> {
    fn next_cell(&mut self) -> Result<Option<RawCell>> {
        while let Some(cell) = self.cells.get(self.next) {
            self.next += 1;
            if !self.selected(cell) {
                continue;
            }
            let mut projected = cell.clone();
            if !self.request.attributes.is_empty() {
                projected
                    .fields
                    .retain(|(name, _)| self.request.attributes.iter().any(|a| a == name));
            }
            return Ok(Some(projected));
        }
        Ok(None)
    }
}

fn encode_value(name: &str, value: &serde_json::Value) -> Result<FieldBuffer> {
    match value {
        serde_json::Value::String(s) => Ok(FieldBuffer {
            data: s.as_bytes().to_vec(),
            elements: s.len(),
        }),
        serde_json::Value::Number(_) => encode_numbers(name, std::slice::from_ref(value)),
        serde_json::Value::Array(values) => encode_numbers(name, values),
        _ => Err(Error::schema(
            name,
            format!("unsupported JSON value: {}", value),
        )),
    }
}

fn encode_numbers(name: &str, values: &[serde_json::Value]) -> Result<FieldBuffer> {
    let all_integral = values.iter().all(|v| v.as_i64().is_some());
    let mut data = Vec::with_capacity(values.len() * 4);
    for value in values {
        if all_integral {
            let v = value.as_i64().expect("checked integral");
            let v = i32::try_from(v)
                .map_err(|_| Error::schema(name, format!("int32 overflow: {}", v)))?;
            data.write_i32::<LittleEndian>(v)
                .expect("write to Vec failed");
        } else {
            let v = value
                .as_f64()
                .ok_or_else(|| Error::schema(name, format!("not a number: {}", value)))?;
            data.write_f32::<LittleEndian>(v as f32)
                .expect("write to Vec failed");
        }
    }
    Ok(FieldBuffer {
        data,
        elements: values.len(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::common::CoordRange;

    use super::*;

    fn write_array(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir.join("variants")).expect("mkdir failed");
        std::fs::write(dir.join("variants").join(ARRAY_DOCUMENT), content).expect("write failed");
    }

    #[test]
    fn open_missing_array_is_not_found() {
        let tmp_dir = temp_testdir::TempDir::default();
        let store = JsonArrayStore;
        let err = store
            .open_array(&tmp_dir, "nope")
            .err()
            .expect("unexpected open success");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn scan_is_column_major_and_projected() {
        let tmp_dir = temp_testdir::TempDir::default();
        write_array(
            &tmp_dir,
            r#"{
                "cells": [
                    {"row": 1, "column": 120, "end": 200, "fields": {"REF": "T", "GT": [0, 1, 1], "DP": 20}},
                    {"row": 0, "column": 100, "end": 150, "fields": {"REF": "A", "GT": [0, 1, 1], "DP": 10}}
                ]
            }"#,
        );
        let store = JsonArrayStore;
        let mut handle = store.open_array(&tmp_dir, "variants").expect("open failed");
        assert_eq!(
            handle.domain(),
            Some(ArrayDomain {
                rows: CoordRange::new(0, 1),
                columns: CoordRange::new(100, 200),
            })
        );

        let request = ScanRequest {
            attributes: vec![String::from("REF"), String::from("GT")],
            row_ranges: vec![CoordRange::new(0, 10)],
            column_ranges: vec![CoordRange::full()],
            segment_size: 10 << 20,
        };
        let mut stream = handle.scan(&request).expect("scan failed");
        let first = stream.next_cell().expect("pull failed").expect("no cell");
        assert_eq!((first.row, first.column, first.end), (0, 100, 150));
        assert_eq!(
            first
                .fields
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>(),
            vec!["REF", "GT"]
        );
        let second = stream.next_cell().expect("pull failed").expect("no cell");
        assert_eq!(second.row, 1);
        assert!(stream.next_cell().expect("pull failed").is_none());
    }

    #[test]
    fn numbers_encode_little_endian() {
        let buffer = encode_value("GT", &serde_json::json!([0, 1, 1])).expect("encode failed");
        assert_eq!(buffer.elements, 3);
        assert_eq!(
            buffer.data,
            vec![0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]
        );
        let floats = encode_value("QUAL", &serde_json::json!(29.5)).expect("encode failed");
        assert_eq!(floats.elements, 1);
        assert_eq!(floats.data, 29.5f32.to_le_bytes().to_vec());
    }
}

//! Column-major cell scanning on top of the storage contract.

use indexmap::IndexMap;

use crate::err::{Error, Result};
use crate::meta::Metadata;
use crate::query::variant::{Call, FieldValue};
use crate::storage::{ArrayHandle, CellStream, ScanRequest};

/// Iterator over the cells of one scan.
///
/// Cells are pulled lazily from the storage stream and materialize as
/// [`Call`] values with decoded field bags. Delivery order is enforced:
/// `(column, row)` must be strictly increasing, since a callset emits at
/// most one call per starting column.
pub struct CellScanner<'a> {
    stream: Box<dyn CellStream + 'a>,
    meta: &'a Metadata,
    last_key: Option<(u64, u64)>,
    pulled: u64,
}

impl<'a> CellScanner<'a> {
    /// Start a scan over the opened array.
    pub fn open(
        handle: &'a mut dyn ArrayHandle,
        meta: &'a Metadata,
        request: &ScanRequest,
    ) -> Result<Self> {
        let stream = handle.scan(request)?;
        Ok(Self {
            stream,
            meta,
            last_key: None,
            pulled: 0,
        })
    }

    /// Pull the next cell, or `None` at the end of the scan.
    pub fn next(&mut self) -> Result<Option<Call>> {
        let raw = match self.stream.next_cell()? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let key = (raw.column, raw.row);
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(Error::data(
                    raw.row,
                    raw.column,
                    format!(
                        "cell at ({}, {}) delivered after ({}, {})",
                        raw.column, raw.row, last.0, last.1
                    ),
                ));
            }
        }
        self.last_key = Some(key);
        self.pulled += 1;

        let mut fields = IndexMap::with_capacity(raw.fields.len());
        for (name, buffer) in &raw.fields {
            let field_type = self.meta.field_type(name)?;
            fields.insert(name.clone(), FieldValue::decode(name, field_type, buffer)?);
        }
        Ok(Some(Call {
            row: raw.row,
            begin: raw.column,
            end: raw.end,
            fields,
        }))
    }

    /// Number of cells pulled so far.
    pub fn cells_pulled(&self) -> u64 {
        self.pulled
    }

    /// End the scan, releasing the stream.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::common::CoordRange;
    use crate::meta::{CallsetDocument, Metadata, VidDocument};
    use crate::storage::{ArrayDomain, CellStream, FieldBuffer, RawCell, ScanRequest};

    use super::*;

    fn example_metadata() -> Metadata {
        let vid: VidDocument = serde_json::from_str(
            r#"{
                "contigs": [{"name": "chr1", "length": 100000, "offset": 0}],
                "fields": [
                    {"name": "REF", "kind": "char", "length": "var"},
                    {"name": "DP", "kind": "int32", "length": 1}
                ]
            }"#,
        )
        .expect("invalid VID document");
        let callsets: CallsetDocument =
            serde_json::from_str(r#"{"callsets": {"S0": {"row_idx": 0}}}"#)
                .expect("invalid callset document");
        Metadata::from_documents(vid, callsets, "GRCh37").expect("invalid metadata")
    }

    struct FixedStream {
        cells: std::vec::IntoIter<RawCell>,
    }

    impl CellStream for FixedStream {
        fn next_cell(&mut self) -> crate::err::Result<Option<RawCell>> {
            Ok(self.cells.next())
        }
    }

    struct FixedHandle {
        cells: Vec<RawCell>,
    }

    impl ArrayHandle for FixedHandle {
        fn domain(&self) -> Option<ArrayDomain> {
            Some(ArrayDomain {
                rows: CoordRange::new(0, 10),
                columns: CoordRange::new(0, 100000),
            })
        }

        fn scan(
            &mut self,
            _request: &ScanRequest,
        ) -> crate::err::Result<Box<dyn CellStream + '_>> {
            Ok(Box::new(FixedStream {
                cells: self.cells.clone().into_iter(),
            }))
        }

        fn close(self: Box<Self>) -> crate::err::Result<()> {
            Ok(())
        }
    }

    fn raw_cell(row: u64, column: u64) -> RawCell {
        RawCell {
            row,
            column,
            end: column,
            fields: vec![(
                String::from("REF"),
                FieldBuffer {
                    data: b"A".to_vec(),
                    elements: 1,
                },
            )],
        }
    }

    fn request() -> ScanRequest {
        ScanRequest {
            attributes: vec![],
            row_ranges: vec![CoordRange::full()],
            column_ranges: vec![CoordRange::full()],
            segment_size: 10 << 20,
        }
    }

    #[test]
    fn scanner_decodes_cells_in_order() {
        let meta = example_metadata();
        let mut handle = FixedHandle {
            cells: vec![raw_cell(0, 100), raw_cell(1, 100), raw_cell(0, 101)],
        };
        let mut scanner =
            CellScanner::open(&mut handle, &meta, &request()).expect("open failed");
        let mut seen = Vec::new();
        while let Some(call) = scanner.next().expect("pull failed") {
            assert_eq!(call.ref_allele(), Some("A"));
            seen.push((call.begin, call.row));
        }
        assert_eq!(seen, vec![(100, 0), (100, 1), (101, 0)]);
        assert_eq!(scanner.cells_pulled(), 3);
        scanner.close().expect("close failed");
    }

    #[test]
    fn scanner_rejects_out_of_order_cells() {
        let meta = example_metadata();
        let mut handle = FixedHandle {
            cells: vec![raw_cell(1, 100), raw_cell(0, 100)],
        };
        let mut scanner =
            CellScanner::open(&mut handle, &meta, &request()).expect("open failed");
        scanner.next().expect("pull failed");
        let err = scanner.next().expect_err("unexpected in-order delivery");
        assert!(matches!(err, Error::Data { .. }));
    }

    #[test]
    fn scanner_rejects_unknown_fields() {
        let meta = example_metadata();
        let mut cell = raw_cell(0, 100);
        cell.fields[0].0 = String::from("BOGUS");
        let mut handle = FixedHandle { cells: vec![cell] };
        let mut scanner =
            CellScanner::open(&mut handle, &meta, &request()).expect("open failed");
        assert!(matches!(
            scanner.next(),
            Err(Error::Schema { .. })
        ));
    }
}

//! Interval reconciliation: splitting overlapping per-sample calls into
//! maximal column intervals with constant call membership.

use std::rc::Rc;

use crate::err::{Error, Result};
use crate::query::variant::{Call, ColumnInterval};

/// One reconciled variant: a column interval plus the calls covering it.
///
/// Call entries carry a stable id so downstream consumers can recognize a
/// call that spans several reconciled intervals; field bags are shared by
/// reference.
#[derive(Debug, Clone)]
pub struct ReconciledVariant {
    /// The reconciled column interval.
    pub interval: ColumnInterval,
    /// Participating calls, ascending by row.
    pub calls: Vec<(u64, Rc<Call>)>,
}

#[derive(Debug)]
struct ActiveCall {
    id: u64,
    call: Rc<Call>,
}

/// Sweeping reconciler over a column-major cell stream.
///
/// Cells must arrive with non-decreasing start columns (the scan order).
/// A variant boundary is crossed at every new start column and directly
/// after every closing `END`.
#[derive(Debug, Default)]
pub struct Reconciler {
    active: Vec<ActiveCall>,
    start: u64,
    next_id: u64,
}

impl Reconciler {
    /// Create an empty reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next cell, appending any completed variants to `out`.
    pub fn push(&mut self, call: Call, out: &mut Vec<ReconciledVariant>) -> Result<()> {
        if call.end < call.begin {
            return Err(Error::data(
                call.row,
                call.begin,
                format!("END {} precedes interval start", call.end),
            ));
        }

        self.flush_before(call.begin, out);
        if self.active.is_empty() {
            self.start = call.begin;
        } else if call.begin > self.start {
            // Boundary rule 1: a start column not already covered.
            out.push(self.emit(self.start, call.begin - 1));
            self.start = call.begin;
        }

        let position = self
            .active
            .partition_point(|active| active.call.row < call.row);
        if self
            .active
            .get(position)
            .is_some_and(|active| active.call.row == call.row)
        {
            return Err(Error::data(
                call.row,
                call.begin,
                "overlapping call intervals within one callset",
            ));
        }
        self.active.insert(
            position,
            ActiveCall {
                id: self.next_id,
                call: Rc::new(call),
            },
        );
        self.next_id += 1;
        Ok(())
    }

    /// Drain the remaining active calls at the end of the stream.
    pub fn finish(&mut self, out: &mut Vec<ReconciledVariant>) {
        self.flush_before(u64::MAX, out);
    }

    /// Emit all segments that end strictly before `column`.
    fn flush_before(&mut self, column: u64, out: &mut Vec<ReconciledVariant>) {
        while !self.active.is_empty() {
            let min_end = self
                .active
                .iter()
                .map(|active| active.call.end)
                .min()
                .expect("active set is non-empty");
            if min_end >= column {
                break;
            }
            // Boundary rules 2 and 3: a closing END splits here.
            out.push(self.emit(self.start, min_end));
            self.active.retain(|active| active.call.end > min_end);
            self.start = min_end + 1;
        }
    }

    fn emit(&self, lo: u64, hi: u64) -> ReconciledVariant {
        debug_assert!(lo <= hi);
        ReconciledVariant {
            interval: ColumnInterval { lo, hi },
            calls: self
                .active
                .iter()
                .map(|active| (active.id, Rc::clone(&active.call)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::query::variant::FieldValue;

    use super::*;

    fn call(row: u64, begin: u64, end: u64) -> Call {
        Call {
            row,
            begin,
            end,
            fields: IndexMap::new(),
        }
    }

    fn reconcile(cells: Vec<Call>) -> Vec<ReconciledVariant> {
        let mut reconciler = Reconciler::new();
        let mut out = Vec::new();
        for cell in cells {
            reconciler.push(cell, &mut out).expect("push failed");
        }
        reconciler.finish(&mut out);
        out
    }

    fn rows(variant: &ReconciledVariant) -> Vec<u64> {
        variant.calls.iter().map(|(_, call)| call.row).collect()
    }

    #[test]
    fn single_cell_round_trips() {
        let out = reconcile(vec![call(0, 100, 100)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].interval, ColumnInterval { lo: 100, hi: 100 });
        assert_eq!(rows(&out[0]), vec![0]);
    }

    #[test]
    fn overlapping_calls_split_into_three() {
        let out = reconcile(vec![call(0, 100, 150), call(1, 120, 200)]);
        let intervals = out
            .iter()
            .map(|v| (v.interval.lo, v.interval.hi))
            .collect::<Vec<_>>();
        assert_eq!(intervals, vec![(100, 119), (120, 150), (151, 200)]);
        assert_eq!(rows(&out[0]), vec![0]);
        assert_eq!(rows(&out[1]), vec![0, 1]);
        assert_eq!(rows(&out[2]), vec![1]);
    }

    #[test]
    fn non_ref_block_is_split_by_inner_snv() {
        let mut block = call(0, 1000, 2000);
        block
            .fields
            .insert(String::from("ALT"), FieldValue::Text(String::from("<NON_REF>")));
        let out = reconcile(vec![block, call(1, 1500, 1500)]);
        let intervals = out
            .iter()
            .map(|v| (v.interval.lo, v.interval.hi))
            .collect::<Vec<_>>();
        assert_eq!(intervals, vec![(1000, 1499), (1500, 1500), (1501, 2000)]);
        // The middle variant carries both the SNV and the covering block.
        assert_eq!(rows(&out[1]), vec![0, 1]);
        assert_eq!(
            out[1].calls[0]
                .1
                .fields
                .get("ALT")
                .and_then(FieldValue::as_text),
            Some("<NON_REF>")
        );
    }

    #[test]
    fn adjacent_start_does_not_emit_zero_width() {
        let out = reconcile(vec![call(0, 100, 120), call(1, 121, 130)]);
        let intervals = out
            .iter()
            .map(|v| (v.interval.lo, v.interval.hi))
            .collect::<Vec<_>>();
        assert_eq!(intervals, vec![(100, 120), (121, 130)]);
    }

    #[test]
    fn consecutive_variants_do_not_overlap() {
        let out = reconcile(vec![
            call(0, 100, 150),
            call(1, 110, 160),
            call(2, 140, 145),
        ]);
        for pair in out.windows(2) {
            assert!(pair[0].interval.hi < pair[1].interval.lo);
        }
        for variant in &out {
            for (_, c) in &variant.calls {
                assert!(c.begin <= variant.interval.lo);
                assert!(c.end >= variant.interval.hi);
            }
        }
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut reconciler = Reconciler::new();
        let mut out = Vec::new();
        let err = reconciler
            .push(call(0, 100, 99), &mut out)
            .expect_err("unexpected push success");
        assert!(matches!(err, Error::Data { .. }));
    }

    #[test]
    fn same_row_overlap_is_rejected() {
        let mut reconciler = Reconciler::new();
        let mut out = Vec::new();
        reconciler.push(call(0, 100, 200), &mut out).expect("push failed");
        let err = reconciler
            .push(call(0, 150, 160), &mut out)
            .expect_err("unexpected push success");
        assert!(matches!(err, Error::Data { .. }));
    }
}

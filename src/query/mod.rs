//! Query engine: planning, scanning, reconciliation, and the result surfaces.

pub mod config;
pub mod reconcile;
pub mod scan;
pub mod variant;

use std::io::Write;

use indexmap::IndexMap;

use crate::common::clamp_ranges;
use crate::err::{Error, Result};
use crate::meta::Metadata;
use crate::storage::{ArrayDomain, ArrayStore, ScanRequest};

use self::config::{QueryConfig, ResolvedQuery};
use self::reconcile::{ReconciledVariant, Reconciler};
use self::scan::CellScanner;
use self::variant::{
    CallContext, ColumnInterval, FieldValue, VariantProcessor, VariantSet, VariantSetBuilder,
};

/// The query engine for one rank's slice of a configuration.
///
/// Construction loads the workspace metadata once; the engine is then
/// immutable and every query runs against the same snapshot.
pub struct VariantQueryEngine {
    store: Box<dyn ArrayStore>,
    meta: Metadata,
    query: ResolvedQuery,
}

impl VariantQueryEngine {
    /// Build an engine from a parsed configuration and a concurrency rank.
    pub fn new(store: Box<dyn ArrayStore>, config: &QueryConfig, rank: u32) -> Result<Self> {
        let query = config.resolve(rank)?;
        let meta = Metadata::load(
            &query.vid_mapping_file,
            &query.callset_mapping_file,
            &query.reference_genome,
        )?;
        Ok(Self { store, meta, query })
    }

    /// The version string of the worker.
    pub fn version() -> &'static str {
        crate::common::worker_version()
    }

    /// The metadata resolver of this engine.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /// The resolved query slice of this engine.
    pub fn query(&self) -> &ResolvedQuery {
        &self.query
    }

    /// The `(row, sample)` pairs this query can touch, ascending by row.
    pub fn samples(&self) -> Vec<(u64, String)> {
        self.meta
            .rows()
            .filter(|(row, _)| {
                self.query.row_ranges.is_empty()
                    || self.query.row_ranges.iter().any(|range| range.contains(*row))
            })
            .map(|(row, sample)| (row, sample.to_string()))
            .collect()
    }

    /// Approximate upper bound on the number of cells one scan can touch.
    ///
    /// Computed from range widths; sparse arrays will see fewer cells.
    pub fn total_expected_cells(&self) -> u64 {
        let rows: u64 = if self.query.row_ranges.is_empty() {
            self.meta.rows().count() as u64
        } else {
            self.query
                .row_ranges
                .iter()
                .fold(0u64, |acc, range| acc.saturating_add(range.width()))
        };
        let columns = self
            .query
            .column_ranges
            .iter()
            .fold(0u64, |acc, range| acc.saturating_add(range.width()));
        rows.saturating_mul(columns)
    }

    /// Materialize all reconciled variants of the configured query.
    pub fn query_variants(&self) -> Result<VariantSet> {
        let mut builder = VariantSetBuilder::default();
        self.for_each_variant(&mut |variant| {
            builder.push_variant(variant.interval, &variant.calls);
            Ok(())
        })?;
        Ok(builder.finish())
    }

    /// Stream reconciled variants and their calls into a processor.
    pub fn query_variant_calls(&self, processor: &mut dyn VariantProcessor) -> Result<()> {
        processor.initialize(self.meta.field_types())?;
        self.for_each_variant(&mut |variant| {
            processor.process_interval(variant.interval)?;
            for (_, call) in &variant.calls {
                let sample = self.meta.row_to_sample(call.row)?;
                let genomic = self.meta.column_interval_to_genomic(call.begin, call.end)?;
                processor.process_call(&CallContext {
                    sample,
                    row: call.row,
                    column: call.begin,
                    end: call.end,
                    genomic,
                    fields: &call.fields,
                })?;
            }
            Ok(())
        })?;
        processor.finish()
    }

    /// Stream reconciled variants into a VCF document on `writer`.
    pub fn generate_vcf<W: Write>(&self, writer: W) -> Result<()> {
        let mut emitter = crate::export::vcf::VcfEmitter::new(self, writer)?;
        self.query_variant_calls(&mut emitter)
    }

    /// Emit the PLINK family of outputs (TPED/TFAM, BED/BIM/FAM, BGEN).
    pub fn generate_ped_map(&self, options: &crate::export::plink::PlinkOptions) -> Result<()> {
        let mut emitter = crate::export::plink::PlinkEmitter::new(self, options)?;
        self.query_variant_calls(&mut emitter)?;
        emitter.advance_state()?;
        self.query_variant_calls(&mut emitter)?;
        emitter.finalize()
    }

    /// Build the scan request for this query, clamped to the array domain.
    fn scan_request(&self, domain: &ArrayDomain) -> Option<ScanRequest> {
        let row_ranges = if self.query.row_ranges.is_empty() {
            vec![domain.rows]
        } else {
            clamp_ranges(&self.query.row_ranges, &domain.rows)
        };
        let column_ranges = clamp_ranges(&self.query.column_ranges, &domain.columns);
        if row_ranges.is_empty() || column_ranges.is_empty() {
            return None;
        }
        Some(ScanRequest {
            attributes: self.query.attributes.clone(),
            row_ranges,
            column_ranges,
            segment_size: self.query.segment_size,
        })
    }

    fn for_each_variant(
        &self,
        sink: &mut dyn FnMut(ReconciledVariant) -> Result<()>,
    ) -> Result<()> {
        let mut handle = self
            .store
            .open_array(&self.query.workspace, &self.query.array)?;
        let Some(domain) = handle.domain() else {
            return handle.close();
        };
        let Some(request) = self.scan_request(&domain) else {
            // Empty intersection with the domain: no fragments are opened.
            return handle.close();
        };

        let mut reconciler = Reconciler::new();
        let mut pending = Vec::new();
        {
            let mut scanner = CellScanner::open(handle.as_mut(), &self.meta, &request)?;
            while let Some(cell) = scanner.next()? {
                reconciler.push(cell, &mut pending)?;
                for variant in pending.drain(..) {
                    sink(variant)?;
                }
            }
            scanner.close()?;
        }
        reconciler.finish(&mut pending);
        for variant in pending.drain(..) {
            sink(variant)?;
        }
        handle.close()
    }
}

/// Command line arguments for `query variants`.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Materialize reconciled variants", long_about = None)]
pub struct VariantsArgs {
    /// Path to the query configuration JSON file.
    #[arg(long)]
    pub path_config: String,
    /// Concurrency rank to run as.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Path to the JSONL output file.
    #[arg(long)]
    pub path_output: String,
}

/// One reconciled variant in the JSONL output.
#[derive(Debug, serde::Serialize)]
struct VariantRecordOut {
    /// Contig of the reconciled interval.
    contig: String,
    /// First genomic position, 1-based.
    start: u64,
    /// Last genomic position, 1-based inclusive.
    end: u64,
    /// Participating calls, ascending by row.
    calls: Vec<CallRecordOut>,
}

/// One call in the JSONL output.
#[derive(Debug, serde::Serialize)]
struct CallRecordOut {
    /// Sample name.
    sample: String,
    /// Array row of the callset.
    row: u64,
    /// First genomic position of the call, 1-based.
    start: u64,
    /// Last genomic position of the call, 1-based inclusive.
    end: u64,
    /// Decoded fields of the call.
    fields: IndexMap<String, FieldValue>,
}

/// Main entry point for `query variants`.
pub fn run_variants(args_common: &crate::common::Args, args: &VariantsArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let config = QueryConfig::from_json_file(&args.path_config)?;
    let engine = VariantQueryEngine::new(
        Box::new(crate::storage::json::JsonArrayStore),
        &config,
        args.rank,
    )?;

    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(&args.path_output)
            .map_err(|e| anyhow::anyhow!("could not create {}: {}", &args.path_output, e))?,
    );

    let mut result = engine.query_variants()?;
    tracing::info!("query produced {} variant(s)", result.size());
    while let Some(variant) = result.next()? {
        let interval = variant.interval();
        let genomic = engine
            .metadata()
            .column_interval_to_genomic(interval.lo, interval.hi)?;
        let record = VariantRecordOut {
            contig: genomic.contig,
            start: genomic.lo,
            end: genomic.hi,
            calls: variant
                .calls()
                .map(|call| {
                    let genomic = engine
                        .metadata()
                        .column_interval_to_genomic(call.begin, call.end)?;
                    Ok(CallRecordOut {
                        sample: engine.metadata().row_to_sample(call.row)?.to_string(),
                        row: call.row,
                        start: genomic.lo,
                        end: genomic.hi,
                        fields: call.fields.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        serde_json::to_writer(&mut writer, &record)
            .map_err(|e| anyhow::anyhow!("could not serialize record: {}", e))?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    result.free()?;

    Ok(())
}

/// Command line arguments for `query calls`.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Stream per-cell call records", long_about = None)]
pub struct CallsArgs {
    /// Path to the query configuration JSON file.
    #[arg(long)]
    pub path_config: String,
    /// Concurrency rank to run as.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Path to the JSONL output file.
    #[arg(long)]
    pub path_output: String,
}

/// Processor writing one JSONL record per call.
struct JsonlCallWriter<W: Write> {
    writer: W,
    current_interval: Option<ColumnInterval>,
}

impl<W: Write> VariantProcessor for JsonlCallWriter<W> {
    fn process_interval(&mut self, interval: ColumnInterval) -> Result<()> {
        self.current_interval = Some(interval);
        Ok(())
    }

    fn process_call(&mut self, call: &CallContext<'_>) -> Result<()> {
        let interval = self
            .current_interval
            .ok_or_else(|| Error::state("process_call before process_interval"))?;
        let record = serde_json::json!({
            "sample": call.sample,
            "row": call.row,
            "variant_interval": {"lo": interval.lo, "hi": interval.hi},
            "contig": call.genomic.contig,
            "start": call.genomic.lo,
            "end": call.genomic.hi,
            "fields": call.fields,
        });
        serde_json::to_writer(&mut self.writer, &record).map_err(|e| {
            Error::io(
                "call record output",
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| Error::io("call record output", e))
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::io("call record output", e))
    }
}

/// Main entry point for `query calls`.
pub fn run_calls(args_common: &crate::common::Args, args: &CallsArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let config = QueryConfig::from_json_file(&args.path_config)?;
    let engine = VariantQueryEngine::new(
        Box::new(crate::storage::json::JsonArrayStore),
        &config,
        args.rank,
    )?;
    let writer = std::io::BufWriter::new(
        std::fs::File::create(&args.path_output)
            .map_err(|e| anyhow::anyhow!("could not create {}: {}", &args.path_output, e))?,
    );
    let mut processor = JsonlCallWriter {
        writer,
        current_interval: None,
    };
    engine.query_variant_calls(&mut processor)?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use super::config::QueryConfig;

    /// Write a small two-sample workspace and return its configuration.
    ///
    /// Cells (row, column..=end): `(0, 100..=100)` SNV `A->C` het phased,
    /// `(1, 100..=100)` SNV `A->T` het unphased, `(0, 1000..=2000)` gVCF
    /// block, `(1, 1500..=1500)` SNV `G->C` hom-alt.
    pub(crate) fn fixture_workspace(dir: &Path) -> QueryConfig {
        let ws = dir.join("ws");
        std::fs::create_dir_all(ws.join("variants")).expect("mkdir failed");
        std::fs::write(
            ws.join("variants").join("array.json"),
            r#"{
                "cells": [
                    {"row": 0, "column": 100, "fields":
                        {"REF": "A", "ALT": "C", "GT": [0, 1, 1], "DP": 20, "QUAL": 60.0}},
                    {"row": 1, "column": 100, "fields":
                        {"REF": "A", "ALT": "T", "GT": [0, 0, 1], "DP": 10, "QUAL": 30.0}},
                    {"row": 0, "column": 1000, "end": 2000, "fields":
                        {"REF": "G", "ALT": "<NON_REF>", "GT": [0, 0, 0], "DP": 15}},
                    {"row": 1, "column": 1500, "fields":
                        {"REF": "G", "ALT": "C|<NON_REF>", "GT": [1, 0, 1], "DP": 25, "QUAL": 99.0}}
                ]
            }"#,
        )
        .expect("write array failed");
        std::fs::write(
            dir.join("vid.json"),
            r#"{
                "contigs": [
                    {"name": "chr1", "length": 100000, "offset": 0},
                    {"name": "chr2", "length": 50000, "offset": 100000}
                ],
                "fields": [
                    {"name": "REF", "kind": "char", "length": "var"},
                    {"name": "ALT", "kind": "char", "length": "var"},
                    {"name": "GT", "kind": "int32", "length": "var", "phased": true},
                    {"name": "DP", "kind": "int32", "length": 1},
                    {"name": "QUAL", "kind": "float32", "length": 1}
                ]
            }"#,
        )
        .expect("write vid failed");
        std::fs::write(
            dir.join("callset.json"),
            r#"{"callsets": {"NA12878": {"row_idx": 0}, "NA12879": {"row_idx": 1}}}"#,
        )
        .expect("write callset failed");

        QueryConfig::from_json_str(&format!(
            r#"{{
                "workspace": {:?},
                "array_name": "variants",
                "vid_mapping_file": {:?},
                "callset_mapping_file": {:?},
                "reference_genome": "GRCh37"
            }}"#,
            ws.to_str().expect("invalid path"),
            dir.join("vid.json").to_str().expect("invalid path"),
            dir.join("callset.json").to_str().expect("invalid path"),
        ))
        .expect("invalid fixture config")
    }

    pub(crate) fn fixture_engine(dir: &Path, rank: u32) -> super::VariantQueryEngine {
        let config = fixture_workspace(dir);
        super::VariantQueryEngine::new(
            Box::new(crate::storage::json::JsonArrayStore),
            &config,
            rank,
        )
        .expect("engine construction failed")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::query::variant::FieldValue;

    use super::*;

    #[test]
    fn version_is_stable_in_tests() {
        assert_eq!(VariantQueryEngine::version(), "x.y.z");
    }

    #[test]
    fn query_variants_reconciles_fixture() {
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);

        let set = engine.query_variants().expect("query failed");
        // Site 100 plus the gVCF block split by the SNV at 1500.
        assert_eq!(set.size(), 4);

        let first = set.at(0).expect("index failed");
        assert_eq!(first.interval(), ColumnInterval { lo: 100, hi: 100 });
        assert_eq!(first.call_count(), 2);

        let inner = set.at(2).expect("index failed");
        assert_eq!(inner.interval(), ColumnInterval { lo: 1500, hi: 1500 });
        let alts = inner
            .calls()
            .map(|call| call.fields["ALT"].as_text().expect("no ALT").to_string())
            .collect::<Vec<_>>();
        assert_eq!(alts, vec!["<NON_REF>", "C|<NON_REF>"]);
    }

    #[test]
    fn exact_range_round_trips_single_cell() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut config = testing::fixture_workspace(&tmp_dir);
        config.row_ranges = vec![vec![crate::common::CoordRange::new(0, 0)]];
        config.column_ranges = vec![vec![crate::common::CoordRange::new(1000, 2000)]];
        let engine = VariantQueryEngine::new(
            Box::new(crate::storage::json::JsonArrayStore),
            &config,
            0,
        )
        .expect("engine construction failed");

        let set = engine.query_variants().expect("query failed");
        assert_eq!(set.size(), 1);
        let only = set.at(0).expect("index failed");
        assert_eq!(only.interval(), ColumnInterval { lo: 1000, hi: 2000 });
        let call = only.calls().next().expect("no call");
        assert_eq!(call.fields["DP"], FieldValue::Int32(vec![15]));
        assert_eq!(call.fields["ALT"], FieldValue::Text(String::from("<NON_REF>")));
    }

    #[test]
    fn empty_intersection_yields_empty_result() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut config = testing::fixture_workspace(&tmp_dir);
        config.column_ranges = vec![vec![crate::common::CoordRange::new(90000, 95000)]];
        let engine = VariantQueryEngine::new(
            Box::new(crate::storage::json::JsonArrayStore),
            &config,
            0,
        )
        .expect("engine construction failed");
        let set = engine.query_variants().expect("query failed");
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn two_ranks_split_rows_disjointly() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut config = testing::fixture_workspace(&tmp_dir);
        config.row_ranges = vec![
            vec![crate::common::CoordRange::new(0, 0)],
            vec![crate::common::CoordRange::new(1, 1)],
        ];
        let mut all_samples = Vec::new();
        for rank in 0..2 {
            let engine = VariantQueryEngine::new(
                Box::new(crate::storage::json::JsonArrayStore),
                &config,
                rank,
            )
            .expect("engine construction failed");
            all_samples.extend(engine.samples().into_iter().map(|(_, name)| name));
        }
        all_samples.sort();
        all_samples.dedup();
        assert_eq!(all_samples, vec!["NA12878", "NA12879"]);
    }

    #[test]
    fn processor_sees_intervals_before_calls() {
        struct Recording {
            events: Vec<String>,
        }

        impl VariantProcessor for Recording {
            fn process_interval(&mut self, interval: ColumnInterval) -> crate::err::Result<()> {
                self.events.push(format!("interval:{}-{}", interval.lo, interval.hi));
                Ok(())
            }

            fn process_call(&mut self, call: &CallContext<'_>) -> crate::err::Result<()> {
                self.events.push(format!("call:{}@{}", call.sample, call.row));
                Ok(())
            }
        }

        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let mut processor = Recording { events: Vec::new() };
        engine
            .query_variant_calls(&mut processor)
            .expect("query failed");
        assert_eq!(
            processor.events,
            vec![
                "interval:100-100",
                "call:NA12878@0",
                "call:NA12879@1",
                "interval:1000-1499",
                "call:NA12878@0",
                "interval:1500-1500",
                "call:NA12878@0",
                "call:NA12879@1",
                "interval:1501-2000",
                "call:NA12878@0",
            ]
        );
    }
}

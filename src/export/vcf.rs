//! Streaming VCF emission for reconciled variants.
//!
//! The emitter consumes the processor-mode surface and composes one VCF
//! record per reconciled variant: REF/ALT are merged across the
//! participating calls (union of distinct ALTs, `<NON_REF>` last) and each
//! call's genotype is remapped onto the merged allele list.

use std::collections::HashMap;
use std::io::Write;

use indexmap::IndexMap;
use noodles::vcf::{
    self,
    header::record::value::map::{format, info, Contig, Filter, Format, Info, Map},
    variant::io::Write as VariantWrite,
    variant::record::samples::keys::key,
};

use crate::err::{Error, Result};
use crate::meta::{FieldKind, FieldLength, FieldType, Metadata, FIELD_ALT, FIELD_FILTER, FIELD_GT, FIELD_QUAL, FIELD_REF};
use crate::query::variant::{
    split_alt, CallContext, ColumnInterval, FieldValue, Genotype, VariantProcessor, NON_REF_TOKEN,
};
use crate::query::VariantQueryEngine;

/// INFO key for the inclusive end position of gVCF blocks.
const INFO_END: &str = "END";

/// A call buffered for the variant record under construction.
#[derive(Debug)]
struct BufferedCall {
    row: u64,
    fields: IndexMap<String, FieldValue>,
}

/// Processor that writes one VCF record per reconciled variant.
pub struct VcfEmitter<W: Write> {
    writer: vcf::io::Writer<W>,
    meta: Metadata,
    samples: Vec<(u64, String)>,
    sample_index_by_row: HashMap<u64, usize>,
    header: Option<vcf::Header>,
    format_fields: Vec<String>,
    gt_phase_capable: bool,
    pending: Option<(ColumnInterval, Vec<BufferedCall>)>,
}

impl<W: Write> VcfEmitter<W> {
    /// Create an emitter for the engine's sample set, writing to `writer`.
    pub fn new(engine: &VariantQueryEngine, writer: W) -> Result<Self> {
        let samples = engine.samples();
        let sample_index_by_row = samples
            .iter()
            .enumerate()
            .map(|(idx, (row, _))| (*row, idx))
            .collect();
        Ok(Self {
            writer: vcf::io::Writer::new(writer),
            meta: engine.metadata().clone(),
            samples,
            sample_index_by_row,
            header: None,
            format_fields: Vec::new(),
            gt_phase_capable: false,
            pending: None,
        })
    }

    fn build_header(&self, field_types: &IndexMap<String, FieldType>) -> Result<vcf::Header> {
        let mut builder = vcf::Header::builder();

        for contig in self.meta.contigs() {
            builder = builder.add_contig(
                contig.name.clone(),
                Map::<Contig>::builder()
                    .set_length(contig.length as usize)
                    .build()
                    .map_err(|e| Error::config(format!("invalid contig record: {}", e)))?,
            );
        }

        builder = builder.add_info(
            INFO_END,
            Map::<Info>::builder()
                .set_number(info::Number::Count(1))
                .set_type(info::Type::Integer)
                .set_description("End position of the longest variant or block")
                .build()
                .map_err(|e| Error::config(format!("invalid INFO record: {}", e)))?,
        );
        builder = builder.add_filter("PASS", Map::<Filter>::pass());

        builder = builder.add_format(
            key::GENOTYPE,
            Map::<Format>::builder()
                .set_number(format::Number::Count(1))
                .set_type(format::Type::String)
                .set_description("Genotype")
                .build()
                .map_err(|e| Error::config(format!("invalid FORMAT record: {}", e)))?,
        );
        for name in &self.format_fields {
            let field_type = field_types
                .get(name)
                .ok_or_else(|| Error::schema(name, "unknown FORMAT field"))?;
            let number = match field_type.length {
                FieldLength::Fixed(n) => format::Number::Count(n),
                FieldLength::Variable => format::Number::Unknown,
            };
            let ty = match field_type.kind {
                FieldKind::Int32 => format::Type::Integer,
                FieldKind::Float32 => format::Type::Float,
                FieldKind::Char | FieldKind::String => format::Type::String,
            };
            builder = builder.add_format(
                name.clone(),
                Map::<Format>::builder()
                    .set_number(number)
                    .set_type(ty)
                    .set_description(format!("Field {} from the variant array", name))
                    .build()
                    .map_err(|e| Error::config(format!("invalid FORMAT record: {}", e)))?,
            );
        }

        if !self.meta.reference_genome().is_empty() {
            builder = builder
                .insert(
                    "reference"
                        .parse()
                        .map_err(|_| Error::config("invalid key: reference"))?,
                    vcf::header::record::Value::from(self.meta.reference_genome()),
                )
                .map_err(|e| Error::config(format!("invalid reference record: {}", e)))?;
        }

        let sample_names = self
            .samples
            .iter()
            .map(|(_, name)| name.clone())
            .collect::<indexmap::IndexSet<_>>();
        builder = builder.set_sample_names(sample_names);

        Ok(builder.build())
    }

    /// Merge the buffered calls into one record and write it out.
    fn flush_pending(&mut self) -> Result<()> {
        let Some((interval, calls)) = self.pending.take() else {
            return Ok(());
        };
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::state("emitter was not initialized"))?;

        let genomic = self
            .meta
            .column_interval_to_genomic(interval.lo, interval.hi)?;

        // REF from the first call carrying one; ALT as the union of distinct
        // alternate alleles with the symbolic non-ref token last.
        let reference = calls
            .iter()
            .find_map(|call| {
                call.fields
                    .get(FIELD_REF)
                    .and_then(FieldValue::as_text)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| String::from("N"));
        let mut alts: Vec<String> = Vec::new();
        for call in &calls {
            if let Some(value) = call.fields.get(FIELD_ALT) {
                for alt in split_alt(value) {
                    if !alts.contains(&alt) {
                        alts.push(alt);
                    }
                }
            }
        }
        if let Some(pos) = alts.iter().position(|alt| alt == NON_REF_TOKEN) {
            let non_ref = alts.remove(pos);
            alts.push(non_ref);
        }

        let quality = calls
            .iter()
            .filter_map(|call| call.fields.get(FIELD_QUAL).and_then(FieldValue::as_float))
            .fold(None, |acc: Option<f32>, q| {
                Some(acc.map_or(q, |best| best.max(q)))
            });
        let mut filters: Vec<String> = Vec::new();
        for call in &calls {
            if let Some(value) = call.fields.get(FIELD_FILTER).and_then(FieldValue::as_text) {
                for token in value.split(';').filter(|token| !token.is_empty()) {
                    if !filters.iter().any(|seen| seen == token) {
                        filters.push(token.to_string());
                    }
                }
            }
        }

        let mut builder = vcf::variant::record_buf::builder::Builder::default()
            .set_reference_sequence_name(genomic.contig.clone())
            .set_variant_start(
                noodles::core::Position::try_from(genomic.lo as usize)
                    .map_err(|e| Error::config(format!("invalid position {}: {}", genomic.lo, e)))?,
            )
            .set_reference_bases(reference)
            .set_alternate_bases(vcf::variant::record_buf::AlternateBases::from(alts.clone()));
        if let Some(quality) = quality {
            builder = builder.set_quality_score(quality);
        }
        if !filters.is_empty() {
            builder = builder.set_filters(filters.into_iter().collect());
        }
        if genomic.hi > genomic.lo {
            let mut info: vcf::variant::record_buf::Info = Default::default();
            info.insert(
                String::from(INFO_END),
                Some(vcf::variant::record_buf::info::field::Value::Integer(
                    genomic.hi as i32,
                )),
            );
            builder = builder.set_info(info);
        }

        let keys: vcf::variant::record_buf::samples::Keys =
            std::iter::once(String::from(FIELD_GT))
                .chain(self.format_fields.iter().cloned())
                .collect();
        let mut values =
            vec![vec![None; 1 + self.format_fields.len()]; self.samples.len()];
        for call in &calls {
            let Some(&sample_idx) = self.sample_index_by_row.get(&call.row) else {
                continue;
            };
            let row_values = &mut values[sample_idx];
            row_values[0] = self
                .genotype_string(call, &alts)?
                .map(vcf::variant::record_buf::samples::sample::Value::String);
            for (slot, name) in self.format_fields.iter().enumerate() {
                row_values[1 + slot] = call.fields.get(name).map(field_to_sample_value);
            }
        }
        let samples = vcf::variant::record_buf::samples::Samples::new(keys, values);
        let record = builder.set_samples(samples).build();

        self.writer
            .write_variant_record(header, &record)
            .map_err(|e| Error::io("VCF output", e))
    }

    /// Remap a call's genotype onto the merged allele list.
    fn genotype_string(&self, call: &BufferedCall, merged_alts: &[String]) -> Result<Option<String>> {
        let Some(value) = call.fields.get(FIELD_GT) else {
            return Ok(None);
        };
        let genotype = Genotype::from_field(value, self.gt_phase_capable)?;
        if genotype.alleles.is_empty() {
            return Ok(None);
        }
        let own_alts = call
            .fields
            .get(FIELD_ALT)
            .map(split_alt)
            .unwrap_or_default();
        let separator = if genotype.phased { '|' } else { '/' };
        let mut rendered = String::new();
        for (slot, allele) in genotype.alleles.iter().enumerate() {
            if slot > 0 {
                rendered.push(separator);
            }
            match allele {
                None => rendered.push('.'),
                Some(0) => rendered.push('0'),
                Some(idx) => {
                    let name = own_alts.get(*idx as usize - 1).ok_or_else(|| {
                        Error::data(
                            call.row,
                            0,
                            format!("allele index {} exceeds the ALT list", idx),
                        )
                    })?;
                    let merged_idx = merged_alts
                        .iter()
                        .position(|alt| alt == name)
                        .expect("merged ALT list is a union");
                    rendered.push_str(&(merged_idx + 1).to_string());
                }
            }
        }
        Ok(Some(rendered))
    }
}

fn field_to_sample_value(value: &FieldValue) -> vcf::variant::record_buf::samples::sample::Value {
    use vcf::variant::record_buf::samples::sample::Value;
    match value {
        FieldValue::Int32(values) if values.len() == 1 => Value::Integer(values[0]),
        FieldValue::Int32(values) => Value::Array(
            vcf::variant::record_buf::samples::sample::value::Array::Integer(
                values.iter().copied().map(Some).collect(),
            ),
        ),
        FieldValue::Float32(values) if values.len() == 1 => Value::Float(values[0]),
        FieldValue::Float32(values) => Value::Array(
            vcf::variant::record_buf::samples::sample::value::Array::Float(
                values.iter().copied().map(Some).collect(),
            ),
        ),
        FieldValue::Text(text) => Value::String(text.clone()),
    }
}

impl<W: Write> VariantProcessor for VcfEmitter<W> {
    fn initialize(&mut self, field_types: &IndexMap<String, FieldType>) -> Result<()> {
        self.gt_phase_capable = field_types
            .get(FIELD_GT)
            .map(|field_type| field_type.phased)
            .unwrap_or_default();
        self.format_fields = field_types
            .keys()
            .filter(|name| {
                ![FIELD_REF, FIELD_ALT, FIELD_GT, FIELD_QUAL, FIELD_FILTER]
                    .contains(&name.as_str())
            })
            .cloned()
            .collect();
        let header = self.build_header(field_types)?;
        self.writer
            .write_header(&header)
            .map_err(|e| Error::io("VCF output", e))?;
        self.header = Some(header);
        Ok(())
    }

    fn process_interval(&mut self, interval: ColumnInterval) -> Result<()> {
        self.flush_pending()?;
        self.pending = Some((interval, Vec::new()));
        Ok(())
    }

    fn process_call(&mut self, call: &CallContext<'_>) -> Result<()> {
        let (_, calls) = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::state("process_call before process_interval"))?;
        calls.push(BufferedCall {
            row: call.row,
            fields: call.fields.clone(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_pending()
    }
}

/// Command line arguments for `export vcf`.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Export reconciled variants as VCF", long_about = None)]
pub struct Args {
    /// Path to the query configuration JSON file.
    #[arg(long)]
    pub path_config: String,
    /// Concurrency rank to run as.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Path to the output VCF file.
    #[arg(long)]
    pub path_output: String,
}

/// Main entry point for `export vcf`.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let config = crate::query::config::QueryConfig::from_json_file(&args.path_config)?;
    let engine = VariantQueryEngine::new(
        Box::new(crate::storage::json::JsonArrayStore),
        &config,
        args.rank,
    )?;
    let writer = std::io::BufWriter::new(
        std::fs::File::create(&args.path_output)
            .map_err(|e| anyhow::anyhow!("could not create {}: {}", &args.path_output, e))?,
    );
    engine.generate_vcf(writer)?;

    Ok(())
}

//! Two-pass emission of the PLINK output family: TPED/TFAM, BED/BIM/FAM,
//! and BGEN v1.2.
//!
//! The scan delivers cells column by column while the PLINK formats want a
//! sample-by-variant matrix, so the emitter runs the same query twice. The
//! first pass enumerates the participating samples and variants; the second
//! pass emits one matrix row per variant. Headers whose counts are only
//! known later are written with placeholders and patched during
//! finalization.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;

use crate::err::{Error, Result};
use crate::meta::{FieldType, Metadata, FIELD_ALT, FIELD_GT, FIELD_REF};
use crate::query::variant::{
    split_alt, CallContext, ColumnInterval, FieldValue, Genotype, VariantProcessor, NON_REF_TOKEN,
};
use crate::query::VariantQueryEngine;
use crate::storage::codec::{create_codec, Codec, CodecKind};

use super::bgen::{
    compression_flag, GenotypeBlockBuilder, BGEN_MAGIC, HEADER_LENGTH, LAYOUT_VERSION,
};

/// Magic bytes of a variant-major BED file.
const BED_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];

/// 2-bit BED genotype codes.
const BED_HOM_ALT: u8 = 0b00;
const BED_MISSING: u8 = 0b01;
const BED_HET: u8 = 0b10;
const BED_HOM_REF: u8 = 0b11;

/// States of the emitter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EmitterState {
    /// Constructed, files created, nothing scanned yet.
    Init,
    /// First pass: enumerating samples and variants.
    Phase0Scan,
    /// Second pass: emitting matrix rows.
    Phase1Scan,
    /// Patching headers and flushing files.
    Finalize,
    /// All files closed.
    Closed,
}

/// One override row for the FAM/TFAM pedigree columns.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FamEntry {
    /// Family identifier; defaults to the sample name.
    pub fid: Option<String>,
    /// Paternal identifier.
    pub pid: Option<String>,
    /// Maternal identifier.
    pub mid: Option<String>,
    /// Sex code.
    pub sex: Option<String>,
    /// Phenotype value.
    pub phen: Option<String>,
}

/// Options for one PLINK export.
#[derive(Debug, Clone)]
pub struct PlinkOptions {
    /// Output prefix; rank > 0 appends `.{rank}`.
    pub prefix: String,
    /// Fraction of the expected cell total between progress reports.
    pub progress_interval: Option<f64>,
    /// Pedigree column overrides by sample name.
    pub fam_overrides: Option<IndexMap<String, FamEntry>>,
    /// Codec for the BGEN genotype blocks.
    pub compression: CodecKind,
    /// Compression level for the BGEN codec.
    pub compression_level: u32,
}

impl Default for PlinkOptions {
    fn default() -> Self {
        Self {
            prefix: String::from("out"),
            progress_interval: None,
            fam_overrides: None,
            compression: CodecKind::Zlib,
            compression_level: 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct VariantSummary {
    phased: bool,
}

/// The variant row under construction during phase 1.
struct CurrentVariant {
    contig: String,
    position: u64,
    reference: Option<String>,
    alts: Vec<String>,
    /// Genotypes in dense sample order, remapped onto the merged alleles.
    genotypes: Vec<Option<Genotype>>,
    phased: bool,
}

struct ProgressTicker {
    total: u64,
    every: u64,
    seen: u64,
}

impl ProgressTicker {
    fn new(total: u64, interval: f64) -> Self {
        let every = ((total as f64 * interval) as u64).max(1);
        Self {
            total,
            every,
            seen: 0,
        }
    }

    fn tick(&mut self) {
        self.seen += 1;
        if self.seen % self.every == 0 {
            tracing::info!(
                "processed {} of <= {} cells ({:.1}%)",
                self.seen,
                self.total,
                (self.seen as f64 / self.total as f64 * 100.0).min(100.0)
            );
        }
    }
}

/// Two-pass processor producing TPED/TFAM, BED/BIM/FAM, and BGEN files.
pub struct PlinkEmitter {
    state: EmitterState,
    meta: Metadata,
    fam_overrides: Option<IndexMap<String, FamEntry>>,
    base: String,

    // Phase 0 maps, keyed by row and by starting column.
    samples: BTreeMap<u64, String>,
    variants: BTreeMap<u64, VariantSummary>,
    current_column: Option<u64>,

    // Dense maps, assigned at the phase transition in ascending key order.
    sample_index_by_row: HashMap<u64, usize>,
    sample_names: Vec<String>,

    current: Option<CurrentVariant>,
    gt_phase_capable: bool,
    variants_written: u32,
    skipped_cells: u64,
    progress: Option<ProgressTicker>,
    codec: Box<dyn Codec>,

    tped: csv::Writer<File>,
    tfam: csv::Writer<File>,
    bed: File,
    bim: csv::Writer<File>,
    fam: csv::Writer<File>,
    bgen: File,
    bgen_sample_block_len: u32,
}

impl PlinkEmitter {
    /// Create the emitter, its output files, and the placeholder headers.
    pub fn new(engine: &VariantQueryEngine, options: &PlinkOptions) -> Result<Self> {
        let rank = engine.query().rank;
        let base = if rank > 0 {
            format!("{}.{}", options.prefix, rank)
        } else {
            options.prefix.clone()
        };

        let compression = compression_flag(options.compression)?;
        let codec = create_codec(options.compression, options.compression_level)?;

        let tsv_writer = |path: &str| -> Result<csv::Writer<File>> {
            let file = File::create(path).map_err(|e| Error::io(path, e))?;
            Ok(csv::WriterBuilder::new().delimiter(b'\t').from_writer(file))
        };

        let tped = tsv_writer(&format!("{}.tped", base))?;
        let tfam = tsv_writer(&format!("{}.tfam", base))?;
        let bim = tsv_writer(&format!("{}.bim", base))?;
        let fam = tsv_writer(&format!("{}.fam", base))?;

        let bed_path = format!("{}.bed", base);
        let mut bed = File::create(&bed_path).map_err(|e| Error::io(&bed_path, e))?;
        bed.write_all(&BED_MAGIC)
            .map_err(|e| Error::io(&bed_path, e))?;

        let bgen_path = format!("{}.bgen", base);
        let mut bgen = File::create(&bgen_path).map_err(|e| Error::io(&bgen_path, e))?;
        {
            // Top header with placeholder variant and sample counts; the
            // offset and the counts are patched during finalization.
            let mut header = Vec::with_capacity(24);
            header
                .write_u32::<LittleEndian>(HEADER_LENGTH)
                .expect("write to Vec failed");
            header
                .write_u32::<LittleEndian>(HEADER_LENGTH)
                .expect("write to Vec failed");
            header.write_u32::<LittleEndian>(0).expect("write to Vec failed");
            header.write_u32::<LittleEndian>(0).expect("write to Vec failed");
            header.extend_from_slice(BGEN_MAGIC);
            let flags: u32 = compression | (LAYOUT_VERSION << 2) | (1 << 31);
            header
                .write_u32::<LittleEndian>(flags)
                .expect("write to Vec failed");
            bgen.write_all(&header)
                .map_err(|e| Error::io(&bgen_path, e))?;
        }

        let progress = options
            .progress_interval
            .filter(|interval| *interval > 0.0)
            .map(|interval| ProgressTicker::new(engine.total_expected_cells(), interval));

        Ok(Self {
            state: EmitterState::Init,
            meta: engine.metadata().clone(),
            fam_overrides: options.fam_overrides.clone(),
            base,
            samples: BTreeMap::new(),
            variants: BTreeMap::new(),
            current_column: None,
            sample_index_by_row: HashMap::new(),
            sample_names: Vec::new(),
            current: None,
            gt_phase_capable: false,
            variants_written: 0,
            skipped_cells: 0,
            progress,
            codec,
            tped,
            tfam,
            bed,
            bim,
            fam,
            bgen,
            bgen_sample_block_len: 0,
        })
    }

    /// Move from the enumeration pass to the emission pass.
    ///
    /// Assigns dense indices, writes the pedigree files, and writes the
    /// BGEN sample identifier block. Header patching stays deferred to
    /// [`PlinkEmitter::finalize`].
    pub fn advance_state(&mut self) -> Result<()> {
        if self.state != EmitterState::Phase0Scan {
            return Err(Error::state(format!(
                "advance_state in state {}",
                self.state
            )));
        }

        self.sample_index_by_row = self
            .samples
            .keys()
            .enumerate()
            .map(|(idx, row)| (*row, idx))
            .collect();
        self.sample_names = self.samples.values().cloned().collect();
        tracing::debug!(
            "enumerated {} sample(s) and {} variant(s)",
            self.sample_names.len(),
            self.variants.len()
        );

        let names = self.sample_names.clone();
        for sample in &names {
            self.write_pedigree_row(sample)?;
        }

        // Sample identifier block: total length, count, then
        // length-prefixed names.
        let mut block = Vec::new();
        block.write_u32::<LittleEndian>(0).expect("write to Vec failed");
        block
            .write_u32::<LittleEndian>(self.sample_names.len() as u32)
            .expect("write to Vec failed");
        for name in &self.sample_names {
            block
                .write_u16::<LittleEndian>(name.len() as u16)
                .expect("write to Vec failed");
            block.extend_from_slice(name.as_bytes());
        }
        let block_len = block.len() as u32;
        block[0..4].copy_from_slice(&block_len.to_le_bytes());
        self.bgen
            .write_all(&block)
            .map_err(|e| Error::io(format!("{}.bgen", self.base), e))?;
        self.bgen_sample_block_len = block_len;

        if let Some(progress) = self.progress.as_mut() {
            progress.seen = 0;
        }
        self.state = EmitterState::Phase1Scan;
        Ok(())
    }

    /// Patch the BGEN header counts, flush everything, and close.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state != EmitterState::Phase1Scan {
            return Err(Error::state(format!("finalize in state {}", self.state)));
        }
        self.state = EmitterState::Finalize;
        self.flush_current()?;

        let bgen_path = format!("{}.bgen", self.base);
        let io_err = |e| Error::io(bgen_path.clone(), e);
        self.bgen.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.bgen
            .write_u32::<LittleEndian>(HEADER_LENGTH + self.bgen_sample_block_len)
            .map_err(io_err)?;
        self.bgen.seek(SeekFrom::Start(8)).map_err(io_err)?;
        self.bgen
            .write_u32::<LittleEndian>(self.variants_written)
            .map_err(io_err)?;
        self.bgen
            .write_u32::<LittleEndian>(self.sample_names.len() as u32)
            .map_err(io_err)?;
        self.bgen.seek(SeekFrom::End(0)).map_err(io_err)?;
        self.bgen.flush().map_err(io_err)?;

        for (writer, suffix) in [
            (&mut self.tped, "tped"),
            (&mut self.tfam, "tfam"),
            (&mut self.bim, "bim"),
            (&mut self.fam, "fam"),
        ] {
            writer
                .flush()
                .map_err(|e| Error::io(format!("{}.{}", self.base, suffix), e))?;
        }
        self.bed
            .flush()
            .map_err(|e| Error::io(format!("{}.bed", self.base), e))?;

        if self.skipped_cells > 0 {
            tracing::warn!(
                "{} malformed cell(s) were recorded as missing",
                self.skipped_cells
            );
        }

        self.state = EmitterState::Closed;
        Ok(())
    }

    /// The current lifecycle state.
    pub fn state(&self) -> EmitterState {
        self.state
    }

    /// Number of malformed cells recorded as missing.
    pub fn skipped_cells(&self) -> u64 {
        self.skipped_cells
    }

    fn write_pedigree_row(&mut self, sample: &str) -> Result<()> {
        let default = FamEntry::default();
        let entry = self
            .fam_overrides
            .as_ref()
            .and_then(|overrides| overrides.get(sample))
            .unwrap_or(&default);
        let row = [
            entry.fid.clone().unwrap_or_else(|| sample.to_string()),
            sample.to_string(),
            entry.pid.clone().unwrap_or_else(|| String::from("0")),
            entry.mid.clone().unwrap_or_else(|| String::from("0")),
            entry.sex.clone().unwrap_or_else(|| String::from("0")),
            entry.phen.clone().unwrap_or_else(|| String::from("0")),
        ];
        self.tfam
            .write_record(&row)
            .map_err(|e| Error::io(format!("{}.tfam", self.base), into_io(e)))?;
        self.fam
            .write_record(&row)
            .map_err(|e| Error::io(format!("{}.fam", self.base), into_io(e)))?;
        Ok(())
    }

    /// Merge one call into the row under construction (phase 1).
    fn merge_call(&mut self, call: &CallContext<'_>) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Err(Error::state("process_call before process_interval"));
        };
        let Some(&sample_idx) = self.sample_index_by_row.get(&call.row) else {
            return Err(Error::state(format!(
                "row {} appeared after sample enumeration",
                call.row
            )));
        };

        if current.reference.is_none() {
            current.reference = call
                .fields
                .get(FIELD_REF)
                .and_then(FieldValue::as_text)
                .map(str::to_string);
        }

        let own_alts = call
            .fields
            .get(FIELD_ALT)
            .map(split_alt)
            .unwrap_or_default();
        let Some(value) = call.fields.get(FIELD_GT) else {
            return Ok(());
        };
        let genotype = match Genotype::from_field(value, self.gt_phase_capable) {
            Ok(genotype) => genotype,
            Err(e) => {
                tracing::warn!(
                    "skipping malformed genotype at row {}, column {}: {}",
                    call.row,
                    call.column,
                    e
                );
                self.skipped_cells += 1;
                return Ok(());
            }
        };
        if genotype.ploidy() == 0 {
            tracing::warn!(
                "skipping zero-ploidy genotype at row {}, column {}",
                call.row,
                call.column
            );
            self.skipped_cells += 1;
            return Ok(());
        }

        // Remap onto the merged allele list; the symbolic non-ref token is
        // elided from the emitted alleles, so a call referencing it becomes
        // a missing allele.
        let alleles = genotype
            .alleles
            .iter()
            .map(|allele| match allele {
                None => None,
                Some(0) => Some(0),
                Some(idx) => {
                    let name = own_alts.get(*idx as usize - 1)?;
                    if name == NON_REF_TOKEN {
                        return None;
                    }
                    let merged = match current.alts.iter().position(|alt| alt == name) {
                        Some(at) => at,
                        None => {
                            current.alts.push(name.clone());
                            current.alts.len() - 1
                        }
                    };
                    Some(merged as u32 + 1)
                }
            })
            .collect::<Vec<_>>();
        current.genotypes[sample_idx] = Some(Genotype {
            alleles,
            phased: genotype.phased,
        });
        Ok(())
    }

    /// Emit the buffered variant row into all outputs (phase 1).
    fn flush_current(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let reference = current.reference.clone().unwrap_or_else(|| String::from("N"));
        let rsid = format!("{}:{}", current.contig, current.position);
        tracing::trace!("emitting variant row {}", rsid);

        // TPED: chr rsid cM pos, then two allele columns per sample.
        let mut tped_row = vec![
            current.contig.clone(),
            rsid.clone(),
            String::from("0"),
            current.position.to_string(),
        ];
        for genotype in &current.genotypes {
            let pair = tped_alleles(genotype.as_ref(), &reference, &current.alts);
            tped_row.extend(pair);
        }
        self.tped
            .write_record(&tped_row)
            .map_err(|e| Error::io(format!("{}.tped", self.base), into_io(e)))?;

        // BIM: chr rsid cM pos A1 A2 with A1 the first alternate allele.
        let a1 = current
            .alts
            .first()
            .cloned()
            .unwrap_or_else(|| String::from("0"));
        self.bim
            .write_record(&[
                current.contig.clone(),
                rsid.clone(),
                String::from("0"),
                current.position.to_string(),
                a1,
                reference.clone(),
            ])
            .map_err(|e| Error::io(format!("{}.bim", self.base), into_io(e)))?;

        // BED: 2-bit codes, 4 samples per byte, zero-padded per variant.
        let mut packed = Vec::with_capacity((current.genotypes.len() + 3) / 4);
        let mut byte = 0u8;
        let mut filled = 0u8;
        for genotype in &current.genotypes {
            byte |= bed_code(genotype.as_ref()) << (2 * filled);
            filled += 1;
            if filled == 4 {
                packed.push(byte);
                byte = 0;
                filled = 0;
            }
        }
        if filled > 0 {
            packed.push(byte);
        }
        self.bed
            .write_all(&packed)
            .map_err(|e| Error::io(format!("{}.bed", self.base), e))?;

        // BGEN variant block: identifiers, position, alleles, then the
        // compressed genotype probability block.
        let allele_count = 1 + current.alts.len();
        let mut block = Vec::new();
        for text in [&rsid, &rsid, &current.contig] {
            block
                .write_u16::<LittleEndian>(text.len() as u16)
                .expect("write to Vec failed");
            block.extend_from_slice(text.as_bytes());
        }
        block
            .write_u32::<LittleEndian>(current.position as u32)
            .expect("write to Vec failed");
        block
            .write_u16::<LittleEndian>(allele_count as u16)
            .expect("write to Vec failed");
        for allele in std::iter::once(&reference).chain(current.alts.iter()) {
            block
                .write_u32::<LittleEndian>(allele.len() as u32)
                .expect("write to Vec failed");
            block.extend_from_slice(allele.as_bytes());
        }

        let mut genotypes = GenotypeBlockBuilder::new(allele_count as u16, current.phased);
        for genotype in &current.genotypes {
            match genotype {
                Some(genotype) => {
                    if let Err(e) = genotypes.push_genotype(genotype) {
                        tracing::warn!("recording unencodable genotype as missing: {}", e);
                        self.skipped_cells += 1;
                        genotypes.push_missing();
                    }
                }
                None => genotypes.push_missing(),
            }
        }
        let genotype_block = genotypes.finish(self.codec.as_mut())?;
        block.extend_from_slice(&genotype_block);

        self.bgen
            .write_all(&block)
            .map_err(|e| Error::io(format!("{}.bgen", self.base), e))?;
        self.variants_written += 1;
        Ok(())
    }
}

fn into_io(e: csv::Error) -> std::io::Error {
    match e.into_kind() {
        csv::ErrorKind::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", other)),
    }
}

/// TPED allele pair for one sample; `0` marks a missing allele.
fn tped_alleles(genotype: Option<&Genotype>, reference: &str, alts: &[String]) -> [String; 2] {
    let missing = [String::from("0"), String::from("0")];
    let Some(genotype) = genotype else {
        return missing;
    };
    if genotype.ploidy() != 2 {
        return missing;
    }
    let render = |allele: &Option<u32>| -> String {
        match allele {
            None => String::from("0"),
            Some(0) => reference.to_string(),
            Some(idx) => alts
                .get(*idx as usize - 1)
                .cloned()
                .unwrap_or_else(|| String::from("0")),
        }
    };
    [render(&genotype.alleles[0]), render(&genotype.alleles[1])]
}

/// The 2-bit BED code of one sample's genotype at a biallelic site.
fn bed_code(genotype: Option<&Genotype>) -> u8 {
    let Some(genotype) = genotype else {
        return BED_MISSING;
    };
    if genotype.ploidy() != 2 {
        return BED_MISSING;
    }
    match (genotype.alleles[0], genotype.alleles[1]) {
        (Some(a), Some(b)) if a <= 1 && b <= 1 => match (a, b) {
            (0, 0) => BED_HOM_REF,
            (1, 1) => BED_HOM_ALT,
            _ => BED_HET,
        },
        _ => BED_MISSING,
    }
}

impl VariantProcessor for PlinkEmitter {
    fn initialize(&mut self, field_types: &IndexMap<String, FieldType>) -> Result<()> {
        self.gt_phase_capable = field_types
            .get(FIELD_GT)
            .map(|field_type| field_type.phased)
            .unwrap_or_default();
        match self.state {
            EmitterState::Init => {
                self.state = EmitterState::Phase0Scan;
                Ok(())
            }
            EmitterState::Phase1Scan => Ok(()),
            state => Err(Error::state(format!("scan started in state {}", state))),
        }
    }

    fn process_interval(&mut self, interval: ColumnInterval) -> Result<()> {
        match self.state {
            EmitterState::Phase0Scan => {
                self.current_column = Some(interval.lo);
                self.variants
                    .entry(interval.lo)
                    .or_insert(VariantSummary { phased: true });
                Ok(())
            }
            EmitterState::Phase1Scan => {
                self.flush_current()?;
                let genomic = self
                    .meta
                    .column_interval_to_genomic(interval.lo, interval.hi)?;
                let phased = self
                    .variants
                    .get(&interval.lo)
                    .map(|summary| summary.phased)
                    .unwrap_or_default();
                self.current = Some(CurrentVariant {
                    contig: genomic.contig,
                    position: genomic.lo,
                    reference: None,
                    alts: Vec::new(),
                    genotypes: vec![None; self.sample_names.len()],
                    phased,
                });
                Ok(())
            }
            state => Err(Error::state(format!("process_interval in state {}", state))),
        }
    }

    fn process_call(&mut self, call: &CallContext<'_>) -> Result<()> {
        if let Some(progress) = self.progress.as_mut() {
            progress.tick();
        }
        match self.state {
            EmitterState::Phase0Scan => {
                self.samples
                    .entry(call.row)
                    .or_insert_with(|| call.sample.to_string());
                if let Some(value) = call.fields.get(FIELD_GT) {
                    if let Ok(genotype) = Genotype::from_field(value, self.gt_phase_capable) {
                        if !genotype.phased {
                            let column = self
                                .current_column
                                .ok_or_else(|| Error::state("call outside of an interval"))?;
                            if let Some(summary) = self.variants.get_mut(&column) {
                                summary.phased = false;
                            }
                        }
                    }
                }
                Ok(())
            }
            EmitterState::Phase1Scan => self.merge_call(call),
            state => Err(Error::state(format!("process_call in state {}", state))),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.state == EmitterState::Phase1Scan {
            self.flush_current()?;
        }
        Ok(())
    }
}

/// Command line arguments for `export plink`.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Export PLINK TPED/BED/BGEN files", long_about = None)]
pub struct Args {
    /// Path to the query configuration JSON file.
    #[arg(long)]
    pub path_config: String,
    /// Concurrency rank to run as.
    #[arg(long, default_value_t = 0)]
    pub rank: u32,
    /// Prefix of the output files.
    #[arg(long)]
    pub output_prefix: String,
    /// Fraction of the expected cell total between progress reports.
    #[arg(long)]
    pub progress_interval: Option<f64>,
    /// Path to a JSON file with FAM column overrides per sample.
    #[arg(long)]
    pub path_fam: Option<String>,
    /// Codec for the BGEN genotype blocks.
    #[arg(long, value_enum, default_value_t = CodecKind::Zlib)]
    pub bgen_compression: CodecKind,
    /// Compression level for the BGEN codec.
    #[arg(long, default_value_t = 6)]
    pub bgen_compression_level: u32,
}

/// Main entry point for `export plink`.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let config = crate::query::config::QueryConfig::from_json_file(&args.path_config)?;
    let engine = VariantQueryEngine::new(
        Box::new(crate::storage::json::JsonArrayStore),
        &config,
        args.rank,
    )?;

    let fam_overrides = args
        .path_fam
        .as_ref()
        .map(|path| {
            crate::common::read_json_document(std::path::Path::new(path), "FAM override")
        })
        .transpose()?;

    let options = PlinkOptions {
        prefix: args.output_prefix.clone(),
        progress_interval: args.progress_interval,
        fam_overrides,
        compression: args.bgen_compression,
        compression_level: args.bgen_compression_level,
    };
    engine.generate_ped_map(&options)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, ReadBytesExt};
    use pretty_assertions::assert_eq;

    use crate::query::testing;
    use crate::query::VariantQueryEngine;
    use crate::storage::codec::CodecKind;

    use super::*;

    fn export(dir: &std::path::Path, engine: &VariantQueryEngine) -> String {
        let prefix = dir
            .join("export")
            .to_str()
            .expect("invalid path")
            .to_string();
        let options = PlinkOptions {
            prefix: prefix.clone(),
            compression: CodecKind::None,
            ..PlinkOptions::default()
        };
        engine.generate_ped_map(&options).expect("export failed");
        prefix
    }

    #[test]
    fn fixture_export_produces_matrix_files() {
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let prefix = export(&tmp_dir, &engine);

        let tfam = std::fs::read_to_string(format!("{}.tfam", prefix)).expect("no TFAM");
        assert_eq!(
            tfam,
            "NA12878\tNA12878\t0\t0\t0\t0\nNA12879\tNA12879\t0\t0\t0\t0\n"
        );
        let fam = std::fs::read_to_string(format!("{}.fam", prefix)).expect("no FAM");
        assert_eq!(tfam, fam);

        let tped = std::fs::read_to_string(format!("{}.tped", prefix)).expect("no TPED");
        let tped_lines = tped.lines().collect::<Vec<_>>();
        assert_eq!(tped_lines.len(), 4);
        assert_eq!(tped_lines[0], "chr1\tchr1:101\t0\t101\tA\tC\tA\tT");
        // The gVCF block elides the non-ref token: hom-ref for the carrier,
        // missing for the other sample.
        assert_eq!(tped_lines[1], "chr1\tchr1:1001\t0\t1001\tG\tG\t0\t0");

        let bim = std::fs::read_to_string(format!("{}.bim", prefix)).expect("no BIM");
        let bim_lines = bim.lines().collect::<Vec<_>>();
        assert_eq!(bim_lines[0], "chr1\tchr1:101\t0\t101\tC\tA");
        assert_eq!(bim_lines[1], "chr1\tchr1:1001\t0\t1001\t0\tG");
        assert_eq!(bim_lines[2], "chr1\tchr1:1501\t0\t1501\tC\tG");

        let bed = std::fs::read(format!("{}.bed", prefix)).expect("no BED");
        assert_eq!(&bed[0..3], &[0x6c, 0x1b, 0x01]);
        // Site 101: het plus a third-allele genotype mapped to missing;
        // block rows: hom-ref plus missing; split site: hom-ref + hom-alt.
        assert_eq!(&bed[3..], &[0b0110, 0b0111, 0b0011, 0b0111]);
    }

    #[test]
    fn bgen_header_is_backpatched() {
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let prefix = export(&tmp_dir, &engine);

        let bgen = std::fs::read(format!("{}.bgen", prefix)).expect("no BGEN");
        let sample_block_len = 8 + (2 + "NA12878".len()) + (2 + "NA12879".len());
        assert_eq!(
            u32::from_le_bytes(bgen[0..4].try_into().expect("short file")),
            20 + sample_block_len as u32
        );
        assert_eq!(
            u32::from_le_bytes(bgen[4..8].try_into().expect("short file")),
            20
        );
        // Variant count M and sample count N.
        assert_eq!(
            u32::from_le_bytes(bgen[8..12].try_into().expect("short file")),
            4
        );
        assert_eq!(
            u32::from_le_bytes(bgen[12..16].try_into().expect("short file")),
            2
        );
        assert_eq!(&bgen[16..20], b"bgen");
        let flags = u32::from_le_bytes(bgen[20..24].try_into().expect("short file"));
        assert_eq!(flags & 0b11, 0);
        assert_eq!((flags >> 2) & 0b1111, 2);
        assert_eq!(flags >> 31, 1);
    }

    #[test]
    fn bgen_variant_blocks_carry_pessimistic_phasing() {
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let prefix = export(&tmp_dir, &engine);

        let bgen = std::fs::read(format!("{}.bgen", prefix)).expect("no BGEN");
        let offset = u32::from_le_bytes(bgen[0..4].try_into().expect("short file")) as usize;
        let mut cursor = std::io::Cursor::new(&bgen[4 + offset..]);

        // First variant block: identifiers, position, alleles.
        let mut texts = Vec::new();
        for _ in 0..3 {
            let len = cursor.read_u16::<LittleEndian>().expect("short block") as usize;
            let mut buf = vec![0u8; len];
            std::io::Read::read_exact(&mut cursor, &mut buf).expect("short block");
            texts.push(String::from_utf8(buf).expect("invalid UTF-8"));
        }
        assert_eq!(texts, vec!["chr1:101", "chr1:101", "chr1"]);
        assert_eq!(cursor.read_u32::<LittleEndian>().expect("short block"), 101);
        let allele_count = cursor.read_u16::<LittleEndian>().expect("short block");
        assert_eq!(allele_count, 3);
        let mut alleles = Vec::new();
        for _ in 0..allele_count {
            let len = cursor.read_u32::<LittleEndian>().expect("short block") as usize;
            let mut buf = vec![0u8; len];
            std::io::Read::read_exact(&mut cursor, &mut buf).expect("short block");
            alleles.push(String::from_utf8(buf).expect("invalid UTF-8"));
        }
        assert_eq!(alleles, vec!["A", "C", "T"]);

        // Uncompressed genotype block; one sample is phased, the other is
        // not, so the block must use the unphased layout.
        let total = cursor.read_u32::<LittleEndian>().expect("short block") as usize;
        let start = 4 + offset + cursor.position() as usize;
        let buffer = &bgen[start..start + total];
        assert_eq!(u32::from_le_bytes(buffer[0..4].try_into().expect("short")), 2);
        assert_eq!(u16::from_le_bytes(buffer[4..6].try_into().expect("short")), 3);
        assert_eq!(buffer[10], 0, "phased flag must be pessimistic");
        assert_eq!(buffer[11], super::super::bgen::BIT_DEPTH);
    }

    #[test]
    fn single_het_cell_packs_to_0x02() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut config = testing::fixture_workspace(&tmp_dir);
        config.row_ranges = vec![vec![crate::common::CoordRange::new(0, 0)]];
        config.column_ranges = vec![vec![crate::common::CoordRange::new(100, 100)]];
        let engine = VariantQueryEngine::new(
            Box::new(crate::storage::json::JsonArrayStore),
            &config,
            0,
        )
        .expect("engine construction failed");
        let prefix = export(&tmp_dir, &engine);

        let bed = std::fs::read(format!("{}.bed", prefix)).expect("no BED");
        assert_eq!(&bed[3..], &[0x02]);
    }

    #[test]
    fn state_machine_rejects_misuse() {
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let prefix = tmp_dir
            .join("misuse")
            .to_str()
            .expect("invalid path")
            .to_string();
        let options = PlinkOptions {
            prefix,
            compression: CodecKind::None,
            ..PlinkOptions::default()
        };

        let mut emitter = PlinkEmitter::new(&engine, &options).expect("emitter failed");
        assert_eq!(emitter.state(), EmitterState::Init);
        assert!(matches!(emitter.advance_state(), Err(Error::State { .. })));
        assert!(matches!(emitter.finalize(), Err(Error::State { .. })));

        engine
            .query_variant_calls(&mut emitter)
            .expect("phase 0 failed");
        assert_eq!(emitter.state(), EmitterState::Phase0Scan);
        emitter.advance_state().expect("advance failed");
        assert!(matches!(emitter.advance_state(), Err(Error::State { .. })));

        engine
            .query_variant_calls(&mut emitter)
            .expect("phase 1 failed");
        emitter.finalize().expect("finalize failed");
        assert_eq!(emitter.state(), EmitterState::Closed);
        assert!(matches!(emitter.finalize(), Err(Error::State { .. })));
    }

    #[test]
    fn rank_suffix_separates_outputs() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut config = testing::fixture_workspace(&tmp_dir);
        config.row_ranges = vec![
            vec![crate::common::CoordRange::new(0, 0)],
            vec![crate::common::CoordRange::new(1, 1)],
        ];
        let prefix = tmp_dir
            .join("ranked")
            .to_str()
            .expect("invalid path")
            .to_string();
        let mut names = Vec::new();
        for rank in 0..2u32 {
            let engine = VariantQueryEngine::new(
                Box::new(crate::storage::json::JsonArrayStore),
                &config,
                rank,
            )
            .expect("engine construction failed");
            let options = PlinkOptions {
                prefix: prefix.clone(),
                compression: CodecKind::None,
                ..PlinkOptions::default()
            };
            engine.generate_ped_map(&options).expect("export failed");
            let base = if rank > 0 {
                format!("{}.{}", prefix, rank)
            } else {
                prefix.clone()
            };
            let fam = std::fs::read_to_string(format!("{}.fam", base)).expect("no FAM");
            names.extend(
                fam.lines()
                    .map(|line| line.split('\t').nth(1).expect("no IID").to_string()),
            );
        }
        names.sort();
        names.dedup();
        assert_eq!(names, vec!["NA12878", "NA12879"]);
    }

    #[test]
    fn fam_overrides_replace_pedigree_columns() {
        let entry = FamEntry {
            fid: Some(String::from("FAM1")),
            sex: Some(String::from("2")),
            ..FamEntry::default()
        };
        let tmp_dir = temp_testdir::TempDir::default();
        let engine = testing::fixture_engine(&tmp_dir, 0);
        let prefix = tmp_dir
            .join("famover")
            .to_str()
            .expect("invalid path")
            .to_string();
        let mut overrides = IndexMap::new();
        overrides.insert(String::from("NA12878"), entry);
        let options = PlinkOptions {
            prefix: prefix.clone(),
            fam_overrides: Some(overrides),
            compression: CodecKind::None,
            ..PlinkOptions::default()
        };
        engine.generate_ped_map(&options).expect("export failed");
        let fam = std::fs::read_to_string(format!("{}.fam", prefix)).expect("no FAM");
        assert_eq!(
            fam.lines().next(),
            Some("FAM1\tNA12878\t0\t0\t2\t0")
        );
    }
}

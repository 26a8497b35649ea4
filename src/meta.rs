//! Workspace metadata: contig layout, callset map, and field schemas.
//!
//! The resolver is constructed once per engine from the VID and callset
//! mapping documents (JSON, optionally gzipped) and is immutable afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::err::{Error, Result};

/// Name of the reference allele field.
pub const FIELD_REF: &str = "REF";
/// Name of the alternate alleles field.
pub const FIELD_ALT: &str = "ALT";
/// Name of the genotype field.
pub const FIELD_GT: &str = "GT";
/// Name of the call quality field.
pub const FIELD_QUAL: &str = "QUAL";
/// Name of the filter field.
pub const FIELD_FILTER: &str = "FILTER";

/// Element kind of a field buffer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldKind {
    /// 32-bit signed integers.
    Int32,
    /// 32-bit floats.
    Float32,
    /// Single characters; variable arity makes this a string.
    Char,
    /// UTF-8 string bytes.
    String,
}

impl FieldKind {
    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            FieldKind::Int32 | FieldKind::Float32 => 4,
            FieldKind::Char | FieldKind::String => 1,
        }
    }
}

/// Arity of a field: fixed element count or per-cell variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLength {
    /// Fixed arity with the given element count.
    Fixed(usize),
    /// Variable arity; the element count comes with each cell.
    Variable,
}

impl serde::Serialize for FieldLength {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            FieldLength::Fixed(n) => serializer.serialize_u64(*n as u64),
            FieldLength::Variable => serializer.serialize_str("var"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for FieldLength {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = FieldLength;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "an element count or the string \"var\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<FieldLength, E> {
                Ok(FieldLength::Fixed(v as usize))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<FieldLength, E> {
                if v < 0 {
                    Err(E::custom("element count must not be negative"))
                } else {
                    Ok(FieldLength::Fixed(v as usize))
                }
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<FieldLength, E> {
                if v.eq_ignore_ascii_case("var") {
                    Ok(FieldLength::Variable)
                } else {
                    Err(E::custom(format!("unknown field length token {:?}", v)))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

impl Default for FieldLength {
    fn default() -> Self {
        FieldLength::Variable
    }
}

/// Type descriptor of one field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldType {
    /// Element kind.
    pub kind: FieldKind,
    /// Arity of the field.
    #[serde(default)]
    pub length: FieldLength,
    /// Number of dimensions of the field.
    #[serde(default = "FieldType::default_dimensions")]
    pub dimensions: usize,
    /// Whether the field carries phase information (genotypes).
    #[serde(default)]
    pub phased: bool,
}

impl FieldType {
    fn default_dimensions() -> usize {
        1
    }
}

/// One contig with its span on the flattened column axis.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContigInfo {
    /// Contig name, e.g. `chr1`.
    pub name: String,
    /// Number of bases in the contig.
    pub length: u64,
    /// First column of the contig on the flattened axis.
    pub offset: u64,
}

/// A genomic position, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GenomicPos<'a> {
    /// Contig name.
    pub contig: &'a str,
    /// 1-based position within the contig.
    pub position: u64,
}

/// A genomic interval with 1-based inclusive bounds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GenomicInterval {
    /// Contig name.
    pub contig: String,
    /// First position, 1-based.
    pub lo: u64,
    /// Last position, 1-based inclusive.
    pub hi: u64,
}

/// VID mapping document: contig layout and field schemas.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct VidDocument {
    /// Contigs in insertion order.
    pub contigs: Vec<VidContig>,
    /// Field schemas in emitter order.
    pub fields: Vec<VidField>,
}

/// One contig entry in the VID document.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct VidContig {
    /// Contig name.
    pub name: String,
    /// Number of bases.
    pub length: u64,
    /// Starting column offset.
    pub offset: u64,
}

/// One field entry in the VID document.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct VidField {
    /// Field name.
    pub name: String,
    /// Type descriptor.
    #[serde(flatten)]
    pub field_type: FieldType,
}

/// Callset mapping document: sample name to array row.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CallsetDocument {
    /// Callsets by sample name.
    pub callsets: IndexMap<String, CallsetEntry>,
}

/// One callset entry.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CallsetEntry {
    /// Row of the callset in the array.
    pub row_idx: u64,
}

/// Immutable metadata resolver for one workspace.
#[derive(Debug, Clone)]
pub struct Metadata {
    contigs: Vec<ContigInfo>,
    contig_index_by_name: IndexMap<String, usize>,
    row_to_sample: BTreeMap<u64, String>,
    sample_to_row: IndexMap<String, u64>,
    fields: IndexMap<String, FieldType>,
    reference_genome: String,
}

impl Metadata {
    /// Load metadata from the VID and callset mapping documents.
    pub fn load<P: AsRef<Path>>(
        vid_path: P,
        callset_path: P,
        reference_genome: &str,
    ) -> Result<Self> {
        let vid: VidDocument =
            crate::common::read_json_document(vid_path.as_ref(), "VID mapping")?;
        let callsets: CallsetDocument =
            crate::common::read_json_document(callset_path.as_ref(), "callset mapping")?;
        Self::from_documents(vid, callsets, reference_genome)
    }

    /// Build the resolver from already-parsed documents.
    pub fn from_documents(
        vid: VidDocument,
        callsets: CallsetDocument,
        reference_genome: &str,
    ) -> Result<Self> {
        let mut contigs = vid
            .contigs
            .into_iter()
            .map(|contig| ContigInfo {
                name: contig.name,
                length: contig.length,
                offset: contig.offset,
            })
            .collect::<Vec<_>>();
        contigs.sort_by_key(|contig| contig.offset);
        for (prev, next) in contigs.iter().tuple_windows() {
            if prev.offset + prev.length > next.offset {
                return Err(Error::config(format!(
                    "contig spans overlap: {} and {}",
                    prev.name, next.name
                )));
            }
        }

        let contig_index_by_name = contigs
            .iter()
            .enumerate()
            .map(|(idx, contig)| (contig.name.clone(), idx))
            .collect();

        let mut fields = IndexMap::new();
        for field in vid.fields {
            if fields.insert(field.name.clone(), field.field_type).is_some() {
                return Err(Error::config(format!(
                    "duplicate field in VID document: {}",
                    field.name
                )));
            }
        }

        let mut row_to_sample = BTreeMap::new();
        let mut sample_to_row = IndexMap::new();
        for (name, entry) in callsets.callsets {
            if row_to_sample.insert(entry.row_idx, name.clone()).is_some() {
                return Err(Error::config(format!(
                    "duplicate row {} in callset document",
                    entry.row_idx
                )));
            }
            sample_to_row.insert(name, entry.row_idx);
        }

        Ok(Self {
            contigs,
            contig_index_by_name,
            row_to_sample,
            sample_to_row,
            fields,
            reference_genome: reference_genome.to_string(),
        })
    }

    /// Resolve a row coordinate to its sample name.
    pub fn row_to_sample(&self, row: u64) -> Result<&str> {
        self.row_to_sample
            .get(&row)
            .map(String::as_str)
            .ok_or_else(|| Error::not_found("row", row.to_string()))
    }

    /// Resolve a sample name to its row coordinate.
    pub fn sample_row(&self, sample: &str) -> Result<u64> {
        self.sample_to_row
            .get(sample)
            .copied()
            .ok_or_else(|| Error::not_found("sample", sample))
    }

    /// All known `(row, sample)` pairs in ascending row order.
    pub fn rows(&self) -> impl Iterator<Item = (u64, &str)> {
        self.row_to_sample
            .iter()
            .map(|(row, sample)| (*row, sample.as_str()))
    }

    /// Map a flattened column to `(contig, 1-based position)`.
    pub fn column_to_genomic(&self, column: u64) -> Result<GenomicPos<'_>> {
        let contig = self.contig_at(column)?;
        Ok(GenomicPos {
            contig: &contig.name,
            position: column - contig.offset + 1,
        })
    }

    /// Map a contig name and 1-based position to a flattened column.
    pub fn genomic_to_column(&self, contig: &str, position: u64) -> Result<u64> {
        let info = self
            .contig_index_by_name
            .get(contig)
            .map(|idx| &self.contigs[*idx])
            .ok_or_else(|| Error::not_found("contig", contig))?;
        if position == 0 || position > info.length {
            return Err(Error::not_found(
                "contig position",
                format!("{}:{}", contig, position),
            ));
        }
        Ok(info.offset + position - 1)
    }

    /// Map a column interval to a genomic interval on the contig of `lo`.
    ///
    /// The high end is clamped to the contig span.
    pub fn column_interval_to_genomic(&self, lo: u64, hi: u64) -> Result<GenomicInterval> {
        let contig = self.contig_at(lo)?;
        let clamped_hi = hi.min(contig.offset + contig.length - 1);
        Ok(GenomicInterval {
            contig: contig.name.clone(),
            lo: lo - contig.offset + 1,
            hi: clamped_hi - contig.offset + 1,
        })
    }

    /// Look up the type descriptor of a field.
    pub fn field_type(&self, name: &str) -> Result<&FieldType> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::schema(name, "unknown field"))
    }

    /// All field schemas in emitter order.
    pub fn field_types(&self) -> &IndexMap<String, FieldType> {
        &self.fields
    }

    /// Field names in emitter order.
    pub fn field_ordering(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// The contigs in ascending offset order.
    pub fn contigs(&self) -> &[ContigInfo] {
        &self.contigs
    }

    /// Identifier of the reference genome.
    pub fn reference_genome(&self) -> &str {
        &self.reference_genome
    }

    fn contig_at(&self, column: u64) -> Result<&ContigInfo> {
        let idx = self
            .contigs
            .partition_point(|contig| contig.offset <= column);
        if idx == 0 {
            return Err(Error::not_found("contig for column", column.to_string()));
        }
        let contig = &self.contigs[idx - 1];
        if column < contig.offset + contig.length {
            Ok(contig)
        } else {
            Err(Error::not_found("contig for column", column.to_string()))
        }
    }
}

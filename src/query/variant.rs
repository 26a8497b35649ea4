//! Calls, variants, decoded field values, and the query result surfaces.

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;

use crate::err::{Error, Result};
use crate::meta::{FieldKind, FieldLength, FieldType, GenomicInterval};
use crate::storage::FieldBuffer;

/// Delimiter between alternate alleles in the ALT field.
pub const ALT_DELIMITER: char = '|';
/// Symbolic token for the non-reference allele in gVCF blocks.
pub const NON_REF_TOKEN: &str = "<NON_REF>";
/// Sentinel for a missing allele in genotype buffers.
pub const MISSING_ALLELE: i32 = -1;

/// A decoded, owned field value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// 32-bit integer elements.
    Int32(Vec<i32>),
    /// 32-bit float elements.
    Float32(Vec<f32>),
    /// Character data.
    Text(String),
}

impl FieldValue {
    /// Decode a raw buffer against its field type, validating sizes.
    pub fn decode(name: &str, field_type: &FieldType, buffer: &FieldBuffer) -> Result<Self> {
        if let FieldLength::Fixed(expected) = field_type.length {
            if buffer.elements != expected {
                return Err(Error::schema(
                    name,
                    format!(
                        "expected {} element(s), buffer has {}",
                        expected, buffer.elements
                    ),
                ));
            }
        }
        let expected_bytes = buffer.elements * field_type.kind.element_size();
        if buffer.data.len() != expected_bytes {
            return Err(Error::schema(
                name,
                format!(
                    "buffer of {} byte(s) does not hold {} {} element(s)",
                    buffer.data.len(),
                    buffer.elements,
                    field_type.kind
                ),
            ));
        }
        match field_type.kind {
            FieldKind::Int32 => {
                let mut values = vec![0i32; buffer.elements];
                LittleEndian::read_i32_into(&buffer.data, &mut values);
                Ok(FieldValue::Int32(values))
            }
            FieldKind::Float32 => {
                let mut values = vec![0f32; buffer.elements];
                LittleEndian::read_f32_into(&buffer.data, &mut values);
                Ok(FieldValue::Float32(values))
            }
            FieldKind::Char | FieldKind::String => {
                let text = String::from_utf8(buffer.data.clone())
                    .map_err(|e| Error::schema(name, format!("invalid UTF-8: {}", e)))?;
                Ok(FieldValue::Text(text))
            }
        }
    }

    /// The text content, if this is a character value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The first integer element, if any.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            FieldValue::Int32(values) => values.first().copied(),
            _ => None,
        }
    }

    /// The first float element, if any.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            FieldValue::Float32(values) => values.first().copied(),
            FieldValue::Int32(values) => values.first().map(|v| *v as f32),
            _ => None,
        }
    }
}

/// Split an ALT field into its allele strings.
pub fn split_alt(value: &FieldValue) -> Vec<String> {
    value
        .as_text()
        .map(|text| {
            text.split(ALT_DELIMITER)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A decoded genotype: allele indices with phase information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genotype {
    /// One entry per ploid; `None` encodes a missing allele.
    pub alleles: Vec<Option<u32>>,
    /// Whether all allele separators were phased.
    pub phased: bool,
}

impl Genotype {
    /// Decode a genotype from its field value.
    ///
    /// Phase-capable fields interleave alleles and separators
    /// (`[a0, s1, a1, ...]`, separator 1 = phased); other fields hold the
    /// plain allele list.
    pub fn from_field(value: &FieldValue, phase_capable: bool) -> Result<Self> {
        let raw = match value {
            FieldValue::Int32(values) => values,
            _ => {
                return Err(Error::schema(
                    crate::meta::FIELD_GT,
                    "genotype buffer is not int32",
                ))
            }
        };
        if raw.is_empty() {
            return Ok(Genotype {
                alleles: Vec::new(),
                phased: false,
            });
        }
        let (allele_values, phased) = if phase_capable && raw.len() > 1 {
            if raw.len() % 2 == 0 {
                return Err(Error::schema(
                    crate::meta::FIELD_GT,
                    format!("interleaved genotype has even length {}", raw.len()),
                ));
            }
            let alleles = raw.iter().step_by(2).copied().collect::<Vec<_>>();
            let phased = raw.iter().skip(1).step_by(2).all(|sep| *sep == 1);
            (alleles, phased)
        } else {
            (raw.clone(), phase_capable)
        };
        let alleles = allele_values
            .into_iter()
            .map(|value| match value {
                MISSING_ALLELE => Ok(None),
                v if v >= 0 => Ok(Some(v as u32)),
                v => Err(Error::schema(
                    crate::meta::FIELD_GT,
                    format!("invalid allele index {}", v),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Genotype { alleles, phased })
    }

    /// Number of allele slots.
    pub fn ploidy(&self) -> usize {
        self.alleles.len()
    }

    /// Whether any allele slot is missing.
    pub fn has_missing(&self) -> bool {
        self.alleles.iter().any(Option::is_none)
    }
}

/// One call: the originating row, its column interval, and its field bag.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Call {
    /// Row (callset) the call came from.
    pub row: u64,
    /// First column of the call interval.
    pub begin: u64,
    /// Inclusive last column of the call interval.
    pub end: u64,
    /// Decoded fields by name, in schema order.
    pub fields: IndexMap<String, FieldValue>,
}

impl Call {
    /// Decoded genotype, if the call carries one.
    pub fn genotype(&self, field_type: &FieldType) -> Result<Option<Genotype>> {
        self.fields
            .get(crate::meta::FIELD_GT)
            .map(|value| Genotype::from_field(value, field_type.phased))
            .transpose()
    }

    /// Alternate allele strings, if the call carries an ALT field.
    pub fn alt_alleles(&self) -> Vec<String> {
        self.fields
            .get(crate::meta::FIELD_ALT)
            .map(split_alt)
            .unwrap_or_default()
    }

    /// Reference allele string, if present.
    pub fn ref_allele(&self) -> Option<&str> {
        self.fields
            .get(crate::meta::FIELD_REF)
            .and_then(FieldValue::as_text)
    }
}

/// A reconciled column interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnInterval {
    /// First column.
    pub lo: u64,
    /// Last column, inclusive.
    pub hi: u64,
}

/// A reconciled variant inside a [`VariantSet`].
#[derive(Debug, Clone, PartialEq)]
struct VariantRecord {
    interval: ColumnInterval,
    call_indices: Vec<usize>,
}

/// Borrowed view of one variant in a [`VariantSet`].
#[derive(Debug, Clone, Copy)]
pub struct VariantView<'a> {
    set: &'a VariantSet,
    index: usize,
}

impl<'a> VariantView<'a> {
    /// The reconciled column interval.
    pub fn interval(&self) -> ColumnInterval {
        self.set.variants[self.index].interval
    }

    /// The participating calls, ascending by row.
    pub fn calls(&self) -> impl Iterator<Item = &'a Call> + 'a {
        let set = self.set;
        set.variants[self.index]
            .call_indices
            .iter()
            .map(move |idx| set.calls[*idx].as_ref())
    }

    /// Number of participating calls.
    pub fn call_count(&self) -> usize {
        self.set.variants[self.index].call_indices.len()
    }
}

/// Materialized query result: all reconciled variants of one query.
///
/// Calls are stored once; variants reference them by index, so a call that
/// spans several reconciled intervals is not duplicated.
#[derive(Debug, Default)]
pub struct VariantSet {
    calls: Vec<Rc<Call>>,
    variants: Vec<VariantRecord>,
    cursor: usize,
    freed: bool,
}

impl VariantSet {
    /// Number of variants in the set.
    pub fn size(&self) -> usize {
        self.variants.len()
    }

    /// Random access to the `index`-th variant.
    pub fn at(&self, index: usize) -> Result<VariantView<'_>> {
        self.check_live()?;
        if index >= self.variants.len() {
            return Err(Error::not_found("variant", index.to_string()));
        }
        Ok(VariantView { set: self, index })
    }

    /// Forward iteration; `None` once all variants were visited.
    pub fn next(&mut self) -> Result<Option<VariantView<'_>>> {
        self.check_live()?;
        if self.cursor >= self.variants.len() {
            return Ok(None);
        }
        let index = self.cursor;
        self.cursor += 1;
        Ok(Some(VariantView { set: self, index }))
    }

    /// Reset forward iteration to the first variant.
    pub fn rewind(&mut self) -> Result<()> {
        self.check_live()?;
        self.cursor = 0;
        Ok(())
    }

    /// Release the owned storage; the set must not be used afterwards.
    pub fn free(&mut self) -> Result<()> {
        self.check_live()?;
        self.calls = Vec::new();
        self.variants = Vec::new();
        self.freed = true;
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        if self.freed {
            Err(Error::state("variant set was already freed"))
        } else {
            Ok(())
        }
    }
}

/// Incremental builder for a [`VariantSet`]; dedupes calls by their id.
#[derive(Debug, Default)]
pub(crate) struct VariantSetBuilder {
    set: VariantSet,
    call_index_by_id: std::collections::HashMap<u64, usize>,
}

impl VariantSetBuilder {
    pub(crate) fn push_variant(
        &mut self,
        interval: ColumnInterval,
        calls: &[(u64, Rc<Call>)],
    ) {
        let stored_calls = &mut self.set.calls;
        let call_index_by_id = &mut self.call_index_by_id;
        let call_indices = calls
            .iter()
            .map(|(id, call)| {
                *call_index_by_id.entry(*id).or_insert_with(|| {
                    stored_calls.push(Rc::clone(call));
                    stored_calls.len() - 1
                })
            })
            .collect();
        self.set.variants.push(VariantRecord {
            interval,
            call_indices,
        });
    }

    pub(crate) fn finish(self) -> VariantSet {
        self.set
    }
}

/// Context handed to [`VariantProcessor::process_call`].
#[derive(Debug)]
pub struct CallContext<'a> {
    /// Sample name of the originating callset.
    pub sample: &'a str,
    /// Row coordinate.
    pub row: u64,
    /// First column of the call interval.
    pub column: u64,
    /// Inclusive last column of the call interval.
    pub end: u64,
    /// The call interval in genomic coordinates.
    pub genomic: GenomicInterval,
    /// Decoded fields of the call.
    pub fields: &'a IndexMap<String, FieldValue>,
}

/// Receiver for the streaming (processor-mode) result surface.
///
/// Callbacks run synchronously on the scan thread. Implementations may
/// perform I/O but must not retain references into the context beyond the
/// call.
pub trait VariantProcessor {
    /// Called once before the first variant with the full field type map.
    fn initialize(&mut self, field_types: &IndexMap<String, FieldType>) -> Result<()> {
        let _ = field_types;
        Ok(())
    }

    /// Called once per reconciled variant, before its calls.
    fn process_interval(&mut self, interval: ColumnInterval) -> Result<()>;

    /// Called for each participating call, ascending by row.
    fn process_call(&mut self, call: &CallContext<'_>) -> Result<()>;

    /// Called once after the last variant.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

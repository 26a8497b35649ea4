//! BGEN v1.2 layout-2 genotype probability blocks.
//!
//! Blocks are built per variant with bit depth 8: hard calls store the full
//! weight (255) in the slot of the observed genotype, missing samples store
//! zero in every slot with the missing bit set on their ploidy byte.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::err::{Error, Result};
use crate::query::variant::Genotype;
use crate::storage::codec::{Codec, CodecKind};

/// Magic bytes of a BGEN file.
pub const BGEN_MAGIC: &[u8; 4] = b"bgen";
/// Length of the fixed top header in bytes.
pub const HEADER_LENGTH: u32 = 20;
/// Layout version emitted by this worker.
pub const LAYOUT_VERSION: u32 = 2;
/// Bit depth of the probability payload.
pub const BIT_DEPTH: u8 = 8;
/// Ploidy assumed for samples without a call at a variant.
pub const DEFAULT_PLOIDY: u8 = 2;
/// Missing marker in the per-sample ploidy byte.
pub const PLOIDY_MISSING_BIT: u8 = 0x80;

/// The compression bits of the header flags for a codec kind.
pub fn compression_flag(kind: CodecKind) -> Result<u32> {
    match kind {
        CodecKind::None => Ok(0),
        CodecKind::Zlib => Ok(1),
        CodecKind::Zstd => Ok(2),
        CodecKind::Gzip => Err(Error::codec("gzip", "BGEN supports zlib or zstd framing")),
    }
}

/// Canonical enumeration of unphased genotypes as allele-count vectors.
///
/// The order iterates sorted allele tuples `(g_1 <= ... <= g_P)` with the
/// last allele varying slowest, matching the VCF genotype-likelihood order.
/// The final entry is always `(0, ..., 0, P)`.
pub fn unphased_genotype_order(ploidy: u8, alleles: u16) -> Vec<Vec<u16>> {
    fn tuples(ploidy: u8, max_allele: u16) -> Vec<Vec<u16>> {
        if ploidy == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for last in 0..max_allele {
            for mut tuple in tuples(ploidy - 1, last + 1) {
                tuple.push(last);
                out.push(tuple);
            }
        }
        out
    }

    tuples(ploidy, alleles)
        .into_iter()
        .map(|tuple| {
            let mut counts = vec![0u16; alleles as usize];
            for allele in tuple {
                counts[allele as usize] += 1;
            }
            counts
        })
        .collect()
}

/// Number of stored probability slots for one sample.
pub fn stored_slots(ploidy: u8, alleles: u16, phased: bool) -> usize {
    if phased {
        ploidy as usize * (alleles as usize - 1)
    } else {
        combinations(ploidy as usize + alleles as usize - 1, alleles as usize - 1) - 1
    }
}

fn combinations(n: usize, k: usize) -> usize {
    let k = k.min(n - k);
    let mut result = 1usize;
    for i in 0..k {
        result = result * (n - i) / (i + 1);
    }
    result
}

/// Builder for one variant's genotype probability block.
pub struct GenotypeBlockBuilder {
    alleles: u16,
    phased: bool,
    ploidies: Vec<u8>,
    payload: Vec<u8>,
}

impl GenotypeBlockBuilder {
    /// Start a block for a variant with `alleles` alleles.
    pub fn new(alleles: u16, phased: bool) -> Self {
        Self {
            alleles,
            phased,
            ploidies: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Append the next sample's hard call.
    pub fn push_genotype(&mut self, genotype: &Genotype) -> Result<()> {
        let ploidy = genotype.ploidy();
        if ploidy == 0 || ploidy > 0x7f {
            return Err(Error::data(0, 0, format!("unencodable ploidy {}", ploidy)));
        }
        let slots = stored_slots(ploidy as u8, self.alleles, self.phased);
        if genotype.has_missing() {
            self.ploidies.push(ploidy as u8 | PLOIDY_MISSING_BIT);
            self.payload.extend(std::iter::repeat(0u8).take(slots));
            return Ok(());
        }

        let mut sample_payload = vec![0u8; slots];
        if self.phased {
            for (haplotype, allele) in genotype.alleles.iter().enumerate() {
                let allele = allele.expect("checked for missing") as usize;
                if allele >= self.alleles as usize {
                    return Err(Error::data(
                        0,
                        0,
                        format!("allele index {} exceeds {} alleles", allele, self.alleles),
                    ));
                }
                if allele < self.alleles as usize - 1 {
                    sample_payload[haplotype * (self.alleles as usize - 1) + allele] = u8::MAX;
                }
            }
        } else {
            let mut counts = vec![0u16; self.alleles as usize];
            for allele in genotype.alleles.iter() {
                let allele = allele.expect("checked for missing") as usize;
                if allele >= self.alleles as usize {
                    return Err(Error::data(
                        0,
                        0,
                        format!("allele index {} exceeds {} alleles", allele, self.alleles),
                    ));
                }
                counts[allele] += 1;
            }
            let order = unphased_genotype_order(ploidy as u8, self.alleles);
            let slot = order
                .iter()
                .position(|candidate| *candidate == counts)
                .expect("genotype enumeration is total");
            // The last slot is implied by the others and not stored.
            if slot < slots {
                sample_payload[slot] = u8::MAX;
            }
        }
        self.ploidies.push(ploidy as u8);
        self.payload.extend_from_slice(&sample_payload);
        Ok(())
    }

    /// Append a sample without a call at this variant.
    pub fn push_missing(&mut self) {
        let slots = stored_slots(DEFAULT_PLOIDY, self.alleles, self.phased);
        self.ploidies.push(DEFAULT_PLOIDY | PLOIDY_MISSING_BIT);
        self.payload.extend(std::iter::repeat(0u8).take(slots));
    }

    /// Number of samples pushed so far.
    pub fn sample_count(&self) -> usize {
        self.ploidies.len()
    }

    /// Assemble, patch the ploidy bounds, and compress the block.
    ///
    /// The result is the on-disk genotype data block: total size and
    /// uncompressed size prefixes followed by the compressed buffer, or
    /// only the size prefix and raw buffer for the passthrough codec.
    pub fn finish(self, codec: &mut dyn Codec) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(10 + self.ploidies.len() + self.payload.len());
        buffer
            .write_u32::<LittleEndian>(self.ploidies.len() as u32)
            .expect("write to Vec failed");
        buffer
            .write_u16::<LittleEndian>(self.alleles)
            .expect("write to Vec failed");
        // Placeholders for min and max ploidy, patched below.
        buffer.push(0);
        buffer.push(0);
        buffer.extend_from_slice(&self.ploidies);
        buffer.push(u8::from(self.phased));
        buffer.push(BIT_DEPTH);
        buffer.extend_from_slice(&self.payload);

        let bounds = self
            .ploidies
            .iter()
            .map(|ploidy| ploidy & !PLOIDY_MISSING_BIT)
            .fold(None, |acc: Option<(u8, u8)>, ploidy| {
                Some(acc.map_or((ploidy, ploidy), |(lo, hi)| {
                    (lo.min(ploidy), hi.max(ploidy))
                }))
            })
            .unwrap_or((0, 0));
        buffer[6] = bounds.0;
        buffer[7] = bounds.1;

        let mut out = Vec::new();
        match codec.kind() {
            CodecKind::None => {
                out.write_u32::<LittleEndian>(buffer.len() as u32)
                    .expect("write to Vec failed");
                out.extend_from_slice(&buffer);
            }
            _ => {
                let mut compressed = Vec::new();
                codec.compress(&buffer, &mut compressed)?;
                out.write_u32::<LittleEndian>(compressed.len() as u32 + 4)
                    .expect("write to Vec failed");
                out.write_u32::<LittleEndian>(buffer.len() as u32)
                    .expect("write to Vec failed");
                out.extend_from_slice(&compressed);
            }
        }
        Ok(out)
    }
}

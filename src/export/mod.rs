//! Export pipelines consuming the processor-mode result surface.

pub mod bgen;
pub mod plink;
pub mod vcf;

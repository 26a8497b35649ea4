//! Compression codec registry for the storage contract and the BGEN emitter.

use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::err::{Error, Result};

/// Supported codec kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CodecKind {
    /// No compression, bytes pass through.
    None,
    /// gzip framing (RFC 1952).
    Gzip,
    /// Raw zlib framing (RFC 1950), used by BGEN.
    #[default]
    Zlib,
    /// Zstandard.
    Zstd,
}

/// A compression codec instance.
pub trait Codec {
    /// The kind of this codec.
    fn kind(&self) -> CodecKind;

    /// Compress `src`, appending the result to `dst`.
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Release any codec resources; further `compress` calls are undefined.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Create a codec of the given kind and compression level.
pub fn create_codec(kind: CodecKind, level: u32) -> Result<Box<dyn Codec>> {
    match kind {
        CodecKind::None => Ok(Box::new(PassthroughCodec)),
        CodecKind::Gzip | CodecKind::Zlib => Ok(Box::new(FlateCodec { kind, level })),
        CodecKind::Zstd => {
            let level = i32::try_from(level)
                .map_err(|_| Error::codec("zstd", format!("invalid level {}", level)))?;
            Ok(Box::new(ZstdCodec { level }))
        }
    }
}

struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::None
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }
}

struct FlateCodec {
    kind: CodecKind,
    level: u32,
}

impl Codec for FlateCodec {
    fn kind(&self) -> CodecKind {
        self.kind
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let compression = Compression::new(self.level);
        let compressed = match self.kind {
            CodecKind::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), compression);
                encoder
                    .write_all(src)
                    .and_then(|()| encoder.finish())
                    .map_err(|e| Error::codec("gzip", e.to_string()))?
            }
            _ => {
                let mut encoder = ZlibEncoder::new(Vec::new(), compression);
                encoder
                    .write_all(src)
                    .and_then(|()| encoder.finish())
                    .map_err(|e| Error::codec("zlib", e.to_string()))?
            }
        };
        dst.extend_from_slice(&compressed);
        Ok(())
    }
}

struct ZstdCodec {
    level: i32,
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let compressed = zstd::stream::encode_all(src, self.level)
            .map_err(|e| Error::codec("zstd", e.to_string()))?;
        dst.extend_from_slice(&compressed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[rstest::rstest]
    #[case(CodecKind::None)]
    #[case(CodecKind::Gzip)]
    #[case(CodecKind::Zlib)]
    #[case(CodecKind::Zstd)]
    fn compress_produces_output(#[case] kind: CodecKind) {
        let mut codec = create_codec(kind, 3).expect("codec creation failed");
        let mut dst = Vec::new();
        codec
            .compress(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", &mut dst)
            .expect("compression failed");
        assert!(!dst.is_empty());
        codec.finalize().expect("finalize failed");
    }

    #[test]
    fn passthrough_is_identity() {
        let mut codec = create_codec(CodecKind::None, 0).expect("codec creation failed");
        let mut dst = Vec::new();
        codec.compress(b"abc", &mut dst).expect("compression failed");
        assert_eq!(dst, b"abc");
    }

    #[test]
    fn zlib_output_is_smaller_for_runs() {
        let mut codec = create_codec(CodecKind::Zlib, 6).expect("codec creation failed");
        let src = vec![0u8; 1024];
        let mut dst = Vec::new();
        codec.compress(&src, &mut dst).expect("compression failed");
        assert!(dst.len() < src.len());
    }
}

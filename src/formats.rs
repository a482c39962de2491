//! Effective output formats of the chunk pipeline and their spool
//! recipes. BCF is already BGZF-compressed by the external tool, so it
//! spools as-is; the rest are lz4-framed until their ordered emit.

use crate::errors::Result;
use crate::spool;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pileup,
    Bcf,
    UncompressedBcf,
    Vcf,
    /// Detected from `-Oz`; rejected during argument normalization.
    GzippedVcf,
}

impl OutputFormat {
    pub fn strip_header_flag(&self) -> &'static str {
        match self {
            OutputFormat::Bcf => "--bcf",
            OutputFormat::UncompressedBcf => "--ubcf",
            OutputFormat::Pileup | OutputFormat::Vcf | OutputFormat::GzippedVcf => "--vcf",
        }
    }

    pub fn spool_compresses(&self) -> bool {
        !matches!(self, OutputFormat::Bcf | OutputFormat::GzippedVcf)
    }

    pub fn decompress_into<W: Write + ?Sized>(&self, bytes: &[u8], sink: &mut W) -> Result<()> {
        if self.spool_compresses() {
            spool::lz4_decompress(bytes, sink)?;
        } else {
            sink.write_all(bytes)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Pileup => "pileup",
            OutputFormat::Bcf => "BCF",
            OutputFormat::UncompressedBcf => "uncompressed BCF",
            OutputFormat::Vcf => "VCF",
            OutputFormat::GzippedVcf => "bgzipped VCF",
        }
    }
}

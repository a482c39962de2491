//! Spool codec and the helper subcommands the chunk pipeline self-invokes.
//!
//! Chunk outputs are buffered in memory until their turn in the ordered
//! emit; bulky formats are lz4-framed on the producing side
//! (`lz4compress`) and inflated only at emit time. `strip_bcf_header`
//! removes the leading header region so chunks 2..K concatenate after
//! chunk 1 into one valid file.

use crate::errors::{AppError, Result};
use noodles_bgzf::io::{Reader as BgzfReader, Writer as BgzfWriter};
use std::io::{self, BufRead, BufReader, Read, Write};

const BCF_MAGIC: &[u8; 3] = b"BCF";

pub fn lz4_compress_stream<R: Read, W: Write>(mut input: R, output: W) -> io::Result<()> {
    let mut encoder = lz4::EncoderBuilder::new().level(1).build(output)?;
    io::copy(&mut input, &mut encoder)?;
    let (_, result) = encoder.finish();
    result
}

pub fn lz4_decompress<W: Write + ?Sized>(bytes: &[u8], sink: &mut W) -> io::Result<()> {
    let mut decoder = lz4::Decoder::new(bytes)?;
    io::copy(&mut decoder, sink)?;
    Ok(())
}

/// Drops leading `#`-prefixed lines, then copies the rest verbatim.
/// Covers VCF and pileup text (the latter has no header lines, so this is
/// a plain copy there).
pub fn strip_text_header<R: BufRead, W: Write>(mut input: R, mut output: W) -> io::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = input.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(());
        }
        if line.starts_with(b"#") {
            continue;
        }
        output.write_all(&line)?;
        break;
    }
    io::copy(&mut input, &mut output)?;
    Ok(())
}

/// Skips the uncompressed-BCF header block: `BCF` magic plus two version
/// bytes, a little-endian `l_text`, and `l_text` bytes of header text.
pub fn strip_ubcf_header<R: Read, W: Write>(mut input: R, mut output: W) -> io::Result<()> {
    let mut magic = [0u8; 5];
    input.read_exact(&mut magic)?;
    if &magic[..3] != BCF_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "input does not start with a BCF header block",
        ));
    }
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let l_text = u64::from(u32::from_le_bytes(len));
    io::copy(&mut input.by_ref().take(l_text), &mut io::sink())?;
    io::copy(&mut input, &mut output)?;
    Ok(())
}

/// BGZF variant of [`strip_ubcf_header`]: decode, strip, re-encode.
/// BGZF streams concatenate, so the re-encoded body appends cleanly after
/// chunk 1's full BCF.
pub fn strip_bgzf_bcf_header<R: Read, W: Write>(input: R, output: W) -> io::Result<()> {
    let reader = BgzfReader::new(input);
    let mut writer = BgzfWriter::new(output);
    strip_ubcf_header(reader, &mut writer)?;
    writer.finish()?;
    Ok(())
}

pub fn strip_header_main(args: &[String]) -> Result<()> {
    let mode = args.first().map(String::as_str).ok_or_else(|| AppError::MissingValue {
        flag: "strip_bcf_header".to_string(),
    })?;
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    match mode {
        "--vcf" => strip_text_header(stdin, stdout)?,
        "--ubcf" => strip_ubcf_header(stdin, stdout)?,
        "--bcf" => strip_bgzf_bcf_header(stdin, stdout)?,
        other => {
            return Err(AppError::InvalidValue {
                flag: "strip_bcf_header".to_string(),
                value: other.to_string(),
                reason: "expected --vcf, --bcf or --ubcf".to_string(),
            });
        }
    }
    Ok(())
}

pub fn lz4_compress_main() -> Result<()> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    lz4_compress_stream(BufReader::new(stdin), stdout)?;
    Ok(())
}

//! Normalization of the pass-through `samtools mpileup` / `bcftools`
//! argument vectors, and the per-chunk shell pipeline builder.

use crate::errors::{AppError, Result};
use crate::formats::OutputFormat;
use std::path::Path;
use tracing::warn;

/// Caller-side flags whose value stays joined to the letter (`-Ov`, `-Ob`,
/// `-Ou`, `-Oz` must survive unbundling intact).
pub const CALLER_KEEP_JOINED: &[char] = &['O'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedToolArgs {
    pub pileup_args: Vec<String>,
    pub caller_args: Vec<String>,
    pub has_caller: bool,
    pub format: OutputFormat,
}

/// Splits bundled short flags: `-abcFOO` (alphabetic run, then anything)
/// becomes `-a -b -c FOO`. Long options, bare values, and tokens whose
/// first flag letter is in `keep_joined` pass through whole.
pub fn unbundle(tokens: &[String], keep_joined: &[char]) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        if !is_bundled_flag(token, keep_joined) {
            out.push(token.clone());
            continue;
        }
        let body = &token[1..];
        let split = body
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(body.len());
        for flag in body[..split].chars() {
            out.push(format!("-{flag}"));
        }
        if split < body.len() {
            out.push(body[split..].to_string());
        }
    }
    out
}

fn is_bundled_flag(token: &str, keep_joined: &[char]) -> bool {
    let Some(body) = token.strip_prefix('-') else {
        return false;
    };
    if body.len() < 2 {
        return false;
    }
    body.chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() && !keep_joined.contains(&first))
}

/// Canonicalizes both pass-through vectors and derives the effective
/// output format of the chunk pipeline.
pub fn normalize(
    pileup_args: &[String],
    caller_args: &[String],
    has_caller: bool,
) -> Result<NormalizedToolArgs> {
    let mut pileup_args = unbundle(pileup_args, &[]);
    let caller_args = unbundle(caller_args, CALLER_KEEP_JOINED);

    reject_output_flag(&pileup_args)?;
    reject_output_flag(&caller_args)?;

    let has_binary = pileup_args.iter().any(|token| token == "-g");
    let has_text_variant = pileup_args.iter().any(|token| token == "-v");
    let has_uncompressed = pileup_args.iter().any(|token| token == "-u");
    if has_binary && has_text_variant {
        return Err(AppError::ArgRejected {
            token: "-g".to_string(),
            reason: "-g (binary) and -v (text variant) output are mutually exclusive".to_string(),
        });
    }

    if has_caller {
        pileup_args.retain(|token| token != "-g" && token != "-v" && token != "-u");
        pileup_args.push("-g".to_string());
        pileup_args.push("-u".to_string());
        warn!(
            "note: a caller stage follows mpileup; its output is rewritten to \
             uncompressed BCF (-g -u) for speed"
        );
    }

    let pileup_format = if has_binary && has_uncompressed {
        OutputFormat::UncompressedBcf
    } else if has_binary {
        OutputFormat::Bcf
    } else if has_text_variant {
        OutputFormat::Vcf
    } else {
        OutputFormat::Pileup
    };

    let format = if has_caller {
        detect_caller_format(&caller_args)?
    } else {
        pileup_format
    };

    Ok(NormalizedToolArgs {
        pileup_args,
        caller_args,
        has_caller,
        format,
    })
}

fn reject_output_flag(tokens: &[String]) -> Result<()> {
    for token in tokens {
        if token == "-o" || token == "--output" || token.starts_with("--output=") {
            return Err(AppError::ArgRejected {
                token: "-o".to_string(),
                reason: "the driver owns the final output; use --output-filename instead"
                    .to_string(),
            });
        }
    }
    Ok(())
}

/// Scans caller args for `-Ov | -Ob | -Ou | -Oz` (joined or separated);
/// the last occurrence wins. Absent any, bcftools defaults to VCF.
fn detect_caller_format(tokens: &[String]) -> Result<OutputFormat> {
    let mut format = OutputFormat::Vcf;
    let mut index = 0;
    while index < tokens.len() {
        let value = match tokens[index].as_str() {
            "-Ov" => Some("v"),
            "-Ob" => Some("b"),
            "-Ou" => Some("u"),
            "-Oz" => Some("z"),
            "-O" => {
                index += 1;
                tokens.get(index).map(String::as_str)
            }
            _ => None,
        };
        match value {
            Some("v") => format = OutputFormat::Vcf,
            Some("b") => format = OutputFormat::Bcf,
            Some("u") => format = OutputFormat::UncompressedBcf,
            Some("z") => format = OutputFormat::GzippedVcf,
            _ => {}
        }
        index += 1;
    }
    if format == OutputFormat::GzippedVcf {
        return Err(AppError::ArgRejected {
            token: "-Oz".to_string(),
            reason: "bgzipped VCF output is not supported by the chunk recombiner".to_string(),
        });
    }
    Ok(format)
}

/// Builds the full shell pipeline for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkCommandLine {
    samtools: String,
    bcftools: Option<String>,
    self_exe: String,
    args: NormalizedToolArgs,
}

impl ChunkCommandLine {
    pub fn new(
        samtools: String,
        bcftools: Option<String>,
        self_exe: String,
        args: NormalizedToolArgs,
    ) -> Self {
        Self {
            samtools,
            bcftools,
            self_exe,
            args,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.args.format
    }

    /// `<samtools> mpileup <fifo> -l <fifo>.bed <args>
    ///   [| <bcftools> <args>] [| strip (num != 1)] [| lz4compress]`
    pub fn build(&self, fifo_path: &Path, num: u64) -> String {
        let fifo = fifo_path.display();
        let mut command = format!("{} mpileup '{fifo}' -l '{fifo}.bed'", self.samtools);
        for arg in &self.args.pileup_args {
            command.push(' ');
            command.push_str(arg);
        }
        if let Some(bcftools) = &self.bcftools {
            command.push_str(" | ");
            command.push_str(bcftools);
            for arg in &self.args.caller_args {
                command.push(' ');
                command.push_str(arg);
            }
        }
        if num != 1 {
            command.push_str(&format!(
                " | '{}' strip_bcf_header {}",
                self.self_exe,
                self.args.format.strip_header_flag()
            ));
        }
        if self.args.format.spool_compresses() {
            command.push_str(&format!(" | '{}' lz4compress", self.self_exe));
        }
        command
    }
}

use crate::chunker::DEFAULT_BUFFER_SIZE;
use crate::errors::{AppError, Result};
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{ArgAction, Parser};

#[derive(Debug, Clone, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct CliArgs {
    #[arg(short = 'L', long = "regions")]
    regions: Option<String>,
    #[arg(short = 'o', long = "output-filename", default_value = "-")]
    output: String,
    #[arg(long = "tmpdir")]
    tmpdir: Option<String>,
    #[arg(short = 't', long = "nthreads")]
    nthreads: Option<String>,
    #[arg(short = 'b', long = "buffer-size")]
    buffer_size: Option<String>,
    #[arg(long = "force", action = ArgAction::SetTrue)]
    force: bool,
    #[arg(long = "progress", action = ArgAction::SetTrue)]
    progress: bool,
    inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PileupDriverArgs {
    pub inputs: Vec<String>,
    pub regions: Option<String>,
    pub output: String,
    pub tmpdir: Option<String>,
    pub nthreads: usize,
    pub buffer_size: usize,
    pub force: bool,
    pub progress: bool,
    pub samtools_args: Vec<String>,
    pub bcftools_args: Vec<String>,
    pub has_caller: bool,
}

impl PileupDriverArgs {
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(AppError::MissingRequired {
                field: "input BAM file(s)".to_string(),
            });
        }
        if self.has_caller && self.bcftools_args.is_empty() {
            return Err(AppError::MissingValue {
                flag: "--bcftools".to_string(),
            });
        }
        Ok(())
    }
}

pub fn parse_from_env() -> Result<PileupDriverArgs> {
    parse_args(std::env::args())
}

pub fn parse_args<I, S>(args: I) -> Result<PileupDriverArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    if tokens.is_empty() {
        tokens.push("sambamba-pileup".to_string());
    }

    let (head, samtools_args, bcftools_args) = split_tool_tails(tokens);
    let cli = CliArgs::try_parse_from(head).map_err(map_clap_error)?;

    let nthreads = match cli.nthreads.as_deref() {
        Some(value) => parse_count("--nthreads", value)?,
        None => default_worker_count(),
    };
    let buffer_size = match cli.buffer_size.as_deref() {
        Some(value) => parse_count("--buffer-size", value)?,
        None => DEFAULT_BUFFER_SIZE,
    };

    let has_caller = bcftools_args.is_some();
    let parsed = PileupDriverArgs {
        inputs: cli.inputs,
        regions: cli.regions,
        output: cli.output,
        tmpdir: cli.tmpdir,
        nthreads: nthreads.max(1),
        buffer_size: buffer_size.max(1),
        force: cli.force,
        progress: cli.progress,
        samtools_args,
        bcftools_args: bcftools_args.unwrap_or_default(),
        has_caller,
    };

    parsed.validate()?;
    Ok(parsed)
}

/// Splits the pass-through tails off the argv: everything after
/// `--samtools` up to `--bcftools` belongs to the pileup tool, everything
/// after `--bcftools` to the caller.
fn split_tool_tails(tokens: Vec<String>) -> (Vec<String>, Vec<String>, Option<Vec<String>>) {
    let mut head = Vec::with_capacity(tokens.len());
    let mut samtools_args = Vec::new();
    let mut bcftools_args: Option<Vec<String>> = None;

    #[derive(PartialEq)]
    enum Section {
        Driver,
        Samtools,
        Bcftools,
    }
    let mut section = Section::Driver;
    for token in tokens {
        match token.as_str() {
            "--samtools" if section == Section::Driver => section = Section::Samtools,
            "--bcftools" if section != Section::Bcftools => {
                bcftools_args = Some(Vec::new());
                section = Section::Bcftools;
            }
            _ => match section {
                Section::Driver => head.push(token),
                Section::Samtools => samtools_args.push(token),
                Section::Bcftools => {
                    if let Some(args) = bcftools_args.as_mut() {
                        args.push(token);
                    }
                }
            },
        }
    }
    (head, samtools_args, bcftools_args)
}

/// Whether the raw argv named at least one positional input; an unknown
/// flag is fatal only when it did.
pub fn invocation_has_inputs<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    let (head, _, _) = split_tool_tails(tokens);
    head.iter().skip(1).any(|token| !token.starts_with('-'))
}

pub fn usage() -> String {
    [
        "Usage: sambamba-pileup [options] input.bam [input2.bam ...]",
        "       [--samtools <args...>] [--bcftools <args...>]",
        "",
        "Options:",
        "  -L, --regions=FILE          BED file restricting the processed regions",
        "  -o, --output-filename=PATH  final output file (default: stdout)",
        "      --tmpdir=DIR            parent directory for the temporary run dir",
        "  -t, --nthreads=N            worker pool size (default: host parallelism)",
        "  -b, --buffer-size=BYTES     target chunk size (default: 67108864)",
        "      --force                 overwrite an existing output file",
        "      --progress              show chunk progress on stderr",
        "      --samtools <args...>    pass-through mpileup arguments (until --bcftools)",
        "      --bcftools <args...>    pass-through caller arguments (rest of the line)",
    ]
    .join("\n")
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Maps clap's structured error onto [`AppError`] using the error kind
/// and the offending-argument context rather than the rendered text.
fn map_clap_error(error: clap::Error) -> AppError {
    let kind = error.kind();
    let offender = offending_argument(&error);
    match kind {
        ErrorKind::UnknownArgument => AppError::UnsupportedArgument {
            arg: offender.unwrap_or_else(|| error.to_string()),
        },
        ErrorKind::TooFewValues | ErrorKind::WrongNumberOfValues => AppError::MissingValue {
            flag: offender.unwrap_or_else(|| "argument".to_string()),
        },
        _ => AppError::ParseError {
            message: match kind.as_str() {
                Some(description) => description.to_string(),
                None => error.to_string(),
            },
        },
    }
}

fn offending_argument(error: &clap::Error) -> Option<String> {
    match error.get(ContextKind::InvalidArg)? {
        ContextValue::String(argument) => Some(argument.clone()),
        ContextValue::Strings(arguments) => arguments.first().cloned(),
        _ => None,
    }
}

fn parse_count(flag: &str, value: &str) -> Result<usize> {
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => Err(AppError::InvalidValue {
            flag: flag.to_string(),
            value: value.to_string(),
            reason: "expected a plain unsigned integer".to_string(),
        }),
    }
}

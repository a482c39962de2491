use sambamba_pileup_rs::errors::{AppError, Result};
use std::process::ExitCode;

const PROGRAM: &str = "sambamba-pileup";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // self-invocation helpers used inside the per-chunk shell pipelines
    match args.get(1).map(String::as_str) {
        Some("strip_bcf_header") => {
            return helper_exit(sambamba_pileup_rs::spool::strip_header_main(&args[2..]));
        }
        Some("lz4compress") => {
            return helper_exit(sambamba_pileup_rs::spool::lz4_compress_main());
        }
        _ => {}
    }

    sambamba_pileup_rs::init_tracing();
    match sambamba_pileup_rs::cli::parse_args(args.iter().cloned())
        .and_then(sambamba_pileup_rs::run_from_args)
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::UnsupportedArgument { arg }) => {
            eprintln!("{PROGRAM}: unsupported argument: {arg}");
            eprintln!("{}", sambamba_pileup_rs::cli::usage());
            if sambamba_pileup_rs::cli::invocation_has_inputs(args.iter().cloned()) {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(error) => {
            eprintln!("{PROGRAM}: {error}");
            ExitCode::from(1)
        }
    }
}

fn helper_exit(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{PROGRAM}: {error}");
            ExitCode::from(1)
        }
    }
}

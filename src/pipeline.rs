use crate::chunker::Chunker;
use crate::cli::PileupDriverArgs;
use crate::dispatcher::{ChunkJob, Dispatcher};
use crate::errors::{AppError, Result};
use crate::external_tools::{self, ExternalTools};
use crate::fifo;
use crate::input::BamInputs;
use crate::tool_args::{self, ChunkCommandLine};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rust_htslib::bam;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// Immutable per-run state threaded through the workers.
pub struct RuntimeContext {
    pub command: ChunkCommandLine,
    pub header: bam::Header,
    pub run_dir: PathBuf,
}

pub fn run(args: &PileupDriverArgs) -> Result<()> {
    let normalized =
        tool_args::normalize(&args.samtools_args, &args.bcftools_args, args.has_caller)?;
    let format = normalized.format;
    let tools = ExternalTools::discover(args.has_caller)?;
    let inputs = BamInputs::open(&args.inputs, args.regions.as_deref().map(Path::new))?;

    let run_dir = create_run_dir(args.tmpdir.as_deref())?;
    let sink = open_sink(&args.output, args.force)?;
    let command = ChunkCommandLine::new(
        tools.samtools.clone(),
        tools.bcftools.clone(),
        self_invocation_path()?,
        normalized,
    );
    let ctx = RuntimeContext {
        command,
        header: inputs.header.clone(),
        run_dir: run_dir.path().to_path_buf(),
    };

    let progress = args.progress.then(progress_bar);
    let target_names = inputs.target_names.clone();
    let chunker = Chunker::new(inputs.into_reads()?, args.buffer_size);
    let dispatcher = Dispatcher::new(
        Box::new(chunker),
        run_dir.path().to_path_buf(),
        target_names,
        format,
        sink,
        progress.clone(),
    );

    let worker_count = args.nthreads.max(1);
    info!(
        workers = worker_count,
        format = format.name(),
        "starting chunk pipeline"
    );

    let mut first_error: Option<AppError> = None;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..worker_count)
            .map(|_| scope.spawn(|| worker_loop(&dispatcher, &ctx)))
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if !error.is_abort() && first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(AppError::ParseError {
                            message: "worker thread panicked".to_string(),
                        });
                    }
                }
            }
        }
    });

    if let Some(error) = first_error {
        return Err(error);
    }
    dispatcher.finish()?;
    if let Some(bar) = &progress {
        bar.finish_with_message("done");
    }
    info!(chunks = dispatcher.chunks_emitted(), "pileup run complete");
    run_dir.close()?;
    Ok(())
}

fn worker_loop(dispatcher: &Dispatcher, ctx: &RuntimeContext) -> Result<()> {
    loop {
        let job = match dispatcher.next_chunk() {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(()),
            Err(error) => {
                dispatcher.abort();
                return Err(error);
            }
        };
        if let Err(error) = process_chunk(job, dispatcher, ctx) {
            dispatcher.abort();
            return Err(error);
        }
    }
}

fn process_chunk(job: ChunkJob, dispatcher: &Dispatcher, ctx: &RuntimeContext) -> Result<()> {
    debug!(
        num = job.num,
        start = job.chunk.start,
        end = job.chunk.end,
        reads = job.chunk.reads.len(),
        "processing chunk"
    );
    fifo::create_fifo(&job.fifo_path)?;
    let command = ctx.command.build(&job.fifo_path, job.num);
    let process = external_tools::spawn_chunk_pipeline(&command, &ctx.run_dir)?;
    // the process must exist before the writer thread starts, or its
    // FIFO-open poll spins until a reader appears
    let writer = fifo::spawn_chunk_writer(
        job.fifo_path.clone(),
        ctx.header.clone(),
        job.chunk.reads,
        dispatcher.abort_flag(),
    );

    let captured = process.capture();
    let writer_result = writer.finish();
    let bytes = captured?;
    writer_result?;

    dispatcher.emit_in_order(job.num, &bytes)
}

fn create_run_dir(tmpdir: Option<&str>) -> Result<TempDir> {
    let parent = tmpdir.map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    let dir = tempfile::Builder::new()
        .prefix("sambamba-fork-")
        .tempdir_in(parent)?;
    debug!(dir = %dir.path().display(), "created run directory");
    Ok(dir)
}

fn open_sink(output: &str, force: bool) -> Result<Box<dyn Write + Send>> {
    if output == "-" {
        return Ok(Box::new(stdout()));
    }
    let path = Path::new(output);
    if path.exists() && !force {
        return Err(AppError::InvalidValue {
            flag: "--output-filename".to_string(),
            value: output.to_string(),
            reason: "output already exists; pass --force to overwrite".to_string(),
        });
    }
    Ok(Box::new(BufWriter::new(File::create(path)?)))
}

fn self_invocation_path() -> Result<String> {
    Ok(std::env::current_exe()?.display().to_string())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_message("starting");
    bar.set_draw_target(ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {elapsed} chunks={pos} {msg}")
    {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(250));
    bar
}

#[cfg(test)]
mod tests {
    use super::open_sink;

    #[test]
    fn refuses_to_clobber_existing_output() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let path = dir.path().join("out.vcf");
        std::fs::write(&path, b"previous run").expect("expected fixture write");

        let target = path.to_string_lossy().to_string();
        assert!(open_sink(&target, false).is_err());
        assert!(open_sink(&target, true).is_ok());
    }

    #[test]
    fn stdout_sink_needs_no_force() {
        assert!(open_sink("-", false).is_ok());
    }
}

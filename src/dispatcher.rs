//! Chunk hand-out and ordered commit. The scheduling lock guards the
//! chunk iterator and the next chunk number; the ordering lock plus
//! condvar guard the next-to-emit counter and the final sink, so chunk n
//! reaches the sink strictly before chunk n+1 regardless of completion
//! order.

use crate::chunker::Chunk;
use crate::errors::{AppError, Result};
use crate::formats::OutputFormat;
use indicatif::ProgressBar;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// A numbered chunk with its FIFO and BED side-car paths; owned by a
/// single worker until emission.
pub struct ChunkJob {
    pub num: u64,
    pub chunk: Chunk,
    pub fifo_path: PathBuf,
    pub bed_path: PathBuf,
}

type ChunkStream = Box<dyn Iterator<Item = Result<Chunk>> + Send>;

struct ScheduleState {
    chunks: ChunkStream,
    next_num: u64,
}

struct EmitState {
    curr_num: u64,
    sink: Box<dyn Write + Send>,
}

pub struct Dispatcher {
    run_dir: PathBuf,
    target_names: Vec<String>,
    format: OutputFormat,
    schedule: Mutex<ScheduleState>,
    emit: Mutex<EmitState>,
    turn: Condvar,
    aborted: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    pub fn new(
        chunks: ChunkStream,
        run_dir: PathBuf,
        target_names: Vec<String>,
        format: OutputFormat,
        sink: Box<dyn Write + Send>,
        progress: Option<ProgressBar>,
    ) -> Self {
        Self {
            run_dir,
            target_names,
            format,
            schedule: Mutex::new(ScheduleState {
                chunks,
                next_num: 1,
            }),
            emit: Mutex::new(EmitState {
                curr_num: 1,
                sink,
            }),
            turn: Condvar::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            progress,
        }
    }

    /// Hands out the next numbered chunk, writing its BED side-car under
    /// the scheduling lock. `None` once the stream is exhausted or the
    /// run aborted.
    pub fn next_chunk(&self) -> Result<Option<ChunkJob>> {
        let mut state = lock(&self.schedule);
        if self.is_aborted() {
            return Ok(None);
        }
        let chunk = match state.chunks.next() {
            None => return Ok(None),
            Some(Err(error)) => {
                drop(state);
                self.abort();
                return Err(error);
            }
            Some(Ok(chunk)) => chunk,
        };

        let num = state.next_num;
        state.next_num += 1;
        let fifo_path = self.run_dir.join(num.to_string());
        let bed_path = PathBuf::from(format!("{}.bed", fifo_path.display()));

        let reference = self
            .target_names
            .get(chunk.ref_id as usize)
            .ok_or_else(|| AppError::ParseError {
                message: format!("chunk references unknown target id {}", chunk.ref_id),
            })?;
        if let Err(error) = fs::write(
            &bed_path,
            format!("{reference}\t{}\t{}\n", chunk.start, chunk.end),
        ) {
            drop(state);
            self.abort();
            return Err(error.into());
        }

        if let Some(bar) = &self.progress {
            bar.set_message(format!("dispatched chunk {num}"));
        }
        Ok(Some(ChunkJob {
            num,
            chunk,
            fifo_path,
            bed_path,
        }))
    }

    /// Blocks until `num == curr_num`, inflates the spooled bytes into
    /// the sink, advances the counter, wakes all waiters.
    pub fn emit_in_order(&self, num: u64, bytes: &[u8]) -> Result<()> {
        let mut state = lock(&self.emit);
        while state.curr_num != num {
            if self.is_aborted() {
                return Err(AppError::Aborted);
            }
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let result = self.format.decompress_into(bytes, &mut state.sink);
        state.curr_num += 1;
        if let Some(bar) = &self.progress {
            bar.inc(1);
            bar.set_message(format!("emitted chunk {num}"));
        }
        self.turn.notify_all();
        drop(state);

        if let Err(error) = result {
            self.abort();
            return Err(error);
        }
        Ok(())
    }

    /// Sticky; stops hand-out and wakes emit waiters into an abort error.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.turn.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    pub fn chunks_emitted(&self) -> u64 {
        lock(&self.emit).curr_num - 1
    }

    pub fn finish(&self) -> Result<()> {
        lock(&self.emit).sink.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkJob, Dispatcher};
    use crate::chunker::Chunk;
    use crate::errors::{AppError, Result};
    use crate::formats::OutputFormat;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("expected sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn synthetic_chunks(count: usize) -> Vec<Result<Chunk>> {
        (0..count)
            .map(|index| {
                Ok(Chunk {
                    ref_id: 0,
                    start: (index as i64) * 100,
                    end: (index as i64 + 1) * 100,
                    reads: Vec::new(),
                })
            })
            .collect()
    }

    fn dispatcher(count: usize, sink: SharedSink, dir: &std::path::Path) -> Dispatcher {
        Dispatcher::new(
            Box::new(synthetic_chunks(count).into_iter()),
            dir.to_path_buf(),
            vec!["chr1".to_string()],
            OutputFormat::Bcf,
            Box::new(sink),
            None,
        )
    }

    #[test]
    fn assigns_dense_numbers_and_writes_bed_sidecars() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let sink = SharedSink::default();
        let dispatcher = dispatcher(3, sink, dir.path());

        let mut numbers = Vec::new();
        while let Some(job) = dispatcher.next_chunk().expect("expected dispatch success") {
            numbers.push(job.num);
            let bed = std::fs::read_to_string(&job.bed_path).expect("expected BED side-car");
            assert_eq!(
                bed,
                format!("chr1\t{}\t{}\n", job.chunk.start, job.chunk.end)
            );
            assert_eq!(job.fifo_path, dir.path().join(job.num.to_string()));
        }
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn emits_in_chunk_order_despite_reversed_completion() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let sink = SharedSink::default();
        let collected = sink.clone();
        let dispatcher = dispatcher(6, sink, dir.path());

        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    loop {
                        let job: Option<ChunkJob> =
                            dispatcher.next_chunk().expect("expected dispatch success");
                        let Some(job) = job else { break };
                        // later chunks finish first
                        std::thread::sleep(Duration::from_millis(30 - 4 * job.num.min(7)));
                        let bytes = format!("chunk {};", job.num).into_bytes();
                        dispatcher
                            .emit_in_order(job.num, &bytes)
                            .expect("expected ordered emit success");
                    }
                });
            }
        });

        let output = collected.0.lock().expect("expected sink lock").clone();
        assert_eq!(
            String::from_utf8(output).expect("expected utf8 sink"),
            "chunk 1;chunk 2;chunk 3;chunk 4;chunk 5;chunk 6;"
        );
        assert_eq!(dispatcher.chunks_emitted(), 6);
    }

    #[test]
    fn abort_stops_handout_and_wakes_waiters() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let sink = SharedSink::default();
        let dispatcher = dispatcher(8, sink, dir.path());

        let first = dispatcher
            .next_chunk()
            .expect("expected dispatch success")
            .expect("expected a first chunk");
        assert_eq!(first.num, 1);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                // chunk 2 can never be next while chunk 1 is unemitted
                dispatcher.emit_in_order(2, b"late")
            });
            std::thread::sleep(Duration::from_millis(20));
            dispatcher.abort();
            let result = waiter.join().expect("expected waiter join");
            assert!(matches!(result, Err(AppError::Aborted)));
        });

        let after = dispatcher.next_chunk().expect("expected dispatch success");
        assert!(after.is_none());
    }
}

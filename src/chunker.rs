//! Splits the merged read stream into bounded, overlapping work chunks.
//! Reads whose alignment crosses a cut boundary are cloned into the
//! following chunk so both neighbors can pile up positions near it; the
//! BED side-car makes the external tool discard the out-of-region
//! overlap.

use crate::errors::{AppError, Result};
use rust_htslib::bam;
use rust_htslib::bam::ext::BamRecordExtensions;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// One unit of external-tool work: a contiguous region and the reads
/// covering it.
#[derive(Debug)]
pub struct Chunk {
    pub ref_id: u32,
    /// 0-based inclusive.
    pub start: i64,
    /// 0-based exclusive.
    pub end: i64,
    pub reads: Vec<bam::Record>,
}

pub struct Chunker<I> {
    reads: I,
    budget: usize,
    lookahead: Option<bam::Record>,
    pending: Vec<bam::Record>,
    pending_bytes: usize,
    open: bool,
    ref_id: i32,
    chunk_start: i64,
    max_end: i64,
    last_pos: i64,
    finished: bool,
}

impl<I> Chunker<I>
where
    I: Iterator<Item = Result<bam::Record>>,
{
    pub fn new(reads: I, budget: usize) -> Self {
        Self {
            reads,
            budget: budget.max(1),
            lookahead: None,
            pending: Vec::new(),
            pending_bytes: 0,
            open: false,
            ref_id: -1,
            chunk_start: 0,
            max_end: 0,
            last_pos: 0,
            finished: false,
        }
    }

    fn start_chunk(&mut self, ref_id: i32, start: i64) {
        self.open = true;
        self.ref_id = ref_id;
        self.chunk_start = start;
        self.max_end = start;
        self.last_pos = start;
    }

    fn accumulate(&mut self, record: bam::Record) {
        self.pending_bytes += approx_record_size(&record);
        self.last_pos = record.pos();
        self.max_end = self.max_end.max(record.reference_end());
        self.pending.push(record);
    }

    // nothing is carried across references
    fn cut_at_reference_end(&mut self) -> Chunk {
        self.open = false;
        self.pending_bytes = 0;
        Chunk {
            ref_id: self.ref_id as u32,
            start: self.chunk_start,
            end: self.max_end,
            reads: std::mem::take(&mut self.pending),
        }
    }

    /// Closes the running chunk at `boundary`; the next one starts with
    /// clones of every read whose alignment crosses it.
    fn cut_at_boundary(&mut self, boundary: i64) -> Chunk {
        let carried: Vec<bam::Record> = self
            .pending
            .iter()
            .filter(|record| record.reference_end() > boundary)
            .cloned()
            .collect();
        let chunk = Chunk {
            ref_id: self.ref_id as u32,
            start: self.chunk_start,
            end: boundary,
            reads: std::mem::replace(&mut self.pending, carried),
        };
        self.pending_bytes = self.pending.iter().map(|r| approx_record_size(r)).sum();
        self.max_end = self
            .pending
            .iter()
            .map(|record| record.reference_end())
            .max()
            .unwrap_or(boundary);
        self.chunk_start = boundary;
        self.last_pos = boundary;
        chunk
    }
}

impl<I> Iterator for Chunker<I>
where
    I: Iterator<Item = Result<bam::Record>>,
{
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let record = match self.lookahead.take() {
                Some(record) => record,
                None => match self.reads.next() {
                    None => {
                        self.finished = true;
                        if self.open && !self.pending.is_empty() {
                            return Some(Ok(self.cut_at_reference_end()));
                        }
                        return None;
                    }
                    Some(Err(error)) => {
                        self.finished = true;
                        return Some(Err(error));
                    }
                    Some(Ok(record)) => record,
                },
            };

            if record.tid() < 0 {
                continue;
            }
            if !self.open {
                self.start_chunk(record.tid(), record.pos());
                self.accumulate(record);
                continue;
            }

            if record.tid() != self.ref_id {
                if record.tid() < self.ref_id {
                    self.finished = true;
                    return Some(Err(not_sorted(&record)));
                }
                self.lookahead = Some(record);
                return Some(Ok(self.cut_at_reference_end()));
            }
            if record.pos() < self.last_pos {
                self.finished = true;
                return Some(Err(not_sorted(&record)));
            }
            if self.pending_bytes >= self.budget && record.pos() > self.last_pos {
                let boundary = record.pos();
                self.lookahead = Some(record);
                return Some(Ok(self.cut_at_boundary(boundary)));
            }
            self.accumulate(record);
        }
    }
}

fn not_sorted(record: &bam::Record) -> AppError {
    AppError::ParseError {
        message: format!(
            "input is not coordinate-sorted near read {}",
            String::from_utf8_lossy(record.qname())
        ),
    }
}

// only steers chunk cuts, exactness is not required
fn approx_record_size(record: &bam::Record) -> usize {
    let seq_len = record.seq_len();
    32 + record.qname().len() + 1 + 4 * record.cigar().len() + seq_len.div_ceil(2) + seq_len + 64
}

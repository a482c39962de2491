//! One or more coordinate-sorted BAMs merged into a single ordered read
//! stream, optionally restricted to the regions of a BED file.

use crate::errors::{AppError, Result};
use bio::io::bed;
use rust_htslib::bam::{self, Read as BamRead};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpan {
    pub tid: u32,
    pub start: i64,
    pub end: i64,
}

pub struct BamInputs {
    pub header: bam::Header,
    pub target_names: Vec<String>,
    pub target_lens: Vec<u64>,
    sources: Vec<Source>,
}

enum Source {
    Whole(bam::Reader),
    Indexed {
        reader: bam::IndexedReader,
        spans: Vec<RegionSpan>,
        next_span: usize,
        fetched: bool,
    },
}

impl BamInputs {
    pub fn open(paths: &[String], regions_bed: Option<&Path>) -> Result<Self> {
        let first = paths.first().ok_or_else(|| AppError::ParseError {
            message: "at least one input BAM is required".to_string(),
        })?;

        let (header, target_names, target_lens, sources) = match regions_bed {
            None => {
                let mut readers = Vec::with_capacity(paths.len());
                for path in paths {
                    readers.push(bam::Reader::from_path(path)?);
                }
                let (names, lens) = reference_info(readers[0].header());
                for (path, reader) in paths.iter().zip(&readers).skip(1) {
                    check_reference_compat(first, path, &names, &lens, reader.header())?;
                }
                let header = bam::Header::from_template(readers[0].header());
                let sources = readers.into_iter().map(Source::Whole).collect();
                (header, names, lens, sources)
            }
            Some(bed_path) => {
                let mut readers = Vec::with_capacity(paths.len());
                for path in paths {
                    readers.push(bam::IndexedReader::from_path(path)?);
                }
                let (names, lens) = reference_info(readers[0].header());
                for (path, reader) in paths.iter().zip(&readers).skip(1) {
                    check_reference_compat(first, path, &names, &lens, reader.header())?;
                }
                let header = bam::Header::from_template(readers[0].header());
                let spans = coalesce_spans(read_bed_spans(bed_path, &names, &lens)?);
                let sources = readers
                    .into_iter()
                    .map(|reader| Source::Indexed {
                        reader,
                        spans: spans.clone(),
                        next_span: 0,
                        fetched: false,
                    })
                    .collect();
                (header, names, lens, sources)
            }
        };

        Ok(Self {
            header,
            target_names,
            target_lens,
            sources,
        })
    }

    pub fn into_reads(self) -> Result<MergedReads> {
        MergedReads::new(self.sources)
    }
}

fn reference_info(header: &bam::HeaderView) -> (Vec<String>, Vec<u64>) {
    let mut names = Vec::with_capacity(header.target_count() as usize);
    let mut lens = Vec::with_capacity(header.target_count() as usize);
    for tid in 0..header.target_count() {
        names.push(String::from_utf8_lossy(header.tid2name(tid)).into_owned());
        lens.push(header.target_len(tid).unwrap_or(0));
    }
    (names, lens)
}

fn check_reference_compat(
    first_path: &str,
    path: &str,
    names: &[String],
    lens: &[u64],
    header: &bam::HeaderView,
) -> Result<()> {
    let (other_names, other_lens) = reference_info(header);
    if other_names != names || other_lens != lens {
        return Err(AppError::ParseError {
            message: format!(
                "reference sequences of {path} differ from {first_path}; \
                 inputs cannot be merged"
            ),
        });
    }
    Ok(())
}

fn read_bed_spans(bed_path: &Path, names: &[String], lens: &[u64]) -> Result<Vec<RegionSpan>> {
    let mut reader = bed::Reader::from_file(bed_path).map_err(|err| AppError::ParseError {
        message: format!("failed to open BED {}: {err}", bed_path.display()),
    })?;
    let mut spans = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| AppError::ParseError {
            message: format!("invalid BED record in {}: {err}", bed_path.display()),
        })?;
        let tid = resolve_tid(names, record.chrom()).ok_or_else(|| AppError::ParseError {
            message: format!(
                "BED reference {} not present in the BAM header",
                record.chrom()
            ),
        })?;
        let end = (record.end() as i64).min(lens[tid as usize] as i64);
        let start = record.start() as i64;
        if start < end {
            spans.push(RegionSpan { tid, start, end });
        }
    }
    Ok(spans)
}

fn resolve_tid(names: &[String], chrom: &str) -> Option<u32> {
    names
        .iter()
        .position(|name| name == chrom)
        .map(|index| index as u32)
}

// indexed fetch must visit each position at most once
fn coalesce_spans(mut spans: Vec<RegionSpan>) -> Vec<RegionSpan> {
    spans.sort_by_key(|span| (span.tid, span.start, span.end));
    let mut merged: Vec<RegionSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if last.tid == span.tid && span.start <= last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// A read overlapping two adjacent spans is emitted only in the first;
/// fetch of a later span skips reads that already overlapped the span
/// before it.
fn seen_in_previous_span(spans: &[RegionSpan], index: usize, tid: i32, pos: i64) -> bool {
    if index == 0 {
        return false;
    }
    let previous = &spans[index - 1];
    previous.tid as i32 == tid && pos < previous.end
}

struct SourceCursor {
    source: Source,
    pending: Option<bam::Record>,
}

/// K-way merge of the per-file read streams by `(tid, pos)`.
pub struct MergedReads {
    cursors: Vec<SourceCursor>,
    done: bool,
}

impl MergedReads {
    fn new(sources: Vec<Source>) -> Result<Self> {
        let mut cursors = sources
            .into_iter()
            .map(|source| SourceCursor {
                source,
                pending: None,
            })
            .collect::<Vec<_>>();
        for cursor in &mut cursors {
            refill(cursor)?;
        }
        Ok(Self {
            cursors,
            done: false,
        })
    }
}

impl Iterator for MergedReads {
    type Item = Result<bam::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next_index = self
            .cursors
            .iter()
            .enumerate()
            .filter_map(|(index, cursor)| {
                cursor
                    .pending
                    .as_ref()
                    .map(|record| (index, record.tid(), record.pos()))
            })
            .min_by_key(|&(index, tid, pos)| (tid, pos, index))
            .map(|(index, _, _)| index)?;

        let cursor = &mut self.cursors[next_index];
        let record = cursor.pending.take();
        if let Err(error) = refill(cursor) {
            self.done = true;
            return Some(Err(error));
        }
        record.map(Ok)
    }
}

fn refill(cursor: &mut SourceCursor) -> Result<()> {
    cursor.pending = None;
    match &mut cursor.source {
        Source::Whole(reader) => loop {
            let mut record = bam::Record::new();
            match reader.read(&mut record) {
                None => return Ok(()),
                Some(Err(error)) => return Err(error.into()),
                Some(Ok(())) => {
                    if record.tid() < 0 {
                        continue;
                    }
                    cursor.pending = Some(record);
                    return Ok(());
                }
            }
        },
        Source::Indexed {
            reader,
            spans,
            next_span,
            fetched,
        } => loop {
            if *next_span >= spans.len() {
                return Ok(());
            }
            if !*fetched {
                let span = spans[*next_span];
                reader.fetch((span.tid as i32, span.start, span.end))?;
                *fetched = true;
            }
            let mut record = bam::Record::new();
            match reader.read(&mut record) {
                None => {
                    *fetched = false;
                    *next_span += 1;
                    continue;
                }
                Some(Err(error)) => return Err(error.into()),
                Some(Ok(())) => {
                    if record.tid() < 0 {
                        continue;
                    }
                    if seen_in_previous_span(spans, *next_span, record.tid(), record.pos()) {
                        continue;
                    }
                    cursor.pending = Some(record);
                    return Ok(());
                }
            }
        },
    }
}

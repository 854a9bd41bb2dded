//! Ring utilities behind `evtflow inspect`, `evtflow feed` and `evtflow drain`
//!
//! Records travel through files and pipes as length-prefixed frames, the
//! same framing the control pipe uses. Each frame body is one encoded
//! [`EventRecord`].

use crate::formatting::format_ring_stats;
use anyhow::{Context, bail};
use evtflow_ipc::{EventRecord, FrameError, RingBuffer, read_raw_frame, write_raw_frame};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often `drain` reports that it is still waiting
const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Options for [`feed`]
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Create the ring if it does not exist yet
    pub create: bool,
    /// Capacity used when the ring is created
    pub capacity: usize,
    /// Append an end-of-run record after the last input record
    pub end_of_run: bool,
}

/// What [`feed`] pushed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Records read from the input and pushed
    pub records: u64,
    /// Encoded bytes pushed
    pub bytes: u64,
    /// Whether the ring now carries an end-of-run record
    pub end_of_run: bool,
}

/// Options for [`drain`]
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    /// Give up when nothing arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Unlink the ring once the end-of-run record was read
    pub destroy: bool,
}

/// What [`drain`] read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records written out, end-of-run included
    pub records: u64,
    /// Gap markers among them
    pub gaps: u64,
    /// Results carrying the error flag
    pub errors: u64,
    /// Whether the end-of-run record was seen
    pub end_of_run: bool,
}

/// Print counters of an existing ring
pub fn inspect(name: &str) -> anyhow::Result<String> {
    let ring = RingBuffer::attach(name).with_context(|| format!("attaching ring '{}'", name))?;
    let stats = ring.stats()?;
    Ok(format_ring_stats(ring.name(), &stats))
}

/// Open the source of `feed`: a file, or stdin when `path` is `None` or `-`
pub fn open_input(path: Option<&Path>) -> anyhow::Result<Box<dyn Read>> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = File::open(p).with_context(|| format!("opening {}", p.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(std::io::stdin().lock()))),
    }
}

/// Open the sink of `drain`: a file, or stdout when `path` is `None` or `-`
pub fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = File::create(p).with_context(|| format!("creating {}", p.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        _ => Ok(Box::new(BufWriter::new(std::io::stdout().lock()))),
    }
}

/// Push every framed record from `input` into the ring, blocking while it is full.
///
/// Records are validated before they are pushed. When `end_of_run` is set an
/// end-of-run record follows, numbered one past the highest sequence seen.
pub fn feed<R: Read>(
    ring_name: &str,
    input: &mut R,
    options: &FeedOptions,
) -> anyhow::Result<FeedReport> {
    let ring = if options.create {
        RingBuffer::open_or_create(ring_name, options.capacity)
    } else {
        RingBuffer::attach(ring_name)
    }
    .with_context(|| format!("opening ring '{}'", ring_name))?;

    let mut report = FeedReport::default();
    let mut last: Option<(u64, u32, u32)> = None;
    loop {
        let bytes = match read_raw_frame(input) {
            Ok(bytes) => bytes,
            Err(FrameError::EndOfStream) => break,
            Err(e) => return Err(e).context("reading input records"),
        };
        let record = EventRecord::decode(&bytes)
            .with_context(|| format!("input record #{} is malformed", report.records + 1))?;
        if record.is_end_of_run() {
            report.end_of_run = true;
        }
        ring.push(&bytes)?;
        report.records += 1;
        report.bytes += bytes.len() as u64;
        last = Some(match last {
            Some((seq, _, _)) if seq > record.sequence => (seq, record.experiment, record.run),
            _ => (record.sequence, record.experiment, record.run),
        });
        if report.end_of_run {
            if options.end_of_run {
                warn!("input already ends the run, not appending another end-of-run record");
            }
            break;
        }
    }

    if options.end_of_run && !report.end_of_run {
        let (sequence, experiment, run) = match last {
            Some((seq, experiment, run)) => (seq + 1, experiment, run),
            None => (0, 0, 0),
        };
        ring.push(&EventRecord::end_of_run(sequence, experiment, run).encode())?;
        report.end_of_run = true;
        debug!(sequence, "appended end-of-run record");
    }

    info!(
        ring = ring_name,
        records = report.records,
        bytes = report.bytes,
        "feed complete"
    );
    Ok(report)
}

/// Pop records into `out` until the end-of-run record has been copied.
pub fn drain<W: Write>(
    ring_name: &str,
    out: &mut W,
    options: &DrainOptions,
) -> anyhow::Result<DrainReport> {
    let ring =
        RingBuffer::attach(ring_name).with_context(|| format!("attaching ring '{}'", ring_name))?;

    let mut report = DrainReport::default();
    let mut last_activity = Instant::now();
    loop {
        let wait = match options.idle_timeout {
            Some(limit) => {
                let idle = last_activity.elapsed();
                if idle >= limit {
                    bail!(
                        "no record arrived on '{}' for {:?} ({} drained so far)",
                        ring_name,
                        limit,
                        report.records
                    );
                }
                (limit - idle).min(DRAIN_PROGRESS_INTERVAL)
            }
            None => DRAIN_PROGRESS_INTERVAL,
        };

        let Some(bytes) = ring.pop_timeout(wait)? else {
            debug!(ring = ring_name, drained = report.records, "waiting for records");
            continue;
        };
        last_activity = Instant::now();

        write_raw_frame(out, &bytes)?;
        report.records += 1;
        match EventRecord::decode(&bytes) {
            Ok(record) if record.is_end_of_run() => {
                report.end_of_run = true;
                break;
            }
            Ok(record) if record.is_gap() => report.gaps += 1,
            Ok(record) if record.is_error() => report.errors += 1,
            Ok(_) => {}
            Err(e) => warn!(ring = ring_name, "drained a malformed record: {}", e),
        }
    }
    out.flush()?;

    if options.destroy {
        ring.destroy()?;
    }
    info!(
        ring = ring_name,
        records = report.records,
        gaps = report.gaps,
        errors = report.errors,
        "drain complete"
    );
    Ok(report)
}

/// Read every framed record from a byte stream
pub fn read_records<R: Read>(input: &mut R) -> anyhow::Result<Vec<EventRecord>> {
    let mut records = Vec::new();
    loop {
        match read_raw_frame(input) {
            Ok(bytes) => records.push(EventRecord::decode(&bytes)?),
            Err(FrameError::EndOfStream) => return Ok(records),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Frame a batch of records into a byte stream
pub fn write_records<W: Write>(out: &mut W, records: &[EventRecord]) -> anyhow::Result<()> {
    for record in records {
        write_raw_frame(out, &record.encode())?;
    }
    Ok(())
}

//! Component H: persisted call-site history.
//!
//! A plain-text, line-based file (one per instrumented process image,
//! conventionally named `<binary>_callstack.info`) carrying every call
//! site's counters and captured frames across runs, so a site that was
//! "interesting" last time starts this run already favored. Grounded in
//! the original `operator<<`/`operator>>` for `callstack` and
//! `causer::saveHistoryInfo`/`loadHistoryInfo`: same boost-at-save
//! heuristic, same by-filename base relocation on load to survive ASLR.

use crate::callsite::{CallsiteRecord, CallsiteTable, Fingerprint};
use crate::config::R_CAP;
use crate::error::{Error, Result};
use crate::process_map::ProcessMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Record {
    called_counter: u64,
    watched_counter: u64,
    watched_ratio: i64,
    frames: Vec<u64>,
}

/// Write every call site currently known to `table` to `path`. If no site
/// has been pinned to `R_CAP` (i.e. no proven overflow was found this run),
/// apply a one-shot "boost" to under-sampled sites' persisted ratio so they
/// get more attention next run, exactly as `saveHistoryInfo` does.
pub fn save(path: &Path, table: &CallsiteTable, maps: &ProcessMap) -> Result<()> {
    let records = table.snapshot();
    if records.is_empty() {
        return Ok(());
    }

    let boost_enabled = !records.iter().any(|r| r.watched_ratio() == R_CAP);

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{}", records.len())?;
    for r in &records {
        write_record(&mut out, r, maps, boost_enabled)?;
    }
    Ok(())
}

fn boosted_ratio(r: &CallsiteRecord) -> i64 {
    let ratio = r.watched_ratio();
    if ratio == R_CAP {
        return ratio;
    }
    let watched = r.watched_counter.load(Ordering::Relaxed);
    let boosted = if watched < 2 {
        ratio + (R_CAP >> 1)
    } else if watched < 5 {
        ratio + (R_CAP / (watched as i64 + 1))
    } else {
        ratio
    };
    boosted.min(R_CAP - 1)
}

fn write_record(out: &mut impl Write, r: &Arc<CallsiteRecord>, maps: &ProcessMap, boost_enabled: bool) -> Result<()> {
    let ratio = if boost_enabled { boosted_ratio(r) } else { r.watched_ratio() };
    let frames = r.fingerprint.frames();
    writeln!(
        out,
        "{} {} {} {}",
        frames.len(),
        r.called_counter.load(Ordering::Relaxed),
        r.watched_counter.load(Ordering::Relaxed),
        ratio,
    )?;
    for &addr in frames {
        let (_, loc) = maps.classify(addr);
        match loc {
            Some((file, offset)) => writeln!(out, "{file} {offset} {addr}")?,
            None => writeln!(out, "_ 0 {addr}")?,
        }
    }
    Ok(())
}

/// Load a previously saved history file and seed `table` with a record per
/// persisted call site. Call sites the current run has not yet observed
/// get their saved counters; call sites already present win over the file
/// (see [`CallsiteTable::insert_loaded`]). Frame addresses are rebased
/// through `maps` by filename, since the library and application may be
/// loaded at a different ASLR base than when the file was written.
pub fn load(path: &Path, table: &CallsiteTable, maps: &ProcessMap) -> Result<usize> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::HistoryIo(e)),
    };
    let mut lines = BufReader::new(file).lines();

    let total: usize = match lines.next() {
        Some(line) => line?
            .trim()
            .parse()
            .map_err(|_| Error::HistoryMalformed(1, "expected a record count".into()))?,
        None => return Ok(0),
    };

    let mut loaded = 0;
    let mut lineno = 1;
    for _ in 0..total {
        lineno += 1;
        let header = match lines.next() {
            Some(l) => l?,
            None => return Err(Error::HistoryMalformed(lineno, "truncated file".into())),
        };
        let record = parse_header(&header, lineno)?;
        let mut frames = Vec::with_capacity(record.frames.len());
        for _ in 0..record.frames.len() {
            lineno += 1;
            let frame_line = match lines.next() {
                Some(l) => l?,
                None => return Err(Error::HistoryMalformed(lineno, "truncated frame record".into())),
            };
            frames.push(parse_frame(&frame_line, maps, lineno)?);
        }
        if !frames.is_empty() {
            let fingerprint = Fingerprint::capture(&frames);
            table.insert_loaded(fingerprint, record.called_counter, record.watched_counter, record.watched_ratio);
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn parse_header(line: &str, lineno: usize) -> Result<Record> {
    let mut parts = line.split_whitespace();
    let depth: usize = next_field(&mut parts, lineno)?;
    let called_counter: u64 = next_field(&mut parts, lineno)?;
    let watched_counter: u64 = next_field(&mut parts, lineno)?;
    let watched_ratio: i64 = next_field(&mut parts, lineno)?;
    Ok(Record {
        called_counter,
        watched_counter,
        watched_ratio,
        frames: vec![0; depth],
    })
}

fn next_field<T: std::str::FromStr>(parts: &mut std::str::SplitWhitespace, lineno: usize) -> Result<T> {
    parts
        .next()
        .ok_or_else(|| Error::HistoryMalformed(lineno, "missing field".into()))?
        .parse()
        .map_err(|_| Error::HistoryMalformed(lineno, "unparseable field".into()))
}

fn parse_frame(line: &str, maps: &ProcessMap, lineno: usize) -> Result<u64> {
    let mut parts = line.split_whitespace();
    let file = parts.next().ok_or_else(|| Error::HistoryMalformed(lineno, "missing file field".into()))?;
    let offset: u64 = next_field(&mut parts, lineno)?;
    let raw_addr: u64 = next_field(&mut parts, lineno)?;

    if file != "_" {
        if let Some(m) = maps.mapping_by_filename(file) {
            return Ok(m.start + offset);
        }
    }
    Ok(raw_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_sample(buf: &mut Vec<u8>) {
        let mut out = Cursor::new(buf);
        writeln!(out, "1").unwrap();
        writeln!(out, "2 10 3 400").unwrap();
        writeln!(out, "_ 0 4096").unwrap();
        writeln!(out, "_ 0 8192").unwrap();
    }

    #[test]
    fn boosted_ratio_caps_below_r_cap() {
        let r = Arc::new(CallsiteRecord {
            fingerprint: Fingerprint::capture(&[0x1]),
            called_counter: std::sync::atomic::AtomicU64::new(1),
            watched_counter: std::sync::atomic::AtomicU64::new(1),
            watched_ratio: std::sync::atomic::AtomicI64::new(R_CAP - 5),
            period: std::sync::atomic::AtomicU64::new(0),
            period_called: std::sync::atomic::AtomicU64::new(0),
            #[cfg(feature = "statistics")]
            alloc_index: std::sync::atomic::AtomicU64::new(0),
        });
        assert_eq!(boosted_ratio(&r), R_CAP - 1);
    }

    #[test]
    fn pinned_ratio_is_not_boosted() {
        let r = Arc::new(CallsiteRecord {
            fingerprint: Fingerprint::capture(&[0x2]),
            called_counter: std::sync::atomic::AtomicU64::new(1),
            watched_counter: std::sync::atomic::AtomicU64::new(9),
            watched_ratio: std::sync::atomic::AtomicI64::new(R_CAP),
            period: std::sync::atomic::AtomicU64::new(0),
            period_called: std::sync::atomic::AtomicU64::new(0),
            #[cfg(feature = "statistics")]
            alloc_index: std::sync::atomic::AtomicU64::new(0),
        });
        assert_eq!(boosted_ratio(&r), R_CAP);
    }

    #[test]
    fn parse_header_reads_all_fields() {
        let rec = parse_header("2 10 3 400", 1).unwrap();
        assert_eq!(rec.frames.len(), 2);
        assert_eq!(rec.called_counter, 10);
        assert_eq!(rec.watched_counter, 3);
        assert_eq!(rec.watched_ratio, 400);
    }

    #[test]
    fn roundtrip_sample_buffer_parses_without_error() {
        let mut buf = Vec::new();
        write_sample(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "1");
        let header = lines.next().unwrap();
        let rec = parse_header(header, 2).unwrap();
        assert_eq!(rec.frames.len(), 2);
    }
}

//! Offline reader for the `<binary>_callstack.info` history format.
//!
//! Deliberately independent of `causer::history::load`: that loader rebases
//! frames against a *live* process's `ProcessMap`, which this CLI does not
//! have. Here the on-disk `(file, offset)` pair is exactly what a
//! [`causer::symbolication::Symbolicate`] needs, with no rebasing step.

use causer::error::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Frame {
    pub file: Option<String>,
    pub offset: u64,
    pub addr: u64,
}

#[derive(Debug, Clone)]
pub struct Site {
    pub called_counter: u64,
    pub watched_counter: u64,
    pub watched_ratio: i64,
    pub frames: Vec<Frame>,
}

pub fn read(path: &Path) -> Result<Vec<Site>> {
    let file = File::open(path).map_err(Error::HistoryIo)?;
    parse(BufReader::new(file))
}

fn parse(reader: impl BufRead) -> Result<Vec<Site>> {
    let mut lines = reader.lines();

    let total: usize = match lines.next() {
        Some(line) => line
            .map_err(Error::HistoryIo)?
            .trim()
            .parse()
            .map_err(|_| Error::HistoryMalformed(1, "expected a record count".into()))?,
        None => return Ok(Vec::new()),
    };

    let mut sites = Vec::with_capacity(total);
    let mut lineno = 1;
    for _ in 0..total {
        lineno += 1;
        let header = lines
            .next()
            .ok_or_else(|| Error::HistoryMalformed(lineno, "truncated file".into()))?
            .map_err(Error::HistoryIo)?;
        let mut parts = header.split_whitespace();
        let depth: usize = next(&mut parts, lineno)?;
        let called_counter: u64 = next(&mut parts, lineno)?;
        let watched_counter: u64 = next(&mut parts, lineno)?;
        let watched_ratio: i64 = next(&mut parts, lineno)?;

        let mut frames = Vec::with_capacity(depth);
        for _ in 0..depth {
            lineno += 1;
            let line = lines
                .next()
                .ok_or_else(|| Error::HistoryMalformed(lineno, "truncated frame record".into()))?
                .map_err(Error::HistoryIo)?;
            let mut fparts = line.split_whitespace();
            let file: String = next(&mut fparts, lineno)?;
            let offset: u64 = next(&mut fparts, lineno)?;
            let addr: u64 = next(&mut fparts, lineno)?;
            frames.push(Frame {
                file: if file == "_" { None } else { Some(file) },
                offset,
                addr,
            });
        }

        sites.push(Site {
            called_counter,
            watched_counter,
            watched_ratio,
            frames,
        });
    }
    Ok(sites)
}

fn next<T: std::str::FromStr>(parts: &mut std::str::SplitWhitespace, lineno: usize) -> Result<T> {
    parts
        .next()
        .ok_or_else(|| Error::HistoryMalformed(lineno, "missing field".into()))?
        .parse()
        .map_err(|_| Error::HistoryMalformed(lineno, "unparseable field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> &'static str {
        "1\n2 10 3 400\n/usr/bin/app 4096 93824992247808\n_ 0 139984\n"
    }

    #[test]
    fn reads_a_single_site_with_two_frames() {
        let sites = parse(Cursor::new(sample())).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].called_counter, 10);
        assert_eq!(sites[0].watched_counter, 3);
        assert_eq!(sites[0].watched_ratio, 400);
        assert_eq!(sites[0].frames.len(), 2);
        assert_eq!(sites[0].frames[0].file.as_deref(), Some("/usr/bin/app"));
        assert!(sites[0].frames[1].file.is_none());
    }

    #[test]
    fn missing_file_is_a_history_io_error() {
        let err = read(Path::new("/nonexistent/does-not-exist.info")).unwrap_err();
        assert!(matches!(err, Error::HistoryIo(_)));
    }

    #[test]
    fn truncated_file_is_malformed() {
        let err = parse(Cursor::new("1\n2 10 3 400\n")).unwrap_err();
        assert!(matches!(err, Error::HistoryMalformed(..)));
    }
}

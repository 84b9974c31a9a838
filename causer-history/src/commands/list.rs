use crate::reader;
use causer::error::Result;
use std::path::Path;

/// Find every `*_callstack.info` file in `dir`.
pub fn find_histories(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut found = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(causer::error::Error::HistoryIo)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with("_callstack.info")) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let histories = find_histories(search_dir)?;

    if histories.is_empty() {
        println!("No callstack history files found in {}", search_dir.display());
        return Ok(());
    }

    println!("{:<40} {:>10} {:>10}", "FILE", "SITES", "HOT");
    println!("{}", "-".repeat(62));

    for path in histories {
        let filename = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let sites = reader::read(&path)?;
        let hot = sites.iter().filter(|s| s.watched_ratio >= causer::config::R_CAP).count();
        println!("{:<40} {:>10} {:>10}", filename, sites.len(), hot);
    }

    Ok(())
}

use crate::reader::{self, Site};
use causer::error::Result;
use causer::symbolication::{DwarfSymbolicator, Symbolicate};
use std::path::Path;

pub fn run(file: &Path, by_ratio: bool, top: Option<usize>, symbolicate: bool) -> Result<()> {
    let mut sites = reader::read(file)?;

    if sites.is_empty() {
        println!("{} has no recorded call sites", file.display());
        return Ok(());
    }

    if by_ratio {
        sites.sort_by(|a, b| b.watched_ratio.cmp(&a.watched_ratio));
    }
    if let Some(n) = top {
        sites.truncate(n);
    }

    let symbolicator = symbolicate.then(DwarfSymbolicator::new);

    println!("{:>8} {:>8} {:>10}  SITE", "CALLED", "WATCHED", "RATIO");
    println!("{}", "-".repeat(72));
    for site in &sites {
        print_site(site, symbolicator.as_ref());
    }

    Ok(())
}

fn print_site(site: &Site, symbolicator: Option<&DwarfSymbolicator>) {
    println!("{:>8} {:>8} {:>10}", site.called_counter, site.watched_counter, site.watched_ratio);
    for frame in &site.frames {
        match (&frame.file, symbolicator) {
            (Some(path), Some(sym)) => {
                let loc = sym.resolve(Path::new(path), frame.offset);
                println!("    at {:#x}  {}", frame.addr, loc.display());
            }
            (Some(path), None) => println!("    at {:#x}  {path}+{:#x}", frame.addr, frame.offset),
            (None, _) => println!("    at {:#x}  ??", frame.addr),
        }
    }
}

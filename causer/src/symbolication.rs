//! Thin symbolication collaborator: turns a `(file, offset)` pair from
//! `process_map::ProcessMap` into a human-readable `file:line` and, when
//! `trap-origin-detail` is enabled, a demangled symbol name. This is an
//! out-of-scope external collaborator per the design — no custom DWARF
//! expression evaluation or inlined-frame support, just enough to produce
//! a report a developer can act on. Grounded in the teacher's
//! `symbols::resolver::SymbolResolver`, trimmed to a single per-file
//! line-table lookup with no ASLR bookkeeping of its own (the caller
//! already passes a load-relative offset).

use object::{Object, ObjectSymbol};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            file: "??".into(),
            line: 0,
            function: "??".into(),
        }
    }

    pub fn display(&self) -> String {
        if self.line > 0 {
            format!("{} ({}:{})", self.function, self.file, self.line)
        } else {
            self.function.clone()
        }
    }
}

pub trait Symbolicate {
    /// Resolve a load-relative offset within the object at `path` to a
    /// source location, best-effort.
    fn resolve(&self, path: &Path, offset: u64) -> Location;
}

struct ModuleInfo {
    symbols: Vec<(u64, String)>,
    line_rows: Vec<(u64, String, u32)>,
}

/// Default DWARF-backed symbolicator, caching one parsed module per
/// backing file for the lifetime of the process.
pub struct DwarfSymbolicator {
    cache: Mutex<HashMap<PathBuf, Option<ModuleInfo>>>,
}

impl DwarfSymbolicator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load(path: &Path) -> Option<ModuleInfo> {
        let data = std::fs::read(path).ok()?;
        let obj = object::File::parse(&*data).ok()?;

        let mut symbols: Vec<(u64, String)> = obj
            .symbols()
            .filter(|s| s.is_definition())
            .map(|s| (s.address(), rustc_demangle::demangle(s.name().unwrap_or("")).to_string()))
            .collect();
        symbols.sort_by_key(|(addr, _)| *addr);

        let line_rows = parse_line_rows(&obj, &data).unwrap_or_default();

        Some(ModuleInfo { symbols, line_rows })
    }
}

impl Default for DwarfSymbolicator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line_rows(obj: &object::File, data: &[u8]) -> gimli::Result<Vec<(u64, String, u32)>> {
    let endian = if obj.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<std::borrow::Cow<[u8]>, gimli::Error> {
        use object::ObjectSection;
        Ok(obj
            .section_by_name(id.name())
            .and_then(|s| s.data().ok())
            .map(std::borrow::Cow::Borrowed)
            .unwrap_or(std::borrow::Cow::Borrowed(&[])))
    };
    let _ = data;

    let dwarf = gimli::Dwarf::load(load_section)?;
    let dwarf = dwarf.borrow(|section| gimli::EndianSlice::new(section, endian));

    let mut rows = Vec::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let comp_dir = unit.comp_dir.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let mut rows_iter = program.rows();
        while let Some((header, row)) = rows_iter.next_row()? {
            let Some(addr) = Some(row.address()) else { continue };
            let file = row
                .file(header)
                .and_then(|f| {
                    let name = dwarf.attr_string(&unit, f.path_name()).ok()?.to_string_lossy().into_owned();
                    Some(if name.starts_with('/') {
                        name
                    } else {
                        format!("{comp_dir}/{name}")
                    })
                })
                .unwrap_or_else(|| "??".to_string());
            let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
            rows.push((addr, file, line));
        }
    }
    rows.sort_by_key(|(addr, _, _)| *addr);
    Ok(rows)
}

impl Symbolicate for DwarfSymbolicator {
    fn resolve(&self, path: &Path, offset: u64) -> Location {
        let mut cache = self.cache.lock().expect("symbolicator cache lock poisoned");
        let module = cache.entry(path.to_path_buf()).or_insert_with(|| Self::load(path));
        let Some(module) = module else {
            return Location::unknown();
        };

        let function = match module.symbols.binary_search_by_key(&offset, |(addr, _)| *addr) {
            Ok(idx) => module.symbols[idx].1.clone(),
            Err(idx) if idx > 0 => module.symbols[idx - 1].1.clone(),
            _ => "??".to_string(),
        };

        let (file, line) = match module.line_rows.binary_search_by_key(&offset, |(addr, _, _)| *addr) {
            Ok(idx) => (module.line_rows[idx].1.clone(), module.line_rows[idx].2),
            Err(idx) if idx > 0 => (module.line_rows[idx - 1].1.clone(), module.line_rows[idx - 1].2),
            _ => ("??".to_string(), 0),
        };

        Location { file, line, function }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_location_has_placeholder_fields() {
        let loc = Location::unknown();
        assert_eq!(loc.display(), "??");
    }

    #[test]
    fn missing_file_resolves_to_unknown() {
        let sym = DwarfSymbolicator::new();
        let loc = sym.resolve(Path::new("/nonexistent/path/to/nothing"), 0x1000);
        assert_eq!(loc.function, "??");
    }
}

use super::resolver::AddressResolver;
use crate::domain::ResolutionError;
use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

const UNKNOWN_FUNCTION: &str = "<unknown>";

/// In-process DWARF symbolizer for one unstripped library
///
/// Resolved addresses are cached; the same return address usually shows up
/// in thousands of stacks.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Load DWARF sections of the ELF file at `library_path`
    ///
    /// # Errors
    /// Returns `ResolutionError::DebugInfo` if the file cannot be read or
    /// parsed, or carries no usable DWARF
    pub fn new<P: AsRef<Path>>(library_path: P) -> Result<Self, ResolutionError> {
        let path = library_path.as_ref();
        let debug_info = |reason: String| ResolutionError::DebugInfo {
            path: path.display().to_string(),
            reason,
        };

        let binary_data = fs::read(path)?;
        let obj_file = object::File::parse(&*binary_data).map_err(|e| debug_info(e.to_string()))?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section).map_err(|e| debug_info(e.to_string()))?;
        let ctx = Context::from_dwarf(dwarf).map_err(|e| debug_info(e.to_string()))?;

        Ok(Self { ctx, cache: RefCell::new(HashMap::new()) })
    }

    /// Resolve a library-relative address, inlined frames included
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut result = Vec::new();
        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
                result.push(InlinedFrame { function });
            }
        }

        let resolved = ResolvedFrame { addr, frames: result };
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }
}

impl AddressResolver for Symbolizer {
    /// Names the address after its innermost known function, as `addr2line -f`
    /// does without `-i`
    fn resolve_batch(&mut self, addrs: &[u64]) -> Result<Vec<(u64, String)>, ResolutionError> {
        Ok(addrs
            .iter()
            .filter_map(|&addr| {
                let resolved = self.resolve(addr);
                resolved.function().map(|name| (addr, name.to_owned()))
            })
            .collect())
    }
}

/// A resolved address (may contain multiple inlined frames, innermost first)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
}

impl ResolvedFrame {
    /// Innermost known function name
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.frames
            .iter()
            .map(|frame| frame.function.as_str())
            .find(|name| *name != UNKNOWN_FUNCTION && !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str) -> InlinedFrame {
        InlinedFrame { function: function.to_string() }
    }

    #[test]
    fn test_function_skips_unknown() {
        let resolved = ResolvedFrame {
            addr: 0x10,
            frames: vec![frame(UNKNOWN_FUNCTION), frame("Game::Tick()")],
        };
        assert_eq!(resolved.function(), Some("Game::Tick()"));

        let empty = ResolvedFrame { addr: 0x10, frames: Vec::new() };
        assert_eq!(empty.function(), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = Symbolizer::new("/nonexistent/libmissing.so");
        assert!(matches!(result, Err(ResolutionError::Io(_))));
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not an elf file").unwrap();
        let result = Symbolizer::new(file.path());
        assert!(matches!(result, Err(ResolutionError::DebugInfo { .. })));
    }
}

//! # Symbol Resolution
//!
//! Turns raw return addresses captured on the device into function names.
//!
//! ## Flow
//!
//! ```text
//! 1. Capture stores raw frames:      [0x7000001234, 0x7000002a10, ...]  (library "unknown")
//!
//! 2. smaps dump locates each frame:   /system/lib64/libgame.so  0x7000000000-0x7000005000
//!    library-relative address:        0x7000001234 - load bias = 0x1234
//!
//! 3. Every (library, addr) gets a pending slot in the SymbolTable
//!
//! 4. A resolver fills pending slots, in chunks, on a worker pool:
//!      - addr2line tool   (external process, unstripped .so on the host)
//!      - Symbolizer       (in-process DWARF via addr2line/gimli)
//!      - SymbolMap        (nm -nCS output or ELF symtab, binary search)
//!
//! 5. Unresolved slots render as "libgame.so!0x1234"
//! ```
//!
//! ## Load Bias
//!
//! Android loads every `.so` at a randomized base. The offset-0 segment of a
//! module gives the base; when the first mapped segment has a non-zero file
//! offset the base is `start - offset`.
//!
//! ## Module Structure
//!
//! - **`symbol_table`**: per-library `addr → name` slots with a pending state
//! - **`smaps`**: smaps parsing and library attribution of call stacks
//! - **`resolver`**: [`AddressResolver`] trait, chunked worker pool, addr2line tool
//! - **`symbolizer`**: in-process DWARF resolver
//! - **`symbol_map`**: sorted symbol ranges from `nm` or ELF symbol tables

pub mod resolver;
pub mod smaps;
pub mod symbol_map;
pub mod symbol_table;
pub mod symbolizer;

pub use resolver::{locate_library, resolve_pending, Addr2LineTool, AddressResolver, ResolveSummary};
pub use smaps::{attribute_libraries, parse_smaps, AttributionSummary, SmapsSection, SmapsSections};
pub use symbol_map::{SymbolMap, SymbolRange};
pub use symbol_table::{SymbolLookup, SymbolTable};
pub use symbolizer::Symbolizer;

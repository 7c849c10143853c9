//! CLI argument definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "loli",
    version,
    about = "Capture, symbolize and compare native memory profiles",
    after_help = "\
EXAMPLES:
    loli capture -o before.loli --duration 30         Record 30s from the forwarded device port
    loli symbolize before.loli --symbols-dir ./syms   Resolve addresses against unstripped libraries
    loli diff before.loli after.loli                  Print what grew between two captures
    loli diff before.loli after.loli -o growth.loli   Save the delta tree as a snapshot
    loli info growth.loli --depth 2                   Summarize a snapshot"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record allocations from a device agent into a .loli file
    Capture(CaptureArgs),
    /// Resolve pending symbols of a .loli file
    Symbolize(SymbolizeArgs),
    /// Compare two .loli files
    Diff(DiffArgs),
    /// Print counts and the top of the call tree of a .loli file
    Info(InfoArgs),
}

#[derive(clap::Args)]
pub struct CaptureArgs {
    /// Output snapshot
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Host of the forwarded agent port
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Forwarded agent port
    #[arg(short, long, default_value_t = loli_common::DEFAULT_PORT)]
    pub port: u16,

    /// Request the smaps dump after N seconds (0 = wait for Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// smaps text of the profiled process, used to attribute stack frames
    #[arg(long, value_name = "FILE")]
    pub smaps: Option<PathBuf>,

    /// Connection attempts before giving up
    #[arg(long, default_value = "5")]
    pub retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SymbolSource {
    /// Read ELF symbol tables in-process
    Elf,
    /// Run `nm -nCS` and search its ranges
    Nm,
    /// Batch addresses through an external addr2line
    Addr2line,
    /// Resolve through DWARF debug info in-process
    Dwarf,
}

#[derive(clap::Args)]
pub struct SymbolizeArgs {
    /// Snapshot to symbolize
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Directory holding unstripped copies of the device libraries
    #[arg(short, long, value_name = "DIR")]
    pub symbols_dir: PathBuf,

    /// Where names come from
    #[arg(short, long, value_enum, default_value = "elf")]
    pub method: SymbolSource,

    /// Write here instead of overwriting the input
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// addr2line executable (e.g. the NDK's llvm-addr2line)
    #[arg(long, default_value = "addr2line")]
    pub addr2line: PathBuf,

    /// nm executable
    #[arg(long, default_value = "nm")]
    pub nm: PathBuf,

    /// Resolver threads (default: available parallelism, at least 2)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(clap::Args)]
pub struct DiffArgs {
    /// Earlier capture
    #[arg(value_name = "BASELINE")]
    pub baseline: PathBuf,

    /// Later capture
    #[arg(value_name = "COMPARISON")]
    pub comparison: PathBuf,

    /// Write the report here; a .loli extension saves the delta tree as a snapshot
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Ignore the N outermost frames of every stack
    #[arg(long, default_value = "0")]
    pub skip_root_levels: usize,

    /// Only count allocations still live at the end of each capture
    #[arg(long)]
    pub live_only: bool,

    /// Print a JSON summary instead of the text report
    #[arg(long)]
    pub json: bool,

    /// Growth sites listed in the JSON summary
    #[arg(long, default_value = "20")]
    pub top: usize,
}

#[derive(clap::Args)]
pub struct InfoArgs {
    /// Snapshot to inspect
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Call-tree levels to print
    #[arg(short, long, default_value = "1")]
    pub depth: usize,

    /// Only count live allocations
    #[arg(long)]
    pub live_only: bool,
}

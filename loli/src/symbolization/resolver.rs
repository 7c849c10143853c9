//! Batched address resolution on a worker pool
//!
//! ```text
//!  pending addrs ──► chunks of ≤ chunk_size ──► worker 0: resolver ─┐
//!                                           ──► worker 1: resolver ─┼─► channel ──► SymbolTable
//!                                           ──► worker N: resolver ─┘        (merge on caller)
//! ```
//!
//! Every worker builds its own resolver, so resolvers need not be `Send`.
//! A failing chunk is logged and leaves its addresses pending.

use super::SymbolTable;
use crate::config::ResolverConfig;
use crate::domain::ResolutionError;
use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Something that turns library-relative addresses into function names
pub trait AddressResolver {
    /// Resolve a batch. Addresses without a name are simply left out.
    ///
    /// # Errors
    /// Returns an error when the whole batch could not be processed
    fn resolve_batch(&mut self, addrs: &[u64]) -> Result<Vec<(u64, String)>, ResolutionError>;
}

/// Outcome of one [`resolve_pending`] run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveSummary {
    pub requested: usize,
    pub resolved: usize,
    pub failed_chunks: usize,
}

enum WorkerMessage {
    Resolved(Vec<(u64, String)>),
    Failed(ResolutionError),
}

/// Resolve every pending slot of `library` and write the names back.
///
/// `make_resolver` runs once per worker thread.
pub fn resolve_pending<F, R>(
    table: &mut SymbolTable,
    library: &str,
    config: &ResolverConfig,
    make_resolver: F,
) -> ResolveSummary
where
    F: Fn() -> Result<R, ResolutionError> + Sync,
    R: AddressResolver,
{
    let pending = table.unresolved(library);
    let mut summary = ResolveSummary { requested: pending.len(), ..ResolveSummary::default() };
    if pending.is_empty() {
        return summary;
    }

    let chunks: Vec<&[u64]> = pending.chunks(config.chunk_size.max(1)).collect();
    let workers = config.workers.max(1).min(chunks.len());
    info!(
        "Resolving {} addresses of {} in {} chunks on {} workers",
        pending.len(),
        library,
        chunks.len(),
        workers
    );

    let (tx, rx) = unbounded();
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let chunks = &chunks;
            let make_resolver = &make_resolver;
            scope.spawn(move || {
                let mut resolver = match make_resolver() {
                    Ok(resolver) => resolver,
                    Err(err) => {
                        let _ = tx.send(WorkerMessage::Failed(err));
                        return;
                    }
                };
                for chunk in chunks.iter().skip(worker).step_by(workers) {
                    let message = match resolver.resolve_batch(chunk) {
                        Ok(names) => WorkerMessage::Resolved(names),
                        Err(err) => WorkerMessage::Failed(err),
                    };
                    if tx.send(message).is_err() {
                        return;
                    }
                }
            });
        }
    });
    drop(tx);

    for message in rx {
        match message {
            WorkerMessage::Resolved(names) => {
                for (addr, name) in names {
                    if table.fill(library, addr, &name) {
                        summary.resolved += 1;
                    }
                }
            }
            WorkerMessage::Failed(err) => {
                warn!("Symbol resolution for {library} failed: {err}");
                summary.failed_chunks += 1;
            }
        }
    }

    debug!("{library}: {}/{} resolved", summary.resolved, summary.requested);
    summary
}

/// External `addr2line`-compatible tool (`addr2line -f -C -e <file> <addrs>`)
#[derive(Debug, Clone)]
pub struct Addr2LineTool {
    pub program: PathBuf,
    pub library_file: PathBuf,
}

impl Addr2LineTool {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, library_file: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), library_file: library_file.into() }
    }
}

impl AddressResolver for Addr2LineTool {
    fn resolve_batch(&mut self, addrs: &[u64]) -> Result<Vec<(u64, String)>, ResolutionError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .arg("-f")
            .arg("-C")
            .arg("-e")
            .arg(&self.library_file)
            .args(addrs.iter().map(|addr| format!("0x{addr:x}")))
            .output()
            .map_err(|error| ResolutionError::SpawnFailed { program: program.clone(), error })?;

        if !output.status.success() {
            return Err(ResolutionError::ExitFailure { program, status: output.status });
        }
        Ok(parse_addr2line_output(addrs, &String::from_utf8_lossy(&output.stdout)))
    }
}

/// Pair `addr2line -f` output with its inputs.
///
/// The tool prints two lines per address, function then `file:line`;
/// `??` or empty function lines mean "not found".
#[must_use]
pub fn parse_addr2line_output(addrs: &[u64], stdout: &str) -> Vec<(u64, String)> {
    stdout
        .lines()
        .step_by(2)
        .zip(addrs)
        .filter_map(|(line, &addr)| {
            let name = line.trim();
            if name.is_empty() || name.starts_with('?') {
                None
            } else {
                Some((addr, name.to_owned()))
            }
        })
        .collect()
}

/// Host copy of a device library: `dir/<file name of library>`
#[must_use]
pub fn locate_library(dir: &Path, library: &str) -> Option<PathBuf> {
    let file_name = Path::new(library).file_name()?;
    let candidate = dir.join(file_name);
    candidate.is_file().then_some(candidate)
}

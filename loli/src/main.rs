//! # loli - Main Entry Point
//!
//! Four subcommands:
//! - **capture**: connect to the forwarded agent port and record a `.loli` file
//! - **symbolize**: fill pending symbols from host copies of the libraries
//! - **diff**: compare two captures as a text report, JSON, or a `.loli` delta
//! - **info**: counts and the top of the call tree of one capture

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use log::{info, warn};
use loli::analysis::{compare, to_snapshot, CallTree, DiffResult, TreeOptions};
use loli::capture::{CaptureSession, SessionControl, SessionEvent, StopReason};
use loli::cli::{Args, CaptureArgs, Command, DiffArgs, InfoArgs, SymbolSource, SymbolizeArgs};
use loli::config::{CaptureConfig, ResolverConfig};
use loli::domain::ResolutionError;
use loli::export::{self, DiffSummary, TreeListing};
use loli::symbolization::{
    locate_library, resolve_pending, smaps, Addr2LineTool, SymbolMap, Symbolizer,
};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Invalid combination of otherwise well-formed arguments
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<UsageError>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    match args.command {
        Command::Capture(capture_args) => capture(&capture_args, quiet).await,
        Command::Symbolize(symbolize_args) => symbolize(&symbolize_args, quiet),
        Command::Diff(diff_args) => diff(&diff_args, quiet),
        Command::Info(info_args) => show_info(&info_args),
    }
}

async fn capture(args: &CaptureArgs, quiet: bool) -> Result<()> {
    let config = CaptureConfig {
        host: args.host.clone(),
        port: args.port,
        connect_attempts: args.retries,
        ..CaptureConfig::default()
    };
    let (event_tx, event_rx) = bounded(config.event_capacity);
    let mut session = CaptureSession::new(config.clone()).with_events(event_tx);

    let stream = session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.address()))?;

    if !quiet {
        println!("loli v{}", env!("CARGO_PKG_VERSION"));
        println!("agent: {}", config.address());
        println!("output: {}", args.output.display());
    }

    // Progress printer, fed until the session (the only sender) is dropped
    let progress = (!quiet).then(|| std::thread::spawn(move || print_progress(&event_rx)));

    // First Ctrl+C (or the duration limit) asks for the smaps dump, a second one stops
    let (control_tx, control_rx) = mpsc::channel(4);
    let duration_limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let controller = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let limit = async {
            match duration_limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = limit => {}
            _ = &mut ctrl_c => {}
        }
        if control_tx.send(SessionControl::RequestSmapsDump).await.is_err() {
            return;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(SessionControl::Stop).await;
        }
    });

    let started = Instant::now();
    let reason = session.run(stream, control_rx).await.context("Capture failed")?;
    controller.abort();

    let stats = session.stats();
    let mut snapshot = session.into_snapshot();
    if let Some(handle) = progress {
        handle.join().ok();
    }

    if reason != StopReason::SmapsDumped {
        warn!("Capture ended without the smaps acknowledgement ({reason:?})");
    }

    if let Some(ref smaps_path) = args.smaps {
        let text = std::fs::read_to_string(smaps_path)
            .with_context(|| format!("Failed to read {}", smaps_path.display()))?;
        let summary = snapshot.apply_smaps(&text, None);
        info!(
            "Attributed {} frames of {} records ({} unknown)",
            summary.frames, summary.records, summary.unknown_frames
        );
    }

    export::save(&snapshot, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    if !quiet {
        eprintln!(
            "\n{:?}: {:.1}s, {} packets, {} batches ({} dropped), {} allocs, {} frees",
            reason,
            started.elapsed().as_secs_f64(),
            stats.packets,
            stats.batches,
            stats.dropped_batches,
            stats.allocs,
            stats.frees,
        );
        println!("saved: {}", args.output.display());
    }
    Ok(())
}

fn print_progress(events: &Receiver<SessionEvent>) {
    let mut allocs = 0usize;
    let mut last_print = Instant::now();
    for event in events {
        match event {
            SessionEvent::Connected { address } => eprintln!("connected: {address}"),
            SessionEvent::BatchDecoded { allocs: n, .. } => {
                allocs += n;
                if last_print.elapsed() > Duration::from_secs(1) {
                    eprint!("\rrecords: {allocs}");
                    last_print = Instant::now();
                }
            }
            SessionEvent::BatchDropped { reason } => eprintln!("\ndropped batch: {reason}"),
            SessionEvent::SmapsDumped => eprintln!("\nsmaps dumped by device"),
            SessionEvent::ConnectionLost { reason } => eprintln!("\nconnection lost: {reason}"),
        }
    }
}

fn symbolize(args: &SymbolizeArgs, quiet: bool) -> Result<()> {
    if !args.symbols_dir.is_dir() {
        return Err(UsageError(format!(
            "--symbols-dir {} is not a directory",
            args.symbols_dir.display()
        ))
        .into());
    }

    let mut snapshot = export::load(&args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    let mut config = ResolverConfig {
        addr2line: args.addr2line.clone(),
        nm: args.nm.clone(),
        ..ResolverConfig::default()
    };
    if let Some(jobs) = args.jobs {
        config.workers = jobs.max(1);
    }

    let libraries: Vec<String> =
        snapshot.symbols.libraries().into_iter().map(str::to_owned).collect();
    let mut total = 0;
    for library in &libraries {
        let pending = snapshot.symbols.unresolved(library).len();
        if pending == 0 {
            continue;
        }
        let Some(file) = locate_library(&args.symbols_dir, library) else {
            warn!("No host copy of {library} in {}", args.symbols_dir.display());
            continue;
        };

        let table = &mut snapshot.symbols;
        let resolved: Result<usize, ResolutionError> = match args.method {
            SymbolSource::Elf => SymbolMap::from_elf(&file).map(|map| map.resolve_into(table, library)),
            SymbolSource::Nm => {
                SymbolMap::from_nm_tool(&config.nm, &file).map(|map| map.resolve_into(table, library))
            }
            SymbolSource::Addr2line => Ok(resolve_pending(table, library, &config, || {
                Ok(Addr2LineTool::new(config.addr2line.clone(), file.clone()))
            })
            .resolved),
            SymbolSource::Dwarf => {
                Ok(resolve_pending(table, library, &config, || Symbolizer::new(&file)).resolved)
            }
        };

        match resolved {
            Ok(count) => {
                total += count;
                if !quiet {
                    println!("{library}: {count}/{pending} resolved");
                }
            }
            Err(e) => warn!("Skipping {library}: {e}"),
        }
    }

    let output = args.output.as_deref().unwrap_or(&args.input);
    export::save(&snapshot, output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    if !quiet {
        println!("saved: {} ({total} symbols resolved)", output.display());
    }
    Ok(())
}

fn diff(args: &DiffArgs, quiet: bool) -> Result<()> {
    let baseline = export::load(&args.baseline)
        .with_context(|| format!("Failed to load baseline {}", args.baseline.display()))?;
    let comparison = export::load(&args.comparison)
        .with_context(|| format!("Failed to load comparison {}", args.comparison.display()))?;

    let options = TreeOptions { skip_root_levels: args.skip_root_levels, live_only: args.live_only };
    let DiffResult { tree, stats } = compare(&baseline, &comparison, options);

    if args.json {
        let mut stdout = io::stdout().lock();
        DiffSummary::new(stats, &tree, args.top).write(&mut stdout)?;
        writeln!(stdout)?;
    }

    match &args.output {
        Some(path) if is_loli(path) => {
            export::save(&to_snapshot(&tree), path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Some(path) => export::save_report(path, &stats, &tree)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None if !args.json => export::write_report(&mut io::stdout().lock(), &stats, &tree)?,
        None => {}
    }

    if !quiet {
        if let Some(ref path) = args.output {
            eprintln!("saved: {}", path.display());
        }
    }
    Ok(())
}

fn is_loli(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("loli"))
}

fn show_info(args: &InfoArgs) -> Result<()> {
    let snapshot = export::load(&args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    let store = &snapshot.records;

    println!("file: {}", args.input.display());
    println!("records: {} ({} live)", store.len(), store.live_records().count());
    println!("live size: {}", export::size_to_string(store.live_size().unsigned_abs()));
    println!("call stacks: {}", store.call_stacks().len());
    println!("freed addresses: {}", store.free_index().len());
    println!(
        "symbols: {}/{} resolved in {} libraries",
        snapshot.symbols.resolved_count(),
        snapshot.symbols.len(),
        snapshot.symbols.library_count()
    );
    let mapped = smaps::total(&snapshot.smaps);
    println!(
        "smaps: {} sections, {} KB rss, {} KB pss",
        snapshot.smaps.len(),
        mapped.rss,
        mapped.pss
    );
    println!("screenshots: {}", snapshot.screenshots.len());
    println!("peak memory: {} KB", snapshot.meminfo_max());
    println!();

    let tree = CallTree::build(&snapshot, TreeOptions { skip_root_levels: 0, live_only: args.live_only });
    let listing = TreeListing { max_depth: Some(args.depth.saturating_sub(1)), signed: false };
    export::write_tree(&mut io::stdout().lock(), &tree, listing)?;
    Ok(())
}

//! # loli - Native Memory Profiler Host
//!
//! loli receives allocation records streamed by an agent injected into an
//! Android process, stores them as `.loli` snapshots, resolves their call
//! stacks to function names, and shows what grew between two captures.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Profiled process (device)                      │
//! │        malloc/calloc/memalign/realloc/free hooks                │
//! │        agent send loop: buffer → LZ4 batch every 66 ms          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ TCP (port forwarded to the host)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        loli (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Capture    │──▶│   Snapshot   │──▶│    Export    │         │
//! │  │ frame/batch  │   │ records/free │   │ .loli codec  │         │
//! │  └──────────────┘   └──────┬───────┘   └──────▲───────┘         │
//! │                            │                  │                 │
//! │                            ▼                  │                 │
//! │                     ┌──────────────┐   ┌──────┴───────┐         │
//! │                     │Symbolization │──▶│   Analysis   │         │
//! │                     │ smaps + syms │   │ tree + diff  │         │
//! │                     └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`capture`]: wire protocol and the host capture session
//!   - `frame`: length-prefixed packet reassembly over a byte stream
//!   - `batch`: packet type dispatch, LZ4 decompression, record lines
//!   - `store`: append-only records plus the free index
//!   - `session`: tokio TCP session with smaps-dump command handling
//!   - `agent`: model of the device send loop, used as a loopback device
//!
//! - [`symbolization`]: raw return addresses → library-relative → names
//!   - smaps parsing and per-frame library attribution
//!   - addr2line tool, in-process DWARF, and nm/ELF symbol maps
//!
//! - [`analysis`]: suffix-keyed call trees and baseline/comparison diffs
//!
//! - [`export`]: `.loli` files, text reports, JSON summaries
//!
//! ### Support Modules
//!
//! - [`snapshot`]: `ProfileSnapshot`, the unit of persistence
//! - [`interner`]: per-snapshot string interning
//! - [`config`]: typed defaults for capture, agent, and resolver
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: newtypes (`RecordId`, `Seq`, `StringHash`) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! adb forward tcp:7100 tcp:7100
//! loli capture -o before.loli --duration 60 --smaps before.smaps
//! loli capture -o after.loli --duration 60 --smaps after.smaps
//! loli symbolize before.loli -s ./symbols
//! loli symbolize after.loli -s ./symbols
//! loli diff before.loli after.loli --live-only
//! ```
//!
//! ## Key Concepts
//!
//! - **Free index**: frees never delete records; liveness is checked at query time
//! - **Suffix hash**: call-tree nodes are keyed by the names from a frame to the root
//! - **Noise floor**: leaf growth under 1 KiB is ignored by the diff
//! - **Load bias**: base address a `.so` was mapped at on the device

pub mod analysis;
pub mod capture;
pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod interner;
pub mod snapshot;
pub mod symbolization;

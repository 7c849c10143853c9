//! Command-line interface definitions

pub mod args;

pub use args::{Args, CaptureArgs, Command, DiffArgs, InfoArgs, SymbolizeArgs, SymbolSource};

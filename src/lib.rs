//! Library to back up MySQL databases with size-aware dumps.
//!
//! The dump strategy is chosen by [strategy::classify] from the row counts of
//! the tables: small databases end up in a single file, large ones are dumped
//! in batches. Dumps are filed into daily, weekly and monthly tiers which are
//! rotated by [util::retention]. A complete run is performed by
//! [run::Orchestrator].

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod mysql;
pub mod run;
pub mod strategy;
pub mod util;

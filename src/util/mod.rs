//! Helpers shared by the backup run.

pub mod retention;

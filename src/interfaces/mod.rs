//! Edges of the crate: provider webhook adapters and the CLI's file formats.

pub mod csv;
pub mod journal;
pub mod providers;

//! The per-pair reconciliation engine and its supporting pieces.

pub mod engine;
pub mod grouping;
pub mod hrefs;
pub mod report;
pub mod resolver;

#[cfg(test)]
mod tests;

pub use engine::{EngineOptions, SyncEngine};
pub use report::SyncReport;

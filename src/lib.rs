//! Network reconnaissance engine: probes targets, captures and fingerprints
//! service banners, matches them against a signature corpus, and batches the
//! resulting records into an analytical store.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod fingerprint;
pub mod matcher;
pub mod records;
pub mod scheduler;
pub mod sink;
pub mod targets;
pub mod worker;
pub mod writer;

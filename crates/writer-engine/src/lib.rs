#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The podping writer engine: ingest IRIs over a request-reply TCP endpoint,
//! coalesce them into deduplicated batches, and publish each batch as a
//! `custom_json` operation on the Hive blockchain with bounded retry and
//! node rotation.

/// Public API for the writer engine.
pub mod api;

mod coalescer;
mod engine;
mod hive;
mod ingress;
mod publisher;
mod sign;
mod startup;
mod status;
mod submitter;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{
    start_writer, CountersSnapshot, WriterConfig, WriterError, WriterHandle, WriterStopper,
};

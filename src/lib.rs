//! Photo library task pipeline.
//!
//! Every image under the library root gets a thumbnail, an EXIF record and a
//! face-detection pass, each driven through a persisted per-task status by a
//! bounded job queue and a fixed pool of workers. Detected faces carry
//! embeddings used to find similar faces and to propagate person tags.
//! Albums can be packed into zip archives through the same queue.

pub mod adapters;
pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod logging;
pub mod scanner;
pub mod tasks;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use error::{Error, Result};

//! Per-fuzzer coverage-observation driver library.
//!
//! Wraps an opaque fuzzer subprocess with a BTS-based coverage observer:
//! every new corpus input is re-run under hardware branch tracing, reduced
//! to basic-block edges, absorbed into a knowledge base, and shared with
//! sibling drivers over a small messaging protocol (or logged to disk in
//! single mode).

pub mod basic_blocks;
pub mod cli;
pub mod corpus_watcher;
pub mod driver;
pub mod error;
pub mod knowledge_base;
pub mod messaging;
pub mod perf;
pub mod reducer;
pub mod sections;

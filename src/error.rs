//! The error taxonomy of the driver: startup failures that abort before the
//! loop starts, and runtime failures that kill the fuzzer and abort the loop.
//!
//! Transient conditions (would-block, EINTR) and peer-protocol errors are
//! deliberately *not* part of this enum: per the propagation policy, the
//! former are swallowed at the call site and the latter are logged and
//! skipped. Making either one an `Err` variant here would make it too easy
//! to accidentally bubble them up and abort the loop.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that prevent the driver from ever entering its main loop.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open fuzzer command file {path}: {source}")]
    FuzzerCmdFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fuzzer command file {path} has fewer than 2 lines (need executable + argument)")]
    FuzzerCmdTooShort { path: PathBuf },

    #[error("failed to parse ports '{raw}', expected 'i,u,m'")]
    PortsMalformed { raw: String },

    #[error("-j/--inject-dir is required in multi mode")]
    MissingInjectDir,

    #[error("failed to bind or connect messaging socket {endpoint}: {source}")]
    Messaging {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    #[error("failed to initialize BTS performance event type: {0}")]
    BtsUnsupported(#[from] crate::perf::TraceError),

    #[error("failed to resolve ELF section bounds for {path}: {source}")]
    Sections {
        path: PathBuf,
        #[source]
        source: crate::sections::SectionError,
    },

    #[error("failed to load basic blocks from {script} for {binary}: {source}")]
    BasicBlocks {
        script: PathBuf,
        binary: PathBuf,
        #[source]
        source: crate::basic_blocks::BasicBlockError,
    },

    #[error("failed to set up corpus watcher on {path}: {source}")]
    CorpusWatch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fork fuzzer subprocess: {0}")]
    ForkFuzzer(nix::errno::Errno),
}

/// Errors that occur once the loop is running; all of them kill the fuzzer
/// subprocess and abort with a non-zero exit code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("corpus watcher failed: {0}")]
    CorpusWatch(#[from] crate::corpus_watcher::WatchError),

    #[error("SUT trace failed: {0}")]
    Trace(#[from] crate::perf::TraceError),

    #[error("failed to write {path}: {source}")]
    DataWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send on messaging bus: {0}")]
    Send(#[from] zmq::Error),
}

/// Top-level error returned from `main`.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

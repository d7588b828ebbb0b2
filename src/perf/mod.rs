//! Hardware Branch Trace Store (BTS) capture (spec §4.D).
//!
//! Launches the system-under-test under `ptrace`, opens a BTS performance
//! counter on the child, maps its data+aux ring buffers, and hands back the
//! raw branch array captured during the child's execution on one input.
//! x86 / x86_64 only — the reference tracer is a hardware-specific feature
//! and refuses to initialize anywhere else.

mod ring;
mod tracer;

pub use tracer::{init_bts_type, redirect_or_devnull, trace, InputSink, TraceError};

/// One taken branch, as deposited by the hardware into the aux ring.
/// `misc` carries kernel-defined flags this driver never interprets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBranch {
    pub from: u64,
    pub to: u64,
    pub misc: u64,
}

/// True on the only architectures BTS exists on.
pub const ARCH_SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "x86"));

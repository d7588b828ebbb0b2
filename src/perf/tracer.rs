//! ptrace + BTS performance-counter session (spec §4.D).
//!
//! The child is stop-initial (`PTRACE_TRACEME` then `raise(SIGTRAP)`); the
//! parent attaches a BTS counter to it, maps its ring buffers, and drives
//! the child to completion with `waitpid`/`PTRACE_CONT`, sampling the aux
//! ring on every SIGIO-driven stop. Only one session can be active at a
//! time (spec §5): the BTS counter and its ring mapping are tied to a
//! single child pid.

use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};
use perf_event_open_sys::bindings::perf_event_attr;
use thiserror::Error;

use super::ring::RingMapping;
use super::RawBranch;

const BTS_TYPE_PATH: &str = "/sys/bus/event_source/devices/intel_bts/type";

/// `_IO('$', 0)`, i.e. `PERF_EVENT_IOC_ENABLE` from `linux/perf_event.h`.
/// Hardcoded because the ioctl request-number macros are preprocessor
/// arithmetic that bindgen does not surface as a constant.
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;

static CHILD_PID: AtomicI32 = AtomicI32::new(-1);
static DATA_READY: AtomicUsize = AtomicUsize::new(0);
static BTS_TYPE: OnceLock<u32> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("BTS is not supported on this kernel/CPU: {0}")]
    Unsupported(io::Error),
    #[error("failed to write scratch input file {0}: {1}")]
    ScratchWrite(std::path::PathBuf, io::Error),
    #[error("failed to fork: {0}")]
    Fork(nix::errno::Errno),
    #[error("failed to open BTS performance counter: {0}")]
    PerfEventOpen(io::Error),
    #[error("failed to map BTS ring buffers: {0}")]
    Mmap(io::Error),
    #[error("failed to install SIGIO handler: {0}")]
    SigAction(nix::errno::Errno),
    #[error("waitpid failed: {0}")]
    Wait(nix::errno::Errno),
    #[error("failed to continue traced child: {0}")]
    Cont(nix::errno::Errno),
}

/// Where the persisted input lives from the SUT's point of view.
pub enum InputSink<'a> {
    /// The scratch file is `dup2`'d onto the child's stdin.
    Stdin,
    /// The SUT reads the named file itself (already substituted into argv
    /// by the caller); the driver only needs to write it.
    File(&'a Path),
}

/// Reads and caches the kernel's BTS performance-event type id. Must
/// succeed once before any call to [`trace`].
pub fn init_bts_type() -> Result<(), TraceError> {
    if BTS_TYPE.get().is_some() {
        return Ok(());
    }
    if !super::ARCH_SUPPORTED {
        return Err(TraceError::Unsupported(io::Error::new(
            io::ErrorKind::Unsupported,
            "BTS tracing requires x86_64 or x86",
        )));
    }

    let contents = fs::read_to_string(BTS_TYPE_PATH).map_err(TraceError::Unsupported)?;
    let ty: u32 = contents
        .trim()
        .parse()
        .map_err(|_| TraceError::Unsupported(io::Error::new(io::ErrorKind::InvalidData, contents)))?;
    let _ = BTS_TYPE.set(ty);
    Ok(())
}

/// Traces one execution of `sut_argv` on `input_bytes`, returning the
/// branches recorded by BTS. `scratch_path` is overwritten with
/// `input_bytes` on every call; it is exclusively owned by this driver.
pub fn trace(
    scratch_path: &Path,
    input_bytes: &[u8],
    sut_argv: &[String],
    sink: InputSink,
    log_out: Option<&Path>,
    log_err: Option<&Path>,
) -> Result<Vec<RawBranch>, TraceError> {
    let bts_type = *BTS_TYPE
        .get()
        .expect("init_bts_type must be called before trace");

    write_scratch(scratch_path, input_bytes)?;

    // SAFETY: fork() followed immediately by either a parent-only or
    // child-only path, with the child never returning across the `match`.
    match unsafe { fork() }.map_err(TraceError::Fork)? {
        ForkResult::Child => {
            // Never returns: either execs the SUT or _exit(127)s on failure.
            run_child(scratch_path, sut_argv, &sink, log_out, log_err);
        }
        ForkResult::Parent { child } => run_parent(child, bts_type),
    }
}

fn write_scratch(path: &Path, input_bytes: &[u8]) -> Result<(), TraceError> {
    let mut f = fs::File::create(path)
        .map_err(|e| TraceError::ScratchWrite(path.to_path_buf(), e))?;
    f.write_all(input_bytes)
        .map_err(|e| TraceError::ScratchWrite(path.to_path_buf(), e))?;
    Ok(())
}

/// Runs in the forked child: redirects stdio, arranges stdin if needed,
/// requests tracing, stops itself for the parent to attach, then execs.
/// Does not return.
fn run_child(
    scratch_path: &Path,
    sut_argv: &[String],
    sink: &InputSink,
    log_out: Option<&Path>,
    log_err: Option<&Path>,
) -> ! {
    redirect_or_devnull(libc::STDOUT_FILENO, log_out);
    redirect_or_devnull(libc::STDERR_FILENO, log_err);

    if matches!(sink, InputSink::Stdin) {
        match fs::File::open(scratch_path) {
            Ok(f) => {
                let fd = f.as_raw_fd();
                if dup2(fd, libc::STDIN_FILENO).is_err() {
                    unsafe { libc::_exit(127) };
                }
                drop(f);
            }
            Err(_) => unsafe { libc::_exit(127) },
        }
    }

    if nix::sys::ptrace::traceme().is_err() {
        unsafe { libc::_exit(127) };
    }
    let _ = signal::raise(Signal::SIGTRAP);

    let Ok(argv) = sut_argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
    else {
        unsafe { libc::_exit(127) };
    };
    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(CString::as_c_str).collect();

    let _ = nix::unistd::execv(argv[0].as_c_str(), &argv_refs);
    // execv only returns on failure.
    unsafe { libc::_exit(127) };
}

/// Redirects `target_fd` to `log_path`, or `/dev/null` if absent. Shared
/// with the driver's long-lived fuzzer spawn, which wants the same
/// stdout/stderr handling as the ephemeral SUT child.
pub(crate) fn redirect_or_devnull(target_fd: RawFd, log_path: Option<&Path>) {
    let opened = match log_path {
        Some(path) => fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
        None => fs::OpenOptions::new().write(true).open("/dev/null"),
    };
    if let Ok(f) = opened {
        let _ = dup2(f.as_raw_fd(), target_fd);
    }
}

extern "C" fn sigio_handler(signum: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // Async-signal-safe only: a single `kill` and an atomic increment.
    if signum == libc::SIGIO {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTRAP);
            }
        }
        DATA_READY.fetch_add(1, Ordering::SeqCst);
    }
}

fn run_parent(child: Pid, bts_type: u32) -> Result<Vec<RawBranch>, TraceError> {
    CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
    DATA_READY.store(0, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::SigAction(sigio_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // SAFETY: `sigio_handler` only calls `kill` and an atomic increment.
    let old_action = unsafe { signal::sigaction(Signal::SIGIO, &action) }.map_err(TraceError::SigAction)?;

    let result = run_parent_inner(child, bts_type);

    // SAFETY: restoring whatever was previously installed.
    let _ = unsafe { signal::sigaction(Signal::SIGIO, &old_action) };
    CHILD_PID.store(-1, Ordering::SeqCst);

    result
}

fn run_parent_inner(child: Pid, bts_type: u32) -> Result<Vec<RawBranch>, TraceError> {
    let mut attr: perf_event_attr = unsafe { std::mem::zeroed() };
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.type_ = bts_type;
    attr.set_exclude_kernel(1);
    attr.set_disabled(1);

    let perf_fd = unsafe {
        perf_event_open_sys::perf_event_open(&mut attr, child.as_raw(), -1, -1, 0)
    };
    if perf_fd < 0 {
        kill_child(child);
        return Err(TraceError::PerfEventOpen(io::Error::last_os_error()));
    }
    let perf_fd = perf_fd as RawFd;

    let ring = match unsafe { RingMapping::new(perf_fd) } {
        Ok(ring) => ring,
        Err(e) => {
            unsafe { libc::close(perf_fd) };
            kill_child(child);
            return Err(TraceError::Mmap(e));
        }
    };

    unsafe {
        libc::fcntl(
            perf_fd,
            libc::F_SETFL,
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_ASYNC,
        );
        libc::fcntl(perf_fd, libc::F_SETSIG, libc::SIGIO);
        libc::fcntl(perf_fd, libc::F_SETOWN, libc::getpid());
        libc::ioctl(perf_fd, PERF_EVENT_IOC_ENABLE, 0);
    }

    let outcome = drive_child(child, &ring);

    unsafe { libc::close(perf_fd) };

    let result = outcome?;
    ring.reset_pointers();
    Ok(result)
}

fn drive_child(child: Pid, ring: &RingMapping) -> Result<Vec<RawBranch>, TraceError> {
    loop {
        log::trace!("waiting for child pid={child}");
        let status = match waitpid(child, None) {
            Ok(status) => status,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                kill_child(child);
                return Err(TraceError::Wait(e));
            }
        };

        if DATA_READY.load(Ordering::SeqCst) > 0 {
            DATA_READY.fetch_sub(1, Ordering::SeqCst);
            log::trace!("BTS ring has {} branches so far", ring.branches().len());
            for b in ring.branches() {
                log::trace!("branch {:#x} {:#x}", b.from, b.to);
            }
        }

        match status {
            WaitStatus::Exited(_, code) => {
                log::debug!("child terminated with status {code}");
                break;
            }
            WaitStatus::Signaled(_, sig, _) => {
                log::debug!("child terminated by signal {sig:?}");
                break;
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                if let Err(e) = nix::sys::ptrace::cont(child, None) {
                    return Err(TraceError::Cont(e));
                }
            }
            WaitStatus::Stopped(_, sig) => {
                log::debug!("child stopped by signal {sig:?}");
                break;
            }
            _ => {
                if let Err(e) = nix::sys::ptrace::cont(child, None) {
                    return Err(TraceError::Cont(e));
                }
            }
        }
    }

    Ok(ring.branches().to_vec())
}

fn kill_child(child: Pid) {
    let _ = signal::kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_enable_matches_linux_io_macro() {
        // _IO('$', 0) = (('$' as u32) << 8) | 0
        assert_eq!(PERF_EVENT_IOC_ENABLE as u32, (b'$' as u32) << 8);
    }
}

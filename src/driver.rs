//! The driver event loop (spec §4.H): the single cooperative loop that
//! binds the corpus watcher, the BTS tracer, the reducer, the knowledge
//! base, and the messaging surface together.

use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::basic_blocks::BasicBlock;
use crate::cli::Cli;
use crate::corpus_watcher::CorpusWatcher;
use crate::error::{DriverError, RuntimeError, StartupError};
use crate::knowledge_base::KnowledgeBase;
use crate::messaging::{MessagingEndpoints, SingleModeLogs};
use crate::perf::{self, InputSink};
use crate::reducer::{self, Edge};
use crate::sections::SectionBounds;
use crate::{basic_blocks, sections};

/// Cooperative yield between sub-steps of one iteration (spec §4.H step 6).
const YIELD: Duration = Duration::from_micros(100);

/// Cap on a single persisted input (spec §6).
const MAX_INPUT_BYTES: u64 = 1 << 20;

/// Outcome of a clean loop exit, distinguished from a fatal [`DriverError`].
/// Both map to exit code 0 (spec §6); only a returned `Err` is non-zero.
pub enum Stop {
    FuzzerExited,
    Cancelled,
}

enum Bus {
    Multi(MessagingEndpoints),
    Single(SingleModeLogs),
}

pub struct Driver {
    fuzzer_id: String,
    data_dir: PathBuf,
    inject_dir: Option<PathBuf>,
    scratch_path: PathBuf,
    bbs: Vec<BasicBlock>,
    section_bounds: Option<SectionBounds>,
    sut_argv: Vec<String>,
    sut_input_file: Option<PathBuf>,
    sut_log_out: Option<PathBuf>,
    sut_log_err: Option<PathBuf>,
    kb: KnowledgeBase,
    watcher: CorpusWatcher,
    bus: Bus,
    cancelled: Arc<AtomicBool>,
    fuzzer_pid: Pid,
    input_n: u64,
    injected_n: u64,
    start_time: Instant,
}

impl Driver {
    /// Runs the full startup sequence of spec §4.H: spawns the fuzzer,
    /// resolves section bounds and basic blocks, brings up the corpus
    /// watcher, and brings up messaging or the single-mode logs.
    pub fn start(cli: &Cli, cancelled: Arc<AtomicBool>) -> Result<Self, StartupError> {
        perf::init_bts_type().map_err(StartupError::BtsUnsupported)?;

        let fuzzer_argv = parse_fuzzer_cmd(&cli.fuzzer_cmd_file)?;

        let section_bounds = match &cli.section_substr {
            Some(substr) => Some(
                sections::find(Path::new(&cli.sut_argv[0]), substr).map_err(|source| {
                    StartupError::Sections {
                        path: PathBuf::from(&cli.sut_argv[0]),
                        source,
                    }
                })?,
            ),
            None => None,
        };

        let bbs = basic_blocks::load(&cli.cfg_script, Path::new(&cli.sut_argv[0])).map_err(
            |source| StartupError::BasicBlocks {
                script: cli.cfg_script.clone(),
                binary: PathBuf::from(&cli.sut_argv[0]),
                source,
            },
        )?;
        for bb in &bbs {
            log::debug!("BB {:#018x} {:#018x}", bb.from, bb.to);
        }

        match (&cli.section_substr, section_bounds) {
            (Some(substr), Some(b)) => log::info!(
                "sut={} section={substr:?} bounds=[{:#x},{:#x}) bbs={}",
                cli.sut_argv[0],
                b.start,
                b.end,
                bbs.len()
            ),
            (None, _) => log::info!(
                "sut={} tracing all code, bbs={}",
                cli.sut_argv[0],
                bbs.len()
            ),
            (Some(_), None) => unreachable!("section_bounds is Some whenever section_substr is"),
        }

        let fuzzer_pid = spawn_fuzzer(
            &fuzzer_argv,
            cli.fuzzer_log_out.as_deref(),
            cli.fuzzer_log_err.as_deref(),
        )?;
        let start_time = Instant::now();
        log::info!("fuzzer {} spawned as pid {fuzzer_pid}", cli.fuzzer_id);

        let watcher =
            CorpusWatcher::new(&cli.corpus_dir, cancelled.as_ref()).map_err(|source| StartupError::CorpusWatch {
                path: cli.corpus_dir.clone(),
                source,
            })?;

        let bus = match &cli.ports {
            Some(ports) => Bus::Multi(MessagingEndpoints::connect(*ports, &cli.fuzzer_id).map_err(
                |e| match e {
                    crate::messaging::MessagingError::Zmq { endpoint, source } => {
                        StartupError::Messaging { endpoint, source }
                    }
                    crate::messaging::MessagingError::MalformedPorts(raw) => {
                        StartupError::PortsMalformed { raw }
                    }
                },
            )?),
            None => {
                let work_dir = PathBuf::from("./work");
                Bus::Single(
                    SingleModeLogs::open(&cli.fuzzer_id, &work_dir)
                        .map_err(|source| StartupError::CorpusWatch {
                            path: work_dir,
                            source,
                        })?,
                )
            }
        };

        Ok(Self {
            fuzzer_id: cli.fuzzer_id.clone(),
            data_dir: cli.data_dir.clone(),
            inject_dir: cli.inject_dir.clone(),
            scratch_path: scratch_path_for(&cli.fuzzer_id),
            bbs,
            section_bounds,
            sut_argv: cli.sut_argv.clone(),
            sut_input_file: cli.sut_input_file.clone(),
            sut_log_out: cli.fuzzer_log_out.clone(),
            sut_log_err: cli.fuzzer_log_err.clone(),
            kb: KnowledgeBase::new(),
            watcher,
            bus,
            cancelled,
            fuzzer_pid,
            input_n: 0,
            injected_n: 0,
            start_time,
        })
    }

    /// The per-iteration cooperative schedule (spec §4.H). Runs until the
    /// fuzzer exits, cancellation is requested, or a fatal error occurs.
    pub fn run(mut self) -> Result<Stop, DriverError> {
        loop {
            if !fuzzer_alive(self.fuzzer_pid) {
                log::info!("fuzzer {} is no longer alive, stopping", self.fuzzer_id);
                return Ok(Stop::FuzzerExited);
            }

            if self.cancelled.load(Ordering::SeqCst) {
                log::info!("cancellation requested, killing fuzzer {}", self.fuzzer_pid);
                self.kill_fuzzer();
                return Ok(Stop::Cancelled);
            }

            if let Err(e) = self.poll_corpus() {
                log::error!("fatal error polling corpus, killing fuzzer {}: {e}", self.fuzzer_pid);
                self.kill_fuzzer();
                return Err(e.into());
            }
            std::thread::sleep(YIELD);

            if let Bus::Multi(endpoints) = &self.bus {
                endpoints.poll_metric_rep(&self.kb);
            }
            std::thread::sleep(YIELD);

            if let Err(e) = self.poll_use_sub() {
                log::error!("fatal error polling use-sub, killing fuzzer {}: {e}", self.fuzzer_pid);
                self.kill_fuzzer();
                return Err(e.into());
            }
            std::thread::sleep(YIELD);
        }
    }

    /// Kills the long-lived fuzzer subprocess with an uncatchable signal and
    /// reaps it, on every exit path that is not "fuzzer already exited"
    /// (spec §4.H step 2, §7 FatalRuntime "kill fuzzer, exit non-zero").
    fn kill_fuzzer(&self) {
        let _ = signal::kill(self.fuzzer_pid, Signal::SIGKILL);
        let _ = waitpid(self.fuzzer_pid, None);
    }

    fn poll_corpus(&mut self) -> Result<(), RuntimeError> {
        let new_files = self.watcher.poll()?;
        for path in new_files {
            if let Err(e) = self.process_new_input(&path) {
                log::warn!("failed to process new input {}: {e}", path.display());
                return Err(e);
            }
        }
        Ok(())
    }

    fn process_new_input(&mut self, path: &Path) -> Result<(), RuntimeError> {
        let input_bytes = read_capped(path, MAX_INPUT_BYTES).map_err(|source| RuntimeError::DataWrite {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!(
            "got input {} of {} bytes from {}",
            self.input_n + 1,
            input_bytes.len(),
            path.display()
        );

        let sink = match &self.sut_input_file {
            Some(f) => InputSink::File(f.as_path()),
            None => InputSink::Stdin,
        };
        let raw = perf::trace(
            &self.scratch_path,
            &input_bytes,
            &self.sut_argv,
            sink,
            self.sut_log_out.as_deref(),
            self.sut_log_err.as_deref(),
        )?;

        let edges = reducer::reduce(&raw, self.section_bounds, &self.bbs);
        let new_edges = self.kb.absorb(&edges);

        self.input_n += 1;
        let input_path = self.data_dir.join(format!("{}:{:05}.input", self.fuzzer_id, self.input_n));
        let coverage_path = self
            .data_dir
            .join(format!("{}:{:05}.{}.coverage", self.fuzzer_id, self.input_n, edges.len()));

        fs::write(&input_path, &input_bytes).map_err(|source| RuntimeError::DataWrite {
            path: input_path.clone(),
            source,
        })?;
        write_coverage(&coverage_path, &edges).map_err(|source| RuntimeError::DataWrite {
            path: coverage_path.clone(),
            source,
        })?;

        let elapsed_us = self.start_time.elapsed().as_micros();
        match &mut self.bus {
            Bus::Multi(endpoints) => {
                endpoints.publish_interesting(&input_path, &coverage_path)?;
            }
            Bus::Single(logs) => {
                let _ = logs.log_interesting(elapsed_us, self.input_n);
                let _ = logs.log_coverage(elapsed_us, self.kb.size(), new_edges, self.kb.total_hits());
            }
        }

        Ok(())
    }

    fn poll_use_sub(&mut self) -> Result<(), RuntimeError> {
        let Bus::Multi(endpoints) = &self.bus else {
            return Ok(());
        };
        let Some(msg) = endpoints.poll_use_sub() else {
            return Ok(());
        };
        let Some(inject_dir) = &self.inject_dir else {
            return Ok(());
        };

        let edges = match crate::messaging::load_peer_coverage(&msg.coverage_path) {
            Ok(edges) => edges,
            Err(e) => {
                log::warn!("peer coverage file {} missing or unreadable: {e}", msg.coverage_path.display());
                return Ok(());
            }
        };
        self.kb.absorb(&edges);

        let dest = inject_dir.join(format!("{}:{:05}.input", self.fuzzer_id, self.injected_n + 1));
        if let Err(e) = fs::copy(&msg.input_path, &dest) {
            log::warn!("failed to copy peer input {} into inject dir: {e}", msg.input_path.display());
            return Ok(());
        }
        self.injected_n += 1;
        self.watcher.mark_seen(dest);

        Ok(())
    }
}

fn fuzzer_alive(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(_) => false,
        Err(nix::errno::Errno::ECHILD) => false,
        Err(_) => true,
    }
}

fn scratch_path_for(fuzzer_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{fuzzer_id}.scratch"))
}

fn read_capped(path: &Path, cap: u64) -> std::io::Result<Vec<u8>> {
    let mut f = fs::File::open(path)?;
    let mut buf = Vec::new();
    f.take(cap).read_to_end(&mut buf)?;
    Ok(buf)
}

fn write_coverage(path: &Path, edges: &[Edge]) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(edges.len() * 16);
    for edge in edges {
        bytes.extend_from_slice(&edge.from.to_le_bytes());
        bytes.extend_from_slice(&edge.to.to_le_bytes());
    }
    fs::write(path, &bytes)
}

/// Parses the `-f` fuzzer-command file: one argv token per line, at least
/// an executable and one argument (spec §6).
fn parse_fuzzer_cmd(path: &Path) -> Result<Vec<String>, StartupError> {
    let contents = fs::read_to_string(path).map_err(|source| StartupError::FuzzerCmdFile {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() < 2 {
        return Err(StartupError::FuzzerCmdTooShort {
            path: path.to_path_buf(),
        });
    }
    Ok(lines)
}

/// Forks and execs the fuzzer as a long-lived child, returning immediately
/// with its pid. Stdout/stderr are redirected the same way as the
/// ephemeral SUT child.
fn spawn_fuzzer(
    argv: &[String],
    log_out: Option<&Path>,
    log_err: Option<&Path>,
) -> Result<Pid, StartupError> {
    // SAFETY: the child path only calls async-signal-safe functions before
    // exec, or `_exit`s directly on failure.
    match unsafe { fork() }.map_err(StartupError::ForkFuzzer)? {
        ForkResult::Child => {
            perf::redirect_or_devnull(libc::STDOUT_FILENO, log_out);
            perf::redirect_or_devnull(libc::STDERR_FILENO, log_err);

            let Ok(cargv) = argv
                .iter()
                .map(|a| CString::new(a.as_str()))
                .collect::<Result<Vec<_>, _>>()
            else {
                unsafe { libc::_exit(127) };
            };
            let refs: Vec<&std::ffi::CStr> = cargv.iter().map(CString::as_c_str).collect();
            let _ = nix::unistd::execv(cargv[0].as_c_str(), &refs);
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fuzzer_cmd_file_skipping_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        fs::write(&path, "/usr/bin/fuzzer\n\n--seed-dir\ncorpus/\n").unwrap();
        let argv = parse_fuzzer_cmd(&path).unwrap();
        assert_eq!(argv, vec!["/usr/bin/fuzzer", "--seed-dir", "corpus/"]);
    }

    #[test]
    fn rejects_fuzzer_cmd_file_with_too_few_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        fs::write(&path, "/usr/bin/fuzzer\n").unwrap();
        assert!(matches!(
            parse_fuzzer_cmd(&path),
            Err(StartupError::FuzzerCmdTooShort { .. })
        ));
    }

    #[test]
    fn coverage_roundtrips_through_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("D1:00001.2.coverage");
        let edges = vec![Edge { from: 1, to: 2 }, Edge { from: 3, to: 4 }];
        write_coverage(&path, &edges).unwrap();

        let loaded = crate::messaging::load_peer_coverage(&path).unwrap();
        assert_eq!(loaded, edges);
    }
}

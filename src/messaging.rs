//! The three-port inter-driver messaging surface (spec §4.G), and the
//! single-mode time-series logger that substitutes for it when no peers
//! are configured (spec §4.H step 4).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::knowledge_base::KnowledgeBase;
use crate::reducer::Edge;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to parse ports '{0}', expected 'i,u,m'")]
    MalformedPorts(String),
    #[error("zmq error on {endpoint}: {source}")]
    Zmq {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },
}

/// The `i,u,m` triple from `-p`.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub interesting_push: u16,
    pub use_sub: u16,
    pub metric_rep: u16,
}

impl FromStr for Ports {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        let [i, u, m] = parts[..] else {
            return Err(MessagingError::MalformedPorts(s.to_string()));
        };
        let parse = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| MessagingError::MalformedPorts(s.to_string()))
        };
        Ok(Ports {
            interesting_push: parse(i)?,
            use_sub: parse(u)?,
            metric_rep: parse(m)?,
        })
    }
}

/// A peer-published tuple received on `use-sub`, already filtered to
/// messages naming this driver's id.
#[derive(Debug, PartialEq, Eq)]
pub struct UseMessage {
    pub input_path: PathBuf,
    pub coverage_path: PathBuf,
}

/// Parses a raw `"A <fuzzer_ids> <input_path> <coverage_path>"` message,
/// returning `Some` iff its `_`-separated id list names `fuzzer_id` (spec
/// §4.G, §6 S6). Factored out of [`MessagingEndpoints::poll_use_sub`] so the
/// routing rule is unit-testable without a live socket.
fn parse_use_message(raw: &str, fuzzer_id: &str) -> Option<UseMessage> {
    let mut cols = raw.split(' ');
    let topic = cols.next()?;
    if topic != "A" {
        log::warn!("use-sub message with unexpected topic: {raw:?}");
        return None;
    }
    let ids = cols.next()?;
    let input_path = cols.next()?;
    let coverage_path = cols.next()?;

    if !ids.split('_').any(|id| id == fuzzer_id) {
        return None;
    }

    Some(UseMessage {
        input_path: PathBuf::from(input_path),
        coverage_path: PathBuf::from(coverage_path),
    })
}

/// The three live sockets of multi mode.
pub struct MessagingEndpoints {
    _ctx: zmq::Context,
    push: zmq::Socket,
    sub: zmq::Socket,
    rep: zmq::Socket,
    fuzzer_id: String,
}

impl MessagingEndpoints {
    pub fn connect(ports: Ports, fuzzer_id: &str) -> Result<Self, MessagingError> {
        let ctx = zmq::Context::new();

        let push = ctx.socket(zmq::PUSH).map_err(zmq_err("interesting-push"))?;
        let push_endpoint = format!("tcp://localhost:{}", ports.interesting_push);
        push.connect(&push_endpoint)
            .map_err(zmq_err(&push_endpoint))?;

        let sub = ctx.socket(zmq::SUB).map_err(zmq_err("use-sub"))?;
        let sub_endpoint = format!("tcp://localhost:{}", ports.use_sub);
        sub.connect(&sub_endpoint).map_err(zmq_err(&sub_endpoint))?;
        sub.set_subscribe(b"A").map_err(zmq_err(&sub_endpoint))?;

        let rep = ctx.socket(zmq::REP).map_err(zmq_err("metric-rep"))?;
        let rep_endpoint = format!("tcp://*:{}", ports.metric_rep);
        rep.bind(&rep_endpoint).map_err(zmq_err(&rep_endpoint))?;

        Ok(Self {
            _ctx: ctx,
            push,
            sub,
            rep,
            fuzzer_id: fuzzer_id.to_string(),
        })
    }

    /// Publishes `"<fuzzer_id> <input_path> <coverage_path>"` on
    /// interesting-push.
    pub fn publish_interesting(
        &self,
        input_path: &Path,
        coverage_path: &Path,
    ) -> Result<(), zmq::Error> {
        let message = format!(
            "{} {} {}",
            self.fuzzer_id,
            input_path.display(),
            coverage_path.display()
        );
        self.push.send(&message, zmq::DONTWAIT)
    }

    /// Non-blocking poll of `use-sub`. Returns `None` on would-block or on
    /// a message that does not name this driver's id (spec §6 S6).
    pub fn poll_use_sub(&self) -> Option<UseMessage> {
        let raw = match self.sub.recv_string(zmq::DONTWAIT) {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => return None,
        };
        parse_use_message(&raw, &self.fuzzer_id)
    }

    /// Non-blocking poll of `metric-rep`. On a request, computes
    /// `metric_diff` against `kb` and replies with its decimal value.
    /// Malformed requests or missing coverage files are logged and
    /// skipped (spec §7 PeerError) rather than propagated.
    pub fn poll_metric_rep(&self, kb: &KnowledgeBase) {
        let raw = match self.rep.recv_string(zmq::DONTWAIT) {
            Ok(Ok(s)) => s,
            Ok(Err(_)) => {
                log::warn!("metric-rep request was not valid UTF-8");
                return;
            }
            Err(e) if e == zmq::Error::EAGAIN => return,
            Err(e) => {
                log::warn!("metric-rep recv failed: {e}");
                return;
            }
        };

        log::info!("metric req {raw}");
        let metric = match load_peer_coverage(Path::new(raw.trim())) {
            Ok(edges) => kb.diff(&edges) as f32,
            Err(e) => {
                log::warn!("failed to load peer coverage {raw:?}: {e}");
                0.0
            }
        };
        log::info!("computed metric {metric}");

        if let Err(e) = self.rep.send(&format!("{metric}"), 0) {
            log::warn!("failed to send metric reply: {e}");
        }
    }
}

fn zmq_err(endpoint: &str) -> impl Fn(zmq::Error) -> MessagingError + '_ {
    move |source| MessagingError::Zmq {
        endpoint: endpoint.to_string(),
        source,
    }
}

/// Loads a persisted `id:NNNNN.K.coverage` file into its edge vector,
/// trusting the `K` encoded in the filename for sizing (spec §6).
pub fn load_peer_coverage(path: &Path) -> Result<Vec<Edge>, std::io::Error> {
    let bytes = std::fs::read(path)?;
    Ok(bytes
        .chunks_exact(16)
        .map(|c| Edge {
            from: u64::from_le_bytes(c[0..8].try_into().unwrap()),
            to: u64::from_le_bytes(c[8..16].try_into().unwrap()),
        })
        .collect())
}

/// Single-mode substitute for the bus: two append-only time-series logs
/// (spec §4.H step 4, §6).
pub struct SingleModeLogs {
    interesting: File,
    coverage: File,
}

impl SingleModeLogs {
    pub fn open(fuzzer_id: &str, work_dir: &Path) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(work_dir)?;
        let interesting = OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join(format!("{fuzzer_id}.interesting.log")))?;
        let coverage = OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join(format!("{fuzzer_id}.coverage.log")))?;
        Ok(Self {
            interesting,
            coverage,
        })
    }

    /// `"<elapsed_us> <input_n>"`.
    pub fn log_interesting(&mut self, elapsed_us: u128, input_n: u64) -> std::io::Result<()> {
        writeln!(self.interesting, "{elapsed_us} {input_n}")
    }

    /// `"<elapsed_us> <kb.size> <new_edges> <kb.total_hits>"`.
    pub fn log_coverage(
        &mut self,
        elapsed_us: u128,
        kb_size: usize,
        new_edges: usize,
        kb_total_hits: u64,
    ) -> std::io::Result<()> {
        writeln!(
            self.coverage,
            "{elapsed_us} {kb_size} {new_edges} {kb_total_hits}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_triple() {
        let ports: Ports = "4000,4001,4002".parse().unwrap();
        assert_eq!(ports.interesting_push, 4000);
        assert_eq!(ports.use_sub, 4001);
        assert_eq!(ports.metric_rep, 4002);
    }

    #[test]
    fn rejects_malformed_port_triple() {
        assert!("4000,4001".parse::<Ports>().is_err());
        assert!("a,b,c".parse::<Ports>().is_err());
    }

    #[test]
    fn single_mode_logs_are_monotonic_in_elapsed_column() {
        let dir = tempfile::tempdir().unwrap();
        let mut logs = SingleModeLogs::open("D1", dir.path()).unwrap();
        logs.log_interesting(100, 1).unwrap();
        logs.log_interesting(250, 2).unwrap();
        drop(logs);

        let contents = std::fs::read_to_string(dir.path().join("D1.interesting.log")).unwrap();
        let timestamps: Vec<u128> = contents
            .lines()
            .map(|l| l.split(' ').next().unwrap().parse().unwrap())
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn s6_use_sub_routes_on_id_membership() {
        let routed = parse_use_message("A D2_D1 /corp/in42 /corp/cov42", "D1");
        assert_eq!(
            routed,
            Some(UseMessage {
                input_path: PathBuf::from("/corp/in42"),
                coverage_path: PathBuf::from("/corp/cov42"),
            })
        );

        let ignored = parse_use_message("A D2_D3 /corp/in42 /corp/cov42", "D1");
        assert_eq!(ignored, None);
    }

    #[test]
    fn s5_metric_diff_via_loaded_peer_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("D2:00001.3.coverage");
        let mut bytes = Vec::new();
        for (from, to) in [(1u64, 2u64), (5, 6), (7, 8)] {
            bytes.extend_from_slice(&from.to_le_bytes());
            bytes.extend_from_slice(&to.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();

        let mut kb = KnowledgeBase::new();
        kb.absorb(&[Edge { from: 1, to: 2 }, Edge { from: 3, to: 4 }]);

        let edges = load_peer_coverage(&path).unwrap();
        assert_eq!(kb.diff(&edges), 2);
    }
}

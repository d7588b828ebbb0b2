//! Command-line surface (spec §6).

use std::path::PathBuf;

use clap::Parser;

use crate::error::StartupError;
use crate::messaging::Ports;

#[derive(Debug, Parser)]
#[command(
    about = "Per-fuzzer coverage-observation driver: wraps a black-box fuzzer, traces its \
             interesting inputs with hardware branch tracing, and shares reduced coverage \
             with sibling drivers over a messaging bus"
)]
pub struct Cli {
    #[arg(help = "This driver's identity on the bus", short = 'i', required = true)]
    pub fuzzer_id: String,

    #[arg(
        help = "File whose lines are the argv of the fuzzer to launch",
        short = 'f',
        required = true
    )]
    pub fuzzer_cmd_file: PathBuf,

    #[arg(
        help = "Basic-block-extraction script, invoked as 'script binary'",
        short = 'b',
        required = true
    )]
    pub cfg_script: PathBuf,

    #[arg(help = "The fuzzer's output corpus directory to watch", short = 'c', required = true)]
    pub corpus_dir: PathBuf,

    #[arg(
        help = "Directory where id:NNNNN.input / id:NNNNN.N.coverage pairs are written",
        short = 'd',
        required = true
    )]
    pub data_dir: PathBuf,

    #[arg(
        help = "Comma-separated 'i,u,m' messaging ports; absent engages single mode",
        short = 'p'
    )]
    pub ports: Option<Ports>,

    #[arg(
        help = "Directory where peer-injected inputs are copied for fuzzer ingestion \
                (required in multi mode)",
        short = 'j'
    )]
    pub inject_dir: Option<PathBuf>,

    #[arg(
        help = "Restrict coverage to the first ELF section whose name contains this substring",
        short = 's'
    )]
    pub section_substr: Option<String>,

    #[arg(help = "Fuzzer stdout log file", short = 'l')]
    pub fuzzer_log_out: Option<PathBuf>,

    #[arg(help = "Fuzzer stderr log file", short = 'L')]
    pub fuzzer_log_err: Option<PathBuf>,

    #[arg(
        help = "If set, the SUT reads its input from this filename instead of stdin",
        short = 'F'
    )]
    pub sut_input_file: Option<PathBuf>,

    #[arg(help = "The SUT argv", last = true, required = true, num_args(1..))]
    pub sut_argv: Vec<String>,
}

impl Cli {
    /// Validates the cross-flag rule clap's derive API cannot express:
    /// `-j` is required iff ports (multi mode) were given.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.ports.is_some() && self.inject_dir.is_none() {
            return Err(StartupError::MissingInjectDir);
        }
        Ok(())
    }

    pub fn is_multi_mode(&self) -> bool {
        self.ports.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn multi_mode_without_inject_dir_is_rejected() {
        let cli = Cli {
            fuzzer_id: "D1".into(),
            fuzzer_cmd_file: "cmd".into(),
            cfg_script: "bb.sh".into(),
            corpus_dir: "corpus".into(),
            data_dir: "data".into(),
            ports: Some("1,2,3".parse().unwrap()),
            inject_dir: None,
            section_substr: None,
            fuzzer_log_out: None,
            fuzzer_log_err: None,
            sut_input_file: None,
            sut_argv: vec!["sut".into()],
        };
        assert!(matches!(cli.validate(), Err(StartupError::MissingInjectDir)));
    }

    #[test]
    fn single_mode_without_inject_dir_is_fine() {
        let cli = Cli {
            fuzzer_id: "D1".into(),
            fuzzer_cmd_file: "cmd".into(),
            cfg_script: "bb.sh".into(),
            corpus_dir: "corpus".into(),
            data_dir: "data".into(),
            ports: None,
            inject_dir: None,
            section_substr: None,
            fuzzer_log_out: None,
            fuzzer_log_err: None,
            sut_input_file: None,
            sut_argv: vec!["sut".into()],
        };
        assert!(cli.validate().is_ok());
    }
}

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::TERM_SIGNALS;

use uberfuzz_driver::cli::Cli;
use uberfuzz_driver::driver::{Driver, Stop};
use uberfuzz_driver::error::DriverError;

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = cli.validate() {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }

    // `signal_hook::flag::register` sets the flag to `true` on receipt of
    // the signal, which is exactly the "cancelled" polarity the driver loop
    // wants — no inversion needed.
    let cancelled = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&cancelled)) {
            log::error!("failed to install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    match run(&cli, cancelled) {
        Ok(Stop::FuzzerExited) => {
            log::info!("fuzzer exited, stopping driver {}", cli.fuzzer_id);
            ExitCode::SUCCESS
        }
        Ok(Stop::Cancelled) => {
            log::info!("driver {} cancelled", cli.fuzzer_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("driver {} aborting: {e}", cli.fuzzer_id);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, cancelled: Arc<AtomicBool>) -> Result<Stop, DriverError> {
    let driver = Driver::start(cli, cancelled)?;
    driver.run()
}

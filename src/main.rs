use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use spectrum_slurper::{
    args::{self, Args},
    config::RunContext,
    error::{Error, Result},
    exfil, radio, sweep,
};
use tracing::{error, info, warn};

fn run(args: &Args) -> Result<()> {
    let ctx = RunContext::from_args(args)?;

    // Ctrl-C stops the sweep after the current hop, queued work still drains
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, finishing up");
        flag.store(true, Ordering::Relaxed);
    }) {
        warn!("Couldn't install the Ctrl-C handler: {e}");
    }

    let sink = exfil::open_sink(&args.output_target())?;
    let summary = sweep::run(ctx, sink, &cancel)?;
    if summary.cancelled {
        info!("Stopped after {} run(s)", summary.runs_started);
    }
    for e in &summary.errors {
        error!("{e}");
    }
    summary.status()
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr, stdout is for spectra
    let _ = tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .try_init();

    if args.detect {
        let devices = radio::detect_devices();
        println!("{}", radio::describe_devices(&devices));
        return if devices.is_empty() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let code = e.exit_code();
            if let Error::RunsAborted(_) = e {
                warn!("Some spectra are missing from the output");
            }
            ExitCode::from(code)
        }
    }
}

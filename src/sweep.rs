//! Run controller.
//!
//! Builds the pipeline once per session (PSD workers, aggregator, writer) and
//! then drives the acquisition loop through as many runs as the run mode asks
//! for. A run that fails only takes itself down; the session keeps going.

use std::{
    io::Write,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    thread,
    time::Instant,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    aggregate::Aggregator,
    buffer::{self, BufferPlan, BufferRequest},
    capture::{Acquisition, RunOutcome},
    config::{RunContext, RunMode},
    error::{DeviceError, Error, Result, RunError},
    exfil::{self, OutputWriter},
    monitoring::{Report, Stats},
    plan::{plan_session, HopPlan},
    psd::{self, PsdStage},
    radio::{self, Radio},
};

/// Bounded queue, or unbounded when `capacity` is `None`
pub fn queue<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match capacity {
        Some(n) => bounded(n.max(1)),
        None => unbounded(),
    }
}

#[derive(Debug)]
pub struct Summary {
    pub report: Report,
    /// Every run the aggregator had to abort
    pub errors: Vec<RunError>,
    pub runs_started: u64,
    /// Stopped by the cancellation flag rather than the run mode
    pub cancelled: bool,
}

impl Summary {
    /// A session with aborted runs is a failure, even if later runs went fine
    pub fn status(&self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            n => Err(Error::RunsAborted(n as u64)),
        }
    }
}

/// A validated configuration and its hop plan
pub struct Session {
    ctx: Arc<RunContext>,
    plan: Arc<HopPlan>,
}

impl Session {
    /// Everything that can be checked without touching the device
    pub fn new(ctx: RunContext) -> Result<Self> {
        ctx.validate()?;
        let plan = plan_session(&ctx)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            plan: Arc::new(plan),
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn plan(&self) -> &HopPlan {
        &self.plan
    }

    pub fn size_buffers(&self, radio: &dyn Radio) -> Result<BufferPlan> {
        let ctx = &self.ctx;
        let buffers = buffer::size(&BufferRequest {
            averaging: ctx.averaging,
            hops: self.plan.len(),
            sample_rate: ctx.device.sample_rate,
            bins: self.plan.bin_count(),
            fft_overlap: ctx.fft_overlap,
            base_buffer_size: ctx.base_buffer_size,
            max_buffer_size: ctx.max_buffer_size,
            device_buffer_size: radio.capabilities().default_buffer_size,
        })?;
        if buffers.effective_repeats != buffers.repeats {
            info!(
                "Averaging {} spectra per hop instead of {}",
                buffers.effective_repeats, buffers.repeats
            );
        }
        info!(
            "Acquisition time per hop: {:.5} s",
            buffers.acquisition_time
        );
        info!(
            "Acquisition time per run: {:.5} s",
            buffers.acquisition_time * self.plan.len() as f64
        );
        Ok(buffers)
    }

    /// Configure `radio`, then sweep until the run mode or `cancel` says stop
    pub fn run<W: Write + Send + 'static>(
        &self,
        radio: &mut dyn Radio,
        sink: W,
        cancel: &AtomicBool,
    ) -> Result<Summary> {
        let ctx = &self.ctx;
        radio::configure(radio, &ctx.device)?;
        let buffers = self.size_buffers(radio)?;

        let start = Instant::now();
        let stats = Arc::new(Stats::default());
        let stage = Arc::new(PsdStage::from_context(
            ctx,
            self.plan.bin_count(),
            Arc::clone(&stats),
        ));
        let threads = ctx.worker_threads();
        let (buf_tx, buf_rx) = queue(ctx.queue_capacity());
        let (res_tx, res_rx) = unbounded();
        let (rec_tx, rec_rx) = queue(ctx.output_queue_capacity());

        let workers = psd::spawn_workers(&stage, threads, &buf_rx, &res_tx)?;
        drop(buf_rx);
        let aggregator = Aggregator::new(
            Arc::clone(&self.plan),
            ctx.stall_timeout,
            Arc::clone(&stats),
        );
        let aggregator = thread::Builder::new()
            .name("aggregator".to_owned())
            .spawn(move || aggregator.run(res_rx, rec_tx))
            .map_err(|_| Error::Spawn("aggregator"))?;
        let writer = OutputWriter::new(sink, exfil::encoder(ctx.output_format), Arc::clone(&stats));
        let writer = thread::Builder::new()
            .name("writer".to_owned())
            .spawn(move || writer.run(rec_rx))
            .map_err(|_| Error::Spawn("writer"))?;

        radio.start_stream()?;
        let mut acquisition = Acquisition::new(
            radio,
            &self.plan,
            buffers,
            &ctx.device,
            &stage.table,
            buf_tx,
            res_tx,
            &stats,
            cancel,
        );
        let mut run = 0;
        let mut cancelled = false;
        loop {
            if ctx.run_limit().map_or(false, |limit| run >= limit) {
                break;
            }
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            let t_run = Instant::now();
            let keep_going = match acquisition.run(run) {
                RunOutcome::Complete => {
                    debug!(run, elapsed = ?t_run.elapsed(), "Run acquired");
                    true
                }
                RunOutcome::Aborted { hop, error } => {
                    warn!("Run {run} aborted at hop {hop}: {error}");
                    // Nothing more will come out of a stream that has ended
                    !matches!(error, DeviceError::EndOfStream(_))
                }
                RunOutcome::Cancelled => {
                    info!("Interrupted during run {run}");
                    cancelled = true;
                    false
                }
                RunOutcome::Shutdown => {
                    warn!("PSD workers stopped, ending session");
                    false
                }
            };
            run += 1;
            if !keep_going {
                break;
            }
            if let RunMode::Elapsed(limit) = ctx.run_mode {
                if start.elapsed() >= limit {
                    break;
                }
            }
        }
        // Hanging up the queue lets the workers drain it and exit, which in
        // turn winds down the aggregator and the writer
        drop(acquisition);

        let mut panicked = None;
        for worker in workers {
            if worker.join().is_err() {
                panicked = Some("PSD worker");
            }
        }
        let errors = aggregator
            .join()
            .map_err(|_| Error::Panicked("aggregator"))?;
        let written = writer.join().map_err(|_| Error::Panicked("writer"))?;

        let report = Report {
            stats: stats.snapshot(),
            elapsed: start.elapsed(),
            worker_threads: threads,
            acquisition_capacity: ctx.queue_capacity(),
            output_capacity: ctx.output_queue_capacity(),
        };
        report.log();
        if let Some(name) = panicked {
            return Err(Error::Panicked(name));
        }
        written?;
        Ok(Summary {
            report,
            errors,
            runs_started: run,
            cancelled,
        })
    }
}

/// Open the device named in `ctx`, run the session and close the device
pub fn run<W: Write + Send + 'static>(
    ctx: RunContext,
    sink: W,
    cancel: &AtomicBool,
) -> Result<Summary> {
    let session = Session::new(ctx)?;
    let mut radio = radio::open(&session.context().device.args)?;
    info!(
        driver = %radio.info().driver,
        label = %radio.info().label,
        "Device opened"
    );
    let summary = session.run(radio.as_mut(), sink, cancel);
    radio.close();
    summary
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{AveragingTarget, DeviceParams, FreqSpec, OutputFormat, Resolution},
        error::ConfigError,
        radio::Gain,
    };

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn context(args: &str, runs: u64) -> RunContext {
        RunContext {
            freq: FreqSpec::Range {
                low: 100.0e6,
                high: 104.0e6,
            },
            resolution: Resolution::Bins(128),
            averaging: AveragingTarget::Repeats(16),
            run_mode: RunMode::Runs(runs),
            device: DeviceParams {
                args: args.to_owned(),
                sample_rate: 1.0e6,
                gain: Gain::Manual(20.0),
                ..DeviceParams::default()
            },
            max_threads: 2,
            output_format: OutputFormat::RtlPower,
            ..RunContext::default()
        }
    }

    #[test]
    fn config_errors_come_before_the_device() {
        let ctx = RunContext {
            crop: 0.1,
            hop_overlap: 0.1,
            ..context("driver=nope", 1)
        };
        let err = run(ctx, io::sink(), &AtomicBool::new(false)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unknown_driver_is_device_error() {
        let err = run(context("driver=nope", 1), io::sink(), &AtomicBool::new(false)).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn unsupported_rate_is_config_error() {
        let mut ctx = context("driver=tone", 1);
        ctx.device.sample_rate = 500.0e6;
        let err = run(ctx, io::sink(), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedRate(_))
        ));
    }

    #[test]
    fn runs_every_hop_of_every_run() {
        let out = Shared::default();
        let summary = run(
            context("driver=tone,tone=101.3M", 3),
            out.clone(),
            &AtomicBool::new(false),
        )
        .unwrap();
        summary.status().unwrap();
        assert_eq!(summary.runs_started, 3);
        assert_eq!(summary.report.stats.runs_completed, 3);
        assert_eq!(summary.report.stats.records_written, 12);
        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 12);
    }

    #[test]
    fn cancelled_before_start() {
        let summary = run(context("driver=tone", 5), io::sink(), &AtomicBool::new(true)).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.runs_started, 0);
        summary.status().unwrap();
    }

    #[test]
    fn ended_stream_stops_the_session() {
        let path = std::env::temp_dir().join("spectrum_slurper_sweep_short.cf32");
        // A few thousand samples, far less than one hop needs
        std::fs::write(&path, vec![0u8; 8 * 4000]).unwrap();
        let args = format!("driver=file,path={},format=cf32", path.display());
        let summary = run(context(&args, 10), io::sink(), &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.runs_started, 1);
        assert!(matches!(summary.status(), Err(Error::RunsAborted(1))));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn buffers_round_up_to_whole_transfers() {
        let session = Session::new(context("driver=tone", 1)).unwrap();
        let radio = radio::open("driver=tone").unwrap();
        let buffers = session.size_buffers(radio.as_ref()).unwrap();
        // 16 spectra of 128 bins fit in one 4096 sample transfer, which holds 32
        assert_eq!(buffers.buffer_size, 4096);
        assert_eq!(buffers.repeats, 16);
        assert_eq!(buffers.effective_repeats, 32);
        assert!((buffers.acquisition_time - 4096.0 / 1.0e6).abs() < 1e-12);
    }

    #[test]
    fn elapsed_mode_stops_after_the_deadline() {
        let ctx = RunContext {
            run_mode: RunMode::Elapsed(Duration::from_nanos(1)),
            ..context("driver=tone", 0)
        };
        let out = Shared::default();
        let summary = run(ctx, out.clone(), &AtomicBool::new(false)).unwrap();
        summary.status().unwrap();
        assert!(!summary.cancelled);
        // The deadline is only checked once a run is done
        assert_eq!(summary.runs_started, 1);
        assert_eq!(summary.report.stats.runs_completed, 1);
        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn continuous_mode_runs_until_cancelled() {
        let ctx = RunContext {
            run_mode: RunMode::Continuous,
            ..context("driver=tone", 0)
        };
        let cancel = AtomicBool::new(false);
        let summary = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                cancel.store(true, Ordering::Relaxed);
            });
            run(ctx, io::sink(), &cancel).unwrap()
        });
        summary.status().unwrap();
        assert!(summary.cancelled);
        assert!(summary.runs_started >= 1);
        let stats = &summary.report.stats;
        assert_eq!(stats.runs_aborted, 0);
        // Only the run that was interrupted can be missing
        assert!(stats.runs_completed + 1 >= summary.runs_started);
    }
}

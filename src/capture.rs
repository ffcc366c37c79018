//! This module contains all the capture logic.
//!
//! The acquisition thread does one thing, as fast as possible: drive the
//! radio through the hop plan and push every buffer it reads onto the PSD
//! queue. Anything slower than a memcpy happens on the worker threads.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Instant,
};

use chrono::Utc;
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::{
    buffer::BufferPlan,
    config::DeviceParams,
    error::{DeviceError, HopFailure},
    monitoring::Stats,
    plan::{HopPlan, HopSpec},
    psd::{AccumulatorTable, HopResult, RawBuffer},
    radio::{read_exact, read_timeout, Radio},
    Sample,
};

/// How a single hop ended
#[derive(Debug, Clone, PartialEq)]
pub enum HopOutcome {
    /// Every buffer is on the queue
    Complete,
    Cancelled,
    Failed(DeviceError),
    /// The workers are gone
    Shutdown,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Complete,
    Aborted { hop: usize, error: DeviceError },
    Cancelled,
    Shutdown,
}

pub struct Acquisition<'a> {
    radio: &'a mut dyn Radio,
    plan: &'a HopPlan,
    buffers: BufferPlan,
    device: &'a DeviceParams,
    table: &'a AccumulatorTable,
    queue: Sender<RawBuffer>,
    results: Sender<HopResult>,
    stats: &'a Stats,
    cancel: &'a AtomicBool,
    /// Where the radio was last tuned to
    tuned: Option<f64>,
}

impl<'a> Acquisition<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radio: &'a mut dyn Radio,
        plan: &'a HopPlan,
        buffers: BufferPlan,
        device: &'a DeviceParams,
        table: &'a AccumulatorTable,
        queue: Sender<RawBuffer>,
        results: Sender<HopResult>,
        stats: &'a Stats,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            radio,
            plan,
            buffers,
            device,
            table,
            queue,
            results,
            stats,
            cancel,
            tuned: None,
        }
    }

    /// Walk the whole plan once
    pub fn run(&mut self, run: u64) -> RunOutcome {
        let plan = self.plan;
        for hop in plan.iter() {
            match self.hop(run, hop) {
                HopOutcome::Complete => {}
                HopOutcome::Cancelled => return RunOutcome::Cancelled,
                HopOutcome::Shutdown => return RunOutcome::Shutdown,
                HopOutcome::Failed(error) => {
                    return RunOutcome::Aborted {
                        hop: hop.index,
                        error,
                    }
                }
            }
        }
        RunOutcome::Complete
    }

    /// The hop won't get more than `enqueued` buffers; let the workers know
    fn truncate(&self, run: u64, hop: usize, enqueued: usize, cause: HopFailure) {
        if let Some(result) = self.table.truncate(run, hop, enqueued, cause) {
            // Only fails if the aggregator is already gone
            let _ = self.results.send(result);
        }
    }

    fn tune(&mut self, hop: &HopSpec) -> Result<(), DeviceError> {
        if self.tuned == Some(hop.center_frequency) {
            return Ok(());
        }
        self.radio.set_frequency(hop.center_frequency)?;
        self.tuned = Some(hop.center_frequency);
        // Drivers may land on the nearest frequency their synthesizer can hit
        let actual = self.radio.frequency();
        if (actual - hop.center_frequency).abs() > hop.bin_size() / 2.0 {
            warn!(
                hop = hop.index,
                requested = hop.center_frequency,
                actual,
                "Device tuned off the hop center by more than half a bin"
            );
        }
        if !self.device.tune_delay.is_zero() {
            thread::sleep(self.device.tune_delay);
        }
        if self.device.reset_stream {
            self.radio.reset_stream()?;
        }
        Ok(())
    }

    /// Tune, read `buffer_repeats` buffers and enqueue them
    pub fn hop(&mut self, run: u64, hop: &HopSpec) -> HopOutcome {
        let repeats = self.buffers.buffer_repeats;
        self.table.open(run, hop, repeats);
        if self.cancel.load(Ordering::Relaxed) {
            self.truncate(run, hop.index, 0, HopFailure::Cancelled);
            return HopOutcome::Cancelled;
        }

        let t_tune = Instant::now();
        if let Err(e) = self.tune(hop) {
            self.tuned = None;
            self.truncate(run, hop.index, 0, e.clone().into());
            return HopOutcome::Failed(e);
        }
        let tune_time = t_tune.elapsed();

        let t_acq = Instant::now();
        let timeout = read_timeout(self.buffers.buffer_size, hop.sample_rate);
        for repeat in 0..repeats {
            if repeat > 0 && self.cancel.load(Ordering::Relaxed) {
                self.truncate(run, hop.index, repeat, HopFailure::Cancelled);
                return HopOutcome::Cancelled;
            }
            let mut payload = vec![Sample::default(); self.buffers.buffer_size];
            let timestamp = Utc::now();
            match read_exact(&mut *self.radio, &mut payload, timeout) {
                Ok(overflows) => self.stats.add_overflows(overflows),
                Err(e) => {
                    warn!(run, hop = hop.index, repeat, "Read failed: {e}");
                    self.truncate(run, hop.index, repeat, e.clone().into());
                    return HopOutcome::Failed(e);
                }
            }
            let buf = RawBuffer {
                run,
                hop_index: hop.index,
                repeat_index: repeat,
                sample_count: payload.len(),
                timestamp,
                finished: Utc::now(),
                payload,
            };
            // Blocks while the queue is full
            if self.queue.send(buf).is_err() {
                self.truncate(run, hop.index, repeat, HopFailure::Cancelled);
                return HopOutcome::Shutdown;
            }
            self.stats.acquisition_depth(self.queue.len());
        }
        debug!(
            run,
            hop = hop.index,
            freq = hop.center_frequency,
            tune = ?tune_time,
            acquisition = ?t_acq.elapsed(),
            "Hop acquired"
        );
        HopOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::{bounded, unbounded};

    use super::*;
    use crate::{
        config::{DeviceParams, FreqSpec},
        plan::plan,
        psd::Finish,
        radio,
    };

    struct Rig {
        radio: Box<dyn Radio>,
        plan: HopPlan,
        buffers: BufferPlan,
        device: DeviceParams,
        table: AccumulatorTable,
        stats: Stats,
        cancel: AtomicBool,
    }

    fn rig(args: &str) -> Rig {
        let device = DeviceParams {
            args: args.to_owned(),
            sample_rate: 1.0e6,
            gain: radio::Gain::Manual(10.0),
            ..DeviceParams::default()
        };
        let mut radio = radio::open(args).unwrap();
        radio::configure(radio.as_mut(), &device).unwrap();
        radio.start_stream().unwrap();
        let plan = plan(
            FreqSpec::Range {
                low: 100.0e6,
                high: 103.0e6,
            },
            64,
            1.0e6,
            0.0,
            0.0,
        )
        .unwrap();
        Rig {
            radio,
            plan,
            buffers: BufferPlan {
                buffer_size: 1024,
                buffer_repeats: 2,
                repeats: 32,
                effective_repeats: 32,
                stride: 32,
                segments_per_buffer: 31,
                acquisition_time: 2048.0 / 1.0e6,
            },
            device,
            table: AccumulatorTable::new(Finish::default()),
            stats: Stats::default(),
            cancel: AtomicBool::new(false),
        }
    }

    #[test]
    fn enqueues_every_buffer_in_order() {
        let mut rig = rig("driver=tone,tone=101.2M");
        let (tx, rx) = unbounded();
        let (res_tx, res_rx) = unbounded();
        let outcome = Acquisition::new(
            rig.radio.as_mut(),
            &rig.plan,
            rig.buffers,
            &rig.device,
            &rig.table,
            tx,
            res_tx,
            &rig.stats,
            &rig.cancel,
        )
        .run(0);
        assert_eq!(outcome, RunOutcome::Complete);
        let last = rig.plan.iter().last().unwrap().center_frequency;
        assert!((rig.radio.frequency() - last).abs() < 1.0);
        let order: Vec<(usize, usize)> = rx.iter().map(|b| (b.hop_index, b.repeat_index)).collect();
        let expected: Vec<(usize, usize)> = (0..3).flat_map(|h| [(h, 0), (h, 1)]).collect();
        assert_eq!(order, expected);
        assert!(res_rx.try_recv().is_err());
        assert_eq!(rig.table.len(), 3);
    }

    #[test]
    fn read_failure_truncates_hop() {
        // Each 1024 sample read is a single transfer, so read 3 is hop 1, repeat 0
        let mut rig = rig("driver=tone,fail_on_read=3");
        let (tx, rx) = unbounded();
        let (res_tx, res_rx) = unbounded();
        let outcome = Acquisition::new(
            rig.radio.as_mut(),
            &rig.plan,
            rig.buffers,
            &rig.device,
            &rig.table,
            tx,
            res_tx,
            &rig.stats,
            &rig.cancel,
        )
        .run(4);
        assert!(matches!(outcome, RunOutcome::Aborted { hop: 1, .. }));
        assert_eq!(rx.iter().count(), 2);
        let failed = res_rx.try_recv().unwrap();
        assert!(matches!(
            failed,
            HopResult::Failed {
                run: 4,
                hop_index: 1,
                cause: HopFailure::Device(_)
            }
        ));
    }

    #[test]
    fn cancellation_before_a_hop() {
        let mut rig = rig("driver=tone");
        rig.cancel.store(true, Ordering::Relaxed);
        let (tx, rx) = bounded(8);
        let (res_tx, res_rx) = unbounded();
        let outcome = Acquisition::new(
            rig.radio.as_mut(),
            &rig.plan,
            rig.buffers,
            &rig.device,
            &rig.table,
            tx,
            res_tx,
            &rig.stats,
            &rig.cancel,
        )
        .run(0);
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(rx.iter().count(), 0);
        assert!(matches!(
            res_rx.try_recv(),
            Ok(HopResult::Failed {
                cause: HopFailure::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn full_queue_blocks_acquisition() {
        let mut rig = rig("driver=tone");
        let (tx, rx) = bounded(1);
        let (res_tx, _res_rx) = unbounded();
        let pause = Duration::from_millis(200);
        let (outcome, elapsed, received) = thread::scope(|s| {
            let consumer = s.spawn(move || {
                // Nothing is drained until the pause is over
                thread::sleep(pause);
                assert_eq!(rx.len(), 1);
                rx.iter()
                    .inspect(|buf: &RawBuffer| assert_eq!(buf.payload.len(), 1024))
                    .count()
            });
            let start = Instant::now();
            let outcome = Acquisition::new(
                rig.radio.as_mut(),
                &rig.plan,
                rig.buffers,
                &rig.device,
                &rig.table,
                tx,
                res_tx,
                &rig.stats,
                &rig.cancel,
            )
            .run(0);
            let elapsed = start.elapsed();
            (outcome, elapsed, consumer.join().unwrap())
        });
        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(received, 6);
        assert!(elapsed >= pause);
        assert!(rig.stats.snapshot().max_acquisition_depth <= 1);
    }

    #[test]
    fn closed_queue_shuts_down() {
        let mut rig = rig("driver=tone");
        let (tx, rx) = bounded(8);
        drop(rx);
        let (res_tx, _res_rx) = unbounded();
        let outcome = Acquisition::new(
            rig.radio.as_mut(),
            &rig.plan,
            rig.buffers,
            &rig.device,
            &rig.table,
            tx,
            res_tx,
            &rig.stats,
            &rig.cancel,
        )
        .run(0);
        assert_eq!(outcome, RunOutcome::Shutdown);
    }
}

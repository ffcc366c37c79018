//! Hop aggregator.
//!
//! Workers finish hops in whatever order the scheduler likes. This stage holds
//! results back until everything before them has gone out, trims each hop down
//! to the slice it contributes to the stitched spectrum and forwards it to the
//! writer. A hop that fails, or never shows up, takes the rest of its run with
//! it; the next run starts clean.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::{
    error::{HopFailure, RunError},
    monitoring::Stats,
    plan::HopPlan,
    psd::{HopResult, Spectrum},
};

/// What the writer gets, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Hop(Spectrum),
    /// Every hop of `run` that will ever be written has been
    RunEnd { run: u64, aborted: bool },
}

/// Trim `bins` from each edge of a spectrum
pub fn trim(mut spectrum: Spectrum, bins: usize) -> Spectrum {
    if bins == 0 || 2 * bins >= spectrum.values.len() {
        return spectrum;
    }
    let kept = spectrum.values.len() - 2 * bins;
    spectrum.values.drain(..bins);
    spectrum.values.truncate(kept);
    spectrum.min_freq += bins as f64 * spectrum.bin_size;
    spectrum.max_freq -= bins as f64 * spectrum.bin_size;
    spectrum
}

pub struct Aggregator {
    plan: Arc<HopPlan>,
    /// `(run, hop)` allowed out next
    next: (u64, usize),
    pending: BTreeMap<(u64, usize), HopResult>,
    stall_timeout: Duration,
    stats: Arc<Stats>,
    errors: Vec<RunError>,
}

impl Aggregator {
    pub fn new(plan: Arc<HopPlan>, stall_timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            plan,
            next: (0, 0),
            pending: BTreeMap::new(),
            stall_timeout,
            stats,
            errors: Vec::new(),
        }
    }

    /// Take one worker result and return whatever is now ready to write
    pub fn push(&mut self, result: HopResult) -> Vec<Record> {
        let key = result.key();
        if key < self.next {
            debug!(run = key.0, hop = key.1, "Dropping result for a closed run");
            self.stats.hop_discarded();
            return Vec::new();
        }
        self.pending.insert(key, result);
        let mut out = Vec::new();
        self.drain(&mut out);
        out
    }

    fn drain(&mut self, out: &mut Vec<Record>) {
        while let Some(result) = self.pending.remove(&self.next) {
            match result {
                HopResult::Ready(spectrum) => {
                    let bins = self
                        .plan
                        .get(spectrum.hop_index)
                        .map_or(0, |h| h.stitch_bins());
                    out.push(Record::Hop(trim(spectrum, bins)));
                    self.advance(out);
                }
                HopResult::Failed {
                    run,
                    hop_index,
                    cause: HopFailure::Cancelled,
                } => {
                    info!("Run {run} cancelled at hop {hop_index}");
                    self.close_run(run, None, out);
                }
                HopResult::Failed {
                    run,
                    hop_index,
                    cause,
                } => {
                    let err = RunError::Fatal {
                        run,
                        hop: hop_index,
                        reason: cause.to_string(),
                    };
                    self.close_run(run, Some(err), out);
                }
            }
        }
    }

    fn advance(&mut self, out: &mut Vec<Record>) {
        let (run, hop) = self.next;
        if hop + 1 >= self.plan.len() {
            out.push(Record::RunEnd {
                run,
                aborted: false,
            });
            self.stats.run_completed();
            self.next = (run + 1, 0);
        } else {
            self.next = (run, hop + 1);
        }
    }

    fn close_run(&mut self, run: u64, err: Option<RunError>, out: &mut Vec<Record>) {
        if let Some(err) = err {
            error!("{err}");
            self.stats.run_aborted();
            self.errors.push(err);
        }
        out.push(Record::RunEnd { run, aborted: true });
        self.next = (run + 1, 0);
        let stale: Vec<_> = self.pending.range(..self.next).map(|(k, _)| *k).collect();
        for key in stale {
            self.pending.remove(&key);
            self.stats.hop_discarded();
        }
    }

    /// The hop we're waiting on hasn't turned up in `waited`; give up on its run
    pub fn stall(&mut self, waited: Duration) -> Vec<Record> {
        let mut out = Vec::new();
        if self.pending.is_empty() {
            return out;
        }
        let (run, hop) = self.next;
        let stall = RunError::QueueStall { run, hop, waited };
        let fatal = RunError::Fatal {
            run,
            hop,
            reason: stall.to_string(),
        };
        self.close_run(run, Some(fatal), &mut out);
        self.drain(&mut out);
        out
    }

    /// The workers are gone; anything still held back will never be released
    pub fn finish(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        while !self.pending.is_empty() {
            out.extend(self.stall(Duration::ZERO));
        }
        out
    }

    pub fn errors(&self) -> &[RunError] {
        &self.errors
    }

    /// Drive the aggregator until the workers hang up. Returns the errors of
    /// every run it had to abort.
    pub fn run(mut self, results: Receiver<HopResult>, output: Sender<Record>) -> Vec<RunError> {
        loop {
            let next = if self.pending.is_empty() {
                results.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                results.recv_timeout(self.stall_timeout)
            };
            let (records, done) = match next {
                Ok(result) => (self.push(result), false),
                Err(RecvTimeoutError::Timeout) => (self.stall(self.stall_timeout), false),
                Err(RecvTimeoutError::Disconnected) => (self.finish(), true),
            };
            for record in records {
                if output.send(record).is_err() {
                    error!("Writer hung up, dropping remaining records");
                    return self.errors;
                }
                self.stats.output_depth(output.len());
            }
            if done {
                return self.errors;
            }
        }
    }
}

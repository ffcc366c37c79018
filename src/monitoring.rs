//! In this module, we implement all the monitoring logic for the sweep.
//! This includes overflow counts from the radio, dropped work in the PSD
//! workers and how close the queues came to filling up. All counters are
//! lock-free so every stage can bump them from its own thread.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use tracing::info;

#[derive(Debug, Default)]
pub struct Stats {
    overflows: AtomicU64,
    worker_errors: AtomicU64,
    buffers_processed: AtomicU64,
    segments_averaged: AtomicU64,
    hops_discarded: AtomicU64,
    records_written: AtomicU64,
    runs_completed: AtomicU64,
    runs_aborted: AtomicU64,
    max_acquisition_depth: AtomicUsize,
    max_output_depth: AtomicUsize,
}

/// Plain copy of [`Stats`] at one point in time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub overflows: u64,
    pub worker_errors: u64,
    pub buffers_processed: u64,
    pub segments_averaged: u64,
    pub hops_discarded: u64,
    pub records_written: u64,
    pub runs_completed: u64,
    pub runs_aborted: u64,
    pub max_acquisition_depth: usize,
    pub max_output_depth: usize,
}

impl Stats {
    pub fn add_overflows(&self, n: u64) {
        self.overflows.fetch_add(n, Ordering::Relaxed);
    }

    pub fn worker_error(&self) {
        self.worker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_processed(&self, segments: u64) {
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
        self.segments_averaged.fetch_add(segments, Ordering::Relaxed);
    }

    pub fn hop_discarded(&self) {
        self.hops_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquisition_depth(&self, depth: usize) {
        self.max_acquisition_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn output_depth(&self, depth: usize) {
        self.max_output_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            overflows: self.overflows.load(Ordering::Relaxed),
            worker_errors: self.worker_errors.load(Ordering::Relaxed),
            buffers_processed: self.buffers_processed.load(Ordering::Relaxed),
            segments_averaged: self.segments_averaged.load(Ordering::Relaxed),
            hops_discarded: self.hops_discarded.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_aborted: self.runs_aborted.load(Ordering::Relaxed),
            max_acquisition_depth: self.max_acquisition_depth.load(Ordering::Relaxed),
            max_output_depth: self.max_output_depth.load(Ordering::Relaxed),
        }
    }
}

fn capacity(cap: Option<usize>) -> String {
    cap.map_or_else(|| "unlimited".to_owned(), |c| c.to_string())
}

/// Session summary, including the limits the counters are measured against
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    pub worker_threads: usize,
    pub acquisition_capacity: Option<usize>,
    pub output_capacity: Option<usize>,
}

impl Report {
    pub fn log(&self) {
        let s = &self.stats;
        info!(
            "Runs: {} completed, {} aborted",
            s.runs_completed, s.runs_aborted
        );
        info!("Number of device buffer overflow errors: {}", s.overflows);
        info!(
            "Buffers processed: {} ({} segments averaged, {} worker errors)",
            s.buffers_processed, s.segments_averaged, s.worker_errors
        );
        info!("Hops discarded: {}", s.hops_discarded);
        info!("PSD worker threads: {}", self.worker_threads);
        info!(
            "Max. PSD queue size: {} / {}",
            s.max_acquisition_depth,
            capacity(self.acquisition_capacity)
        );
        info!(
            "Max. Writer queue size: {} / {}",
            s.max_output_depth,
            capacity(self.output_capacity)
        );
        info!("Records written: {}", s.records_written);
        info!("Total time: {:.3} s", self.elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_keeps_maximum() {
        let stats = Stats::default();
        stats.acquisition_depth(3);
        stats.acquisition_depth(9);
        stats.acquisition_depth(1);
        stats.output_depth(2);
        let snap = stats.snapshot();
        assert_eq!(snap.max_acquisition_depth, 9);
        assert_eq!(snap.max_output_depth, 2);
    }

    #[test]
    fn counters() {
        let stats = Stats::default();
        stats.add_overflows(2);
        stats.buffer_processed(5);
        stats.buffer_processed(5);
        stats.worker_error();
        stats.run_aborted();
        let snap = stats.snapshot();
        assert_eq!(snap.overflows, 2);
        assert_eq!(snap.buffers_processed, 2);
        assert_eq!(snap.segments_averaged, 10);
        assert_eq!(snap.worker_errors, 1);
        assert_eq!(snap.runs_aborted, 1);
    }
}

//! PSD worker pool.
//!
//! Workers pull raw buffers off the acquisition queue, turn each one into a
//! Welch partial sum and park it in the hop's [`SpectrumAccumulator`]. Whoever
//! delivers the last buffer of a hop finalizes it and hands the spectrum to the
//! aggregator. Partial sums are kept per buffer and merged in repeat order, so
//! the result doesn't depend on which worker got which buffer.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use num_complex::Complex64;
use tracing::{debug, warn};

use crate::{
    buffer::segment_stride,
    config::RunContext,
    error::{Error, HopFailure, TransformError},
    f_engine::{engine, FftBackend, SpectralEngine},
    monitoring::Stats,
    plan::HopSpec,
    window::{Detrend, Window},
    Sample,
};

/// One device read, owned by whichever worker dequeues it
#[derive(Debug, Clone, PartialEq)]
pub struct RawBuffer {
    pub run: u64,
    pub hop_index: usize,
    pub repeat_index: usize,
    pub sample_count: usize,
    /// When the read started
    pub timestamp: DateTime<Utc>,
    /// When the read completed
    pub finished: DateTime<Utc>,
    pub payload: Vec<Sample>,
}

/// Averaged power spectrum of one hop, fft-shifted so frequency ascends
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub run: u64,
    pub hop_index: usize,
    /// Frequency of the first bin
    pub min_freq: f64,
    /// Upper edge of the last bin
    pub max_freq: f64,
    pub bin_size: f64,
    pub values: Vec<f64>,
    pub time_start: DateTime<Utc>,
    pub time_stop: DateTime<Utc>,
    /// Welch segments that went into the average
    pub segments: u64,
}

impl Spectrum {
    pub fn bin_count(&self) -> usize {
        self.values.len()
    }

    /// Center frequency of every bin
    pub fn frequencies(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.values.len()).map(|i| self.min_freq + i as f64 * self.bin_size)
    }
}

/// What a hop turns into once every buffer it's waiting on has been seen
#[derive(Debug, Clone, PartialEq)]
pub enum HopResult {
    Ready(Spectrum),
    Failed {
        run: u64,
        hop_index: usize,
        cause: HopFailure,
    },
}

impl HopResult {
    /// `(run, hop)` ordering key
    pub fn key(&self) -> (u64, usize) {
        match self {
            HopResult::Ready(s) => (s.run, s.hop_index),
            HopResult::Failed { run, hop_index, .. } => (*run, *hop_index),
        }
    }
}

/// Post-processing applied when a hop is finalized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Finish {
    pub remove_dc: bool,
    pub linear: bool,
}

/// Welch sums from a single buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Partial {
    /// Unshifted, unaveraged power per bin
    pub power: Vec<f64>,
    pub segments: u64,
    /// Segments dropped because the transform failed
    pub errors: u64,
}

/// Per-worker buffers so the hot loop never allocates
pub struct Scratch {
    segment: Vec<Complex64>,
    fft: Vec<Complex64>,
}

/// Welch estimator for one segment length, with its window cached
pub struct Welch {
    bins: usize,
    stride: usize,
    window: Vec<f64>,
    /// 1 / (fs * sum(w^2))
    scale: f64,
    detrend: Detrend,
    engine: Arc<dyn SpectralEngine>,
}

impl Welch {
    pub fn new(
        bins: usize,
        sample_rate: f64,
        window: &Window,
        detrend: Detrend,
        fft_overlap: f64,
        backend: FftBackend,
    ) -> Self {
        let window = window.coefficients(bins);
        let energy: f64 = window.iter().map(|w| w * w).sum();
        Self {
            bins,
            stride: segment_stride(bins, fft_overlap),
            window,
            scale: 1.0 / (sample_rate * energy),
            detrend,
            engine: engine(bins, backend),
        }
    }

    pub fn from_context(ctx: &RunContext, bins: usize) -> Self {
        Self::new(
            bins,
            ctx.device.sample_rate,
            &ctx.window,
            ctx.detrend,
            ctx.fft_overlap,
            ctx.fft_backend,
        )
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn scratch(&self) -> Scratch {
        Scratch {
            segment: vec![Complex64::default(); self.bins],
            fft: vec![Complex64::default(); self.engine.scratch_len()],
        }
    }

    /// Add one segment's power into `power`
    fn segment(
        &self,
        samples: &[Sample],
        scratch: &mut Scratch,
        power: &mut [f64],
    ) -> Result<(), TransformError> {
        let Scratch { segment, fft } = scratch;
        segment
            .iter_mut()
            .zip(samples)
            .for_each(|(d, s)| *d = Complex64::new(s.re.into(), s.im.into()));
        self.detrend.apply(segment);
        self.engine.forward(segment, &self.window, fft)?;
        if let Some(bin) = segment
            .iter()
            .position(|x| !(x.re.is_finite() && x.im.is_finite()))
        {
            return Err(TransformError::NonFinite(bin));
        }
        power
            .iter_mut()
            .zip(segment.iter())
            .for_each(|(p, x)| *p += x.norm_sqr() * self.scale);
        Ok(())
    }

    /// Slide across `samples` and sum the power of every full segment
    pub fn buffer_psd(&self, samples: &[Sample], scratch: &mut Scratch) -> Partial {
        let mut partial = Partial {
            power: vec![0.0; self.bins],
            segments: 0,
            errors: 0,
        };
        if samples.len() < self.bins {
            return partial;
        }
        for start in (0..=samples.len() - self.bins).step_by(self.stride) {
            match self.segment(&samples[start..start + self.bins], scratch, &mut partial.power) {
                Ok(()) => partial.segments += 1,
                Err(e) => {
                    warn!("Skipping FFT segment at sample {start}: {e}");
                    partial.errors += 1;
                }
            }
        }
        partial
    }
}

/// Replace the center (DC) bin of a shifted spectrum with its neighbours' mean
pub fn remove_dc(values: &mut [f64]) {
    let n = values.len();
    if n < 3 {
        return;
    }
    let c = n / 2;
    values[c] = (values[c - 1] + values[c + 1]) / 2.0;
}

/// Running state of one hop while its buffers are in flight
#[derive(Debug)]
pub struct SpectrumAccumulator {
    run: u64,
    hop: HopSpec,
    /// Buffers to wait for
    target: usize,
    received: usize,
    partials: BTreeMap<usize, Partial>,
    time_start: Option<DateTime<Utc>>,
    time_stop: Option<DateTime<Utc>>,
    failure: Option<HopFailure>,
    done: bool,
}

impl SpectrumAccumulator {
    pub fn new(run: u64, hop: HopSpec, target: usize) -> Self {
        Self {
            run,
            hop,
            target,
            received: 0,
            partials: BTreeMap::new(),
            time_start: None,
            time_stop: None,
            failure: None,
            done: false,
        }
    }

    /// Returns true exactly once, when the last expected buffer arrives
    pub fn contribute(
        &mut self,
        repeat_index: usize,
        partial: Partial,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> bool {
        self.received += 1;
        self.time_start = Some(self.time_start.map_or(started, |t| t.min(started)));
        self.time_stop = Some(self.time_stop.map_or(finished, |t| t.max(finished)));
        self.partials.insert(repeat_index, partial);
        self.take_completion()
    }

    /// Stop waiting for buffers that will never be enqueued.
    ///
    /// The hop still completes once the `enqueued` buffers already in flight
    /// are in, but finalizes as a failure.
    pub fn truncate(&mut self, enqueued: usize, cause: HopFailure) -> bool {
        self.target = enqueued;
        self.failure.get_or_insert(cause);
        self.take_completion()
    }

    fn take_completion(&mut self) -> bool {
        if !self.done && self.received >= self.target {
            self.done = true;
            true
        } else {
            false
        }
    }

    pub fn finalize(&mut self, finish: Finish) -> HopResult {
        let failed = |cause| HopResult::Failed {
            run: self.run,
            hop_index: self.hop.index,
            cause,
        };
        if let Some(cause) = self.failure.take() {
            return failed(cause);
        }
        let bins = self.hop.bin_count;
        let mut power = vec![0.0; bins];
        let mut segments = 0;
        for partial in mem::take(&mut self.partials).into_values() {
            power
                .iter_mut()
                .zip(&partial.power)
                .for_each(|(p, x)| *p += x);
            segments += partial.segments;
        }
        if segments == 0 {
            return failed(HopFailure::NoSegments);
        }
        power.iter_mut().for_each(|p| *p /= segments as f64);
        power.rotate_right(bins / 2);
        if finish.remove_dc {
            remove_dc(&mut power);
        }
        if !finish.linear {
            power.iter_mut().for_each(|p| *p = 10.0 * p.log10());
        }
        let now = Utc::now();
        let min_freq = self.hop.bin_frequency(0);
        HopResult::Ready(Spectrum {
            run: self.run,
            hop_index: self.hop.index,
            min_freq,
            max_freq: min_freq + bins as f64 * self.hop.bin_size(),
            bin_size: self.hop.bin_size(),
            values: power,
            time_start: self.time_start.unwrap_or(now),
            time_stop: self.time_stop.unwrap_or(now),
            segments,
        })
    }
}

type Entry = Arc<Mutex<SpectrumAccumulator>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accumulators of every hop currently in flight, keyed by `(run, hop)`
#[derive(Debug, Default)]
pub struct AccumulatorTable {
    entries: Mutex<HashMap<(u64, usize), Entry>>,
    finish: Finish,
}

impl AccumulatorTable {
    pub fn new(finish: Finish) -> Self {
        Self {
            entries: Mutex::default(),
            finish,
        }
    }

    /// Start tracking a hop that will deliver `target` buffers
    pub fn open(&self, run: u64, hop: &HopSpec, target: usize) {
        let acc = SpectrumAccumulator::new(run, hop.clone(), target);
        lock(&self.entries).insert((run, hop.index), Arc::new(Mutex::new(acc)));
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: (u64, usize)) -> Option<Entry> {
        lock(&self.entries).get(&key).cloned()
    }

    fn complete(&self, key: (u64, usize), acc: &mut SpectrumAccumulator) -> HopResult {
        lock(&self.entries).remove(&key);
        let result = acc.finalize(self.finish);
        debug!(run = key.0, hop = key.1, "Hop finalized");
        result
    }

    pub fn contribute(&self, buf: &RawBuffer, partial: Partial) -> Option<HopResult> {
        let key = (buf.run, buf.hop_index);
        let Some(entry) = self.entry(key) else {
            warn!(run = key.0, hop = key.1, "Buffer for a hop that isn't open");
            return None;
        };
        let mut acc = lock(&entry);
        acc.contribute(buf.repeat_index, partial, buf.timestamp, buf.finished)
            .then(|| self.complete(key, &mut acc))
    }

    pub fn truncate(
        &self,
        run: u64,
        hop_index: usize,
        enqueued: usize,
        cause: HopFailure,
    ) -> Option<HopResult> {
        let key = (run, hop_index);
        let entry = self.entry(key)?;
        let mut acc = lock(&entry);
        acc.truncate(enqueued, cause)
            .then(|| self.complete(key, &mut acc))
    }
}

/// Everything the workers share
pub struct PsdStage {
    pub welch: Welch,
    pub table: AccumulatorTable,
    stats: Arc<Stats>,
}

impl PsdStage {
    pub fn new(welch: Welch, finish: Finish, stats: Arc<Stats>) -> Self {
        Self {
            welch,
            table: AccumulatorTable::new(finish),
            stats,
        }
    }

    pub fn from_context(ctx: &RunContext, bins: usize, stats: Arc<Stats>) -> Self {
        let finish = Finish {
            remove_dc: ctx.remove_dc,
            linear: ctx.linear,
        };
        Self::new(Welch::from_context(ctx, bins), finish, stats)
    }

    /// Consume one buffer, returning the hop's result if it was the last one
    pub fn process(&self, buf: RawBuffer, scratch: &mut Scratch) -> Option<HopResult> {
        let partial = self.welch.buffer_psd(&buf.payload, scratch);
        for _ in 0..partial.errors {
            self.stats.worker_error();
        }
        self.stats.buffer_processed(partial.segments);
        self.table.contribute(&buf, partial)
    }
}

fn worker(stage: &PsdStage, buffers: Receiver<RawBuffer>, results: Sender<HopResult>) {
    let mut scratch = stage.welch.scratch();
    // Ends once the acquisition side hangs up and the queue is drained
    for buf in buffers.iter() {
        if let Some(result) = stage.process(buf, &mut scratch) {
            if results.send(result).is_err() {
                debug!("Aggregator hung up, PSD worker exiting");
                break;
            }
        }
    }
}

pub fn spawn_workers(
    stage: &Arc<PsdStage>,
    count: usize,
    buffers: &Receiver<RawBuffer>,
    results: &Sender<HopResult>,
) -> Result<Vec<JoinHandle<()>>, Error> {
    (0..count.max(1))
        .map(|i| {
            let stage = Arc::clone(stage);
            let buffers = buffers.clone();
            let results = results.clone();
            thread::Builder::new()
                .name(format!("psd-{i}"))
                .spawn(move || worker(&stage, buffers, results))
                .map_err(|_| Error::Spawn("PSD worker"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::f64::consts::TAU;

    use crossbeam_channel::{bounded, unbounded};

    use super::*;
    use crate::window::WindowKind;

    fn hop(index: usize, center: f64, rate: f64, bins: usize) -> HopSpec {
        HopSpec {
            index,
            center_frequency: center,
            sample_rate: rate,
            bin_count: bins,
            crop_fraction: 0.0,
            overlap_fraction: 0.0,
        }
    }

    fn tone(offset: f64, rate: f64, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let phase = TAU * offset * i as f64 / rate;
                Sample::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    fn buffer(run: u64, hop_index: usize, repeat_index: usize, payload: Vec<Sample>) -> RawBuffer {
        let now = Utc::now();
        RawBuffer {
            run,
            hop_index,
            repeat_index,
            sample_count: payload.len(),
            timestamp: now,
            finished: now,
            payload,
        }
    }

    fn welch(bins: usize, rate: f64, kind: WindowKind) -> Welch {
        Welch::new(
            bins,
            rate,
            &Window::new(kind, None),
            Detrend::None,
            0.5,
            FftBackend::Auto,
        )
    }

    fn finish_single(welch: &Welch, spec: HopSpec, samples: &[Sample], finish: Finish) -> Spectrum {
        let mut scratch = welch.scratch();
        let partial = welch.buffer_psd(samples, &mut scratch);
        let mut acc = SpectrumAccumulator::new(0, spec, 1);
        let now = Utc::now();
        assert!(acc.contribute(0, partial, now, now));
        match acc.finalize(finish) {
            HopResult::Ready(s) => s,
            other => panic!("{other:?}"),
        }
    }

    fn argmax(values: &[f64]) -> usize {
        values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0
    }

    #[test]
    fn pure_tone_lands_in_expected_bin() {
        let (rate, bins, center) = (1.0e6, 64, 100.0e6);
        let spec = hop(0, center, rate, bins);
        let welch = welch(bins, rate, WindowKind::Hann);
        let spectrum = finish_single(&welch, spec.clone(), &tone(250.0e3, rate, 4096), Finish::default());
        let peak = argmax(&spectrum.values);
        // 250 kHz above center at 15.625 kHz per bin
        assert_eq!(peak, 32 + 16);
        assert!((spectrum.frequencies().nth(peak).unwrap() - 100.25e6).abs() < spec.bin_size());
        assert_eq!(spectrum.min_freq, center - 0.5e6);
        assert_eq!(spectrum.max_freq, center + 0.5e6);
    }

    #[test]
    fn negative_offset_tone() {
        let (rate, bins) = (2.0e6, 100);
        let spec = hop(0, 0.0, rate, bins);
        let welch = welch(bins, rate, WindowKind::Hamming);
        let spectrum = finish_single(&welch, spec, &tone(-300.0e3, rate, 5000), Finish::default());
        assert_eq!(argmax(&spectrum.values), 50 - 15);
    }

    #[test]
    fn welch_normalization() {
        // Boxcar, unit DC: |X0|^2 = N^2, divided by fs * N
        let bins = 16;
        let spec = hop(0, 0.0, 1.0, bins);
        let welch = welch(bins, 1.0, WindowKind::Boxcar);
        let samples = vec![Sample::new(1.0, 0.0); 64];
        let linear = Finish {
            remove_dc: false,
            linear: true,
        };
        let spectrum = finish_single(&welch, spec, &samples, linear);
        assert!((spectrum.values[bins / 2] - 16.0).abs() < 1e-9);
        assert!(spectrum.segments == 7);
        let others: f64 = spectrum
            .values
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != bins / 2)
            .map(|(_, v)| v)
            .sum();
        assert!(others < 1e-12);
    }

    #[test]
    fn remove_dc_interpolates_center() {
        let mut values = vec![1.0, 2.0, 100.0, 4.0, 5.0];
        remove_dc(&mut values);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut short = vec![1.0, 9.0];
        remove_dc(&mut short);
        assert_eq!(short, vec![1.0, 9.0]);
    }

    #[test]
    fn non_finite_segment_is_skipped() {
        let bins = 8;
        let welch = Welch::new(
            bins,
            1.0,
            &Window::new(WindowKind::Hann, None),
            Detrend::None,
            0.0,
            FftBackend::Scalar,
        );
        let mut samples = tone(0.1, 1.0, 32);
        samples[9] = Sample::new(f32::NAN, 0.0);
        let partial = welch.buffer_psd(&samples, &mut welch.scratch());
        assert_eq!(partial.segments, 3);
        assert_eq!(partial.errors, 1);
        assert!(partial.power.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn short_buffer_yields_no_segments() {
        let welch = welch(64, 1.0e6, WindowKind::Hann);
        let partial = welch.buffer_psd(&tone(1.0e3, 1.0e6, 63), &mut welch.scratch());
        assert_eq!(partial.segments, 0);
        let mut acc = SpectrumAccumulator::new(0, hop(0, 0.0, 1.0e6, 64), 1);
        let now = Utc::now();
        assert!(acc.contribute(0, partial, now, now));
        assert!(matches!(
            acc.finalize(Finish::default()),
            HopResult::Failed {
                cause: HopFailure::NoSegments,
                ..
            }
        ));
    }

    #[test]
    fn merge_order_does_not_depend_on_arrival() {
        let (rate, bins) = (1.0e6, 32);
        let welch = welch(bins, rate, WindowKind::BlackmanHarris);
        let mut scratch = welch.scratch();
        let partials: Vec<Partial> = (0..5)
            .map(|i| welch.buffer_psd(&tone(10.0e3 * i as f64, rate, 1024), &mut scratch))
            .collect();
        let now = Utc::now();
        let mut forward = SpectrumAccumulator::new(0, hop(0, 0.0, rate, bins), 5);
        let mut backward = SpectrumAccumulator::new(0, hop(0, 0.0, rate, bins), 5);
        for (i, p) in partials.iter().enumerate() {
            forward.contribute(i, p.clone(), now, now);
        }
        for (i, p) in partials.iter().enumerate().rev() {
            backward.contribute(i, p.clone(), now, now);
        }
        assert_eq!(
            forward.finalize(Finish::default()),
            backward.finalize(Finish::default())
        );
    }

    #[test]
    fn completes_exactly_once() {
        let mut acc = SpectrumAccumulator::new(0, hop(0, 0.0, 1.0, 4), 2);
        let partial = Partial {
            power: vec![1.0; 4],
            segments: 1,
            errors: 0,
        };
        let now = Utc::now();
        assert!(!acc.contribute(0, partial.clone(), now, now));
        assert!(acc.contribute(1, partial.clone(), now, now));
        assert!(!acc.truncate(2, HopFailure::Cancelled));
    }

    #[test]
    fn truncated_hop_fails_after_inflight_buffers() {
        let table = AccumulatorTable::new(Finish::default());
        let spec = hop(3, 0.0, 1.0e6, 16);
        table.open(7, &spec, 4);
        let welch = welch(16, 1.0e6, WindowKind::Hann);
        let mut scratch = welch.scratch();
        let first = buffer(7, 3, 0, tone(1.0e3, 1.0e6, 64));
        let second = buffer(7, 3, 1, tone(1.0e3, 1.0e6, 64));
        assert!(table
            .contribute(&first, welch.buffer_psd(&first.payload, &mut scratch))
            .is_none());
        // Two buffers made it onto the queue before the device gave up
        assert!(table.truncate(7, 3, 2, HopFailure::Cancelled).is_none());
        let result = table
            .contribute(&second, welch.buffer_psd(&second.payload, &mut scratch))
            .unwrap();
        assert_eq!(
            result,
            HopResult::Failed {
                run: 7,
                hop_index: 3,
                cause: HopFailure::Cancelled
            }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn truncate_with_nothing_enqueued_fails_immediately() {
        let table = AccumulatorTable::new(Finish::default());
        table.open(0, &hop(0, 0.0, 1.0, 8), 3);
        let cause = HopFailure::Device(crate::error::DeviceError::Stream("gone".to_owned()));
        let result = table.truncate(0, 0, 0, cause.clone()).unwrap();
        assert_eq!(result.key(), (0, 0));
        assert!(matches!(result, HopResult::Failed { cause: c, .. } if c == cause));
    }

    #[test]
    fn pool_finalizes_every_hop() {
        let (rate, bins, repeats) = (1.0e6, 64, 3);
        let stats = Arc::new(Stats::default());
        let stage = Arc::new(PsdStage::new(
            welch(bins, rate, WindowKind::Hann),
            Finish::default(),
            Arc::clone(&stats),
        ));
        let (buf_tx, buf_rx) = bounded(4);
        let (res_tx, res_rx) = unbounded();
        let handles = spawn_workers(&stage, 3, &buf_rx, &res_tx).unwrap();
        drop(res_tx);
        drop(buf_rx);
        for h in 0..4 {
            stage
                .table
                .open(0, &hop(h, 100.0e6 + h as f64 * rate, rate, bins), repeats);
            for r in 0..repeats {
                buf_tx
                    .send(buffer(0, h, r, tone(125.0e3, rate, 1024)))
                    .unwrap();
            }
        }
        drop(buf_tx);
        for h in handles {
            h.join().unwrap();
        }
        let mut results: Vec<HopResult> = res_rx.iter().collect();
        results.sort_by_key(HopResult::key);
        assert_eq!(results.len(), 4);
        for (h, result) in results.iter().enumerate() {
            let HopResult::Ready(s) = result else {
                panic!("{result:?}");
            };
            assert_eq!(s.hop_index, h);
            assert_eq!(argmax(&s.values), 32 + 8);
        }
        assert_eq!(stats.snapshot().buffers_processed, 12);
        assert!(stage.table.is_empty());
    }
}

//! Turns an averaging target into concrete read sizes for the acquisition loop

use tracing::{info, warn};

use crate::{config::AveragingTarget, error::ConfigError, plan::time_to_repeats};

/// Everything the sizer needs to know
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferRequest {
    pub averaging: AveragingTarget,
    /// Hops in the plan, used to split a total integration time
    pub hops: usize,
    pub sample_rate: f64,
    pub bins: usize,
    /// Welch overlap between successive segments
    pub fft_overlap: f64,
    /// 0 uses `device_buffer_size`
    pub base_buffer_size: usize,
    /// 0 is auto (base * 100), -1 is unlimited
    pub max_buffer_size: i64,
    /// Transfer size the radio prefers
    pub device_buffer_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferPlan {
    /// Samples per read
    pub buffer_size: usize,
    /// Reads per hop
    pub buffer_repeats: usize,
    /// Requested number of bin-sized spectra per hop
    pub repeats: usize,
    /// Bin-sized spectra actually covered by the reads
    pub effective_repeats: usize,
    /// Distance between the starts of successive Welch segments
    pub stride: usize,
    /// Welch segments computed from each buffer
    pub segments_per_buffer: usize,
    /// Seconds of signal acquired per hop
    pub acquisition_time: f64,
}

/// Welch step for `bins` long segments overlapping by `fft_overlap`
pub fn segment_stride(bins: usize, fft_overlap: f64) -> usize {
    let overlap_bins = (bins as f64 * fft_overlap).floor() as usize;
    (bins - overlap_bins.min(bins - 1)).max(1)
}

fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}

pub fn size(req: &BufferRequest) -> Result<BufferPlan, ConfigError> {
    let BufferRequest {
        averaging,
        hops,
        sample_rate,
        bins,
        fft_overlap,
        ..
    } = *req;
    if bins == 0 {
        return Err(ConfigError::NoBins);
    }
    let repeats = match averaging {
        AveragingTarget::Repeats(0) => return Err(ConfigError::NoRepeats),
        AveragingTarget::Repeats(n) => n,
        AveragingTarget::Time(t) => time_to_repeats(sample_rate, bins, t),
        AveragingTarget::TotalTime(t) => time_to_repeats(sample_rate, bins, t / hops.max(1) as f64),
    };

    let stride = segment_stride(bins, fft_overlap);
    let segments = (repeats * bins).div_ceil(stride);
    let samples = (segments * stride).max(bins);

    let base = match req.base_buffer_size {
        0 => req.device_buffer_size,
        n => n,
    };
    if base == 0 {
        return Err(ConfigError::BufferSize("base buffer size is zero".to_owned()));
    }

    let mut buffer_size = round_up(samples, base);
    let max_buffer_size = match req.max_buffer_size {
        -1 => None,
        0 => Some(base * 100),
        n if n > 0 => {
            let n = n as usize;
            // Never exceed the cap, stay on a whole number of base transfers when possible
            Some(if n >= base { n / base * base } else { n })
        }
        n => {
            return Err(ConfigError::BufferSize(format!(
                "max buffer size {n} (use -1 for unlimited)"
            )))
        }
    };

    let mut buffer_repeats = 1;
    if let Some(max) = max_buffer_size {
        if max < bins {
            return Err(ConfigError::BufferSize(format!(
                "max buffer size {max} can't hold a single {bins} bin segment"
            )));
        }
        if buffer_size > max {
            warn!("Required buffer size ({buffer_size}) will be shrunk to max_buffer_size ({max})!");
            buffer_repeats = buffer_size.div_ceil(max);
            buffer_size = max;
        }
    }

    let total = buffer_size * buffer_repeats;
    let plan = BufferPlan {
        buffer_size,
        buffer_repeats,
        repeats,
        effective_repeats: total / bins,
        stride,
        segments_per_buffer: (buffer_size - bins) / stride + 1,
        acquisition_time: total as f64 / sample_rate,
    };

    info!("repeats: {repeats}");
    info!(
        "samples: {samples} (time: {:.5} s)",
        samples as f64 / sample_rate
    );
    match max_buffer_size {
        Some(max) => info!(
            "max_buffer_size (samples): {max} (repeats: {:.2}, time: {:.5} s)",
            max as f64 / bins as f64,
            max as f64 / sample_rate
        ),
        None => info!("max_buffer_size (samples): UNLIMITED"),
    }
    info!(
        "buffer_size (samples): {buffer_size} (repeats: {:.2}, time: {:.5} s)",
        buffer_size as f64 / bins as f64,
        buffer_size as f64 / sample_rate
    );
    info!("buffer_repeats: {buffer_repeats}");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;

    fn request(repeats: usize, bins: usize, base: usize, max: i64) -> BufferRequest {
        BufferRequest {
            averaging: AveragingTarget::Repeats(repeats),
            hops: 1,
            sample_rate: 2e6,
            bins,
            fft_overlap: 0.5,
            base_buffer_size: base,
            max_buffer_size: max,
            device_buffer_size: 16384,
        }
    }

    #[test]
    fn stride() {
        assert_eq!(segment_stride(512, 0.5), 256);
        assert_eq!(segment_stride(512, 0.0), 512);
        assert_eq!(segment_stride(1, 0.5), 1);
        assert_eq!(segment_stride(4, 0.99), 1);
    }

    #[test]
    fn fits_in_one_buffer() {
        let plan = size(&request(100, 512, 0, 0)).unwrap();
        // 51200 samples rounded up to 16384 multiples
        assert_eq!(plan.buffer_size, 65536);
        assert_eq!(plan.buffer_repeats, 1);
        assert_eq!(plan.effective_repeats, 128);
        assert_eq!(plan.segments_per_buffer, 255);
    }

    #[test]
    fn shrinks_to_max_and_repeats() {
        let plan = size(&request(1600, 512, 16384, 100_000)).unwrap();
        assert_eq!(plan.buffer_size, 98304);
        assert_eq!(plan.buffer_repeats, 9);
        assert!(plan.buffer_size * plan.buffer_repeats >= 1600 * 512);
    }

    #[test]
    fn unlimited() {
        let plan = size(&request(1600, 512, 16384, -1)).unwrap();
        assert_eq!(plan.buffer_repeats, 1);
        assert_eq!(plan.buffer_size, 819200);
    }

    #[test]
    fn total_time_is_split_over_hops() {
        let mut req = request(1, 500, 1000, -1);
        req.averaging = AveragingTarget::TotalTime(1.0);
        req.hops = 4;
        let plan = size(&req).unwrap();
        assert_eq!(plan.repeats, 1000);
        assert!((plan.acquisition_time - 0.25).abs() < 1e-9);
    }

    #[test]
    fn cap_below_one_segment() {
        assert!(size(&request(10, 4096, 1024, 2048)).is_err());
    }

    #[test]
    fn randomized_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let bins = rng.gen_range(1..8192);
            let repeats = rng.gen_range(1..5000);
            let base = rng.gen_range(0..65536);
            let max = match rng.gen_range(0..4) {
                0 => -1,
                1 => 0,
                _ => rng.gen_range(1..2_000_000),
            };
            let mut req = request(repeats, bins, base, max);
            req.fft_overlap = rng.gen_range(0.0..0.95);
            let Ok(plan) = size(&req) else {
                continue;
            };
            assert!(plan.effective_repeats >= repeats);
            assert!(
                plan.buffer_size * plan.buffer_repeats >= plan.bins_covered(bins),
                "{plan:?}"
            );
            if max > 0 {
                assert!(plan.buffer_size as i64 <= max);
            }
            assert!(plan.buffer_size >= bins);
        }
    }

    impl BufferPlan {
        fn bins_covered(&self, bins: usize) -> usize {
            bins * self.effective_repeats
        }
    }
}

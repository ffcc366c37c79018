//! Frequency hopping plan: which center frequencies to visit and how each hop's
//! spectrum is trimmed before the hops are stitched together.

use tracing::{debug, info, warn};

use crate::{
    config::{FreqSpec, Resolution, RunContext},
    error::ConfigError,
};

/// Float slop tolerated when checking for whole bin counts
const EPS: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct HopSpec {
    pub index: usize,
    pub center_frequency: f64,
    pub sample_rate: f64,
    pub bin_count: usize,
    pub crop_fraction: f64,
    pub overlap_fraction: f64,
}

impl HopSpec {
    pub fn bin_size(&self) -> f64 {
        self.sample_rate / self.bin_count as f64
    }

    /// Bins removed from each edge
    pub fn crop_bins(&self) -> usize {
        (self.crop_fraction * self.bin_count as f64 / 2.0).round() as usize
    }

    /// Bins left after cropping
    pub fn kept_bins(&self) -> usize {
        self.bin_count - 2 * self.crop_bins()
    }

    /// Frequency of bin `i` of the (fft-shifted) full hop spectrum
    pub fn bin_frequency(&self, i: usize) -> f64 {
        let offset = i as f64 - (self.bin_count / 2) as f64;
        self.center_frequency + offset * self.bin_size()
    }

    /// The band this hop covers after cropping: `[low, high)`.
    ///
    /// In overlap mode this is the full band, shared in part with neighbours.
    pub fn band(&self) -> (f64, f64) {
        let crop = self.crop_bins();
        let low = self.bin_frequency(crop);
        (low, low + self.kept_bins() as f64 * self.bin_size())
    }

    /// Bins trimmed from each edge when stitching: the crop, or half the
    /// bins shared with a neighbour in overlap mode
    pub fn stitch_bins(&self) -> usize {
        let fraction = self.crop_fraction.max(self.overlap_fraction);
        (fraction * self.bin_count as f64 / 2.0).round() as usize
    }

    /// The slice of this hop that ends up in the stitched spectrum: `[low, high)`
    pub fn stitched_band(&self) -> (f64, f64) {
        let trim = self.stitch_bins();
        let low = self.bin_frequency(trim);
        let kept = self.bin_count - 2 * trim;
        (low, low + kept as f64 * self.bin_size())
    }
}

/// Ordered, immutable set of hops shared by every stage
#[derive(Clone, Debug, PartialEq)]
pub struct HopPlan {
    hops: Vec<HopSpec>,
    pub hop_size: f64,
}

impl HopPlan {
    pub fn hops(&self) -> &[HopSpec] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HopSpec> {
        self.hops.get(index)
    }

    pub fn bin_count(&self) -> usize {
        self.hops.first().map_or(0, |h| h.bin_count)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HopSpec> {
        self.hops.iter()
    }
}

/// Return the nearest frequency that is a whole number of bins
pub fn nearest_freq(freq: f64, bin_size: f64) -> f64 {
    (freq / bin_size).round() * bin_size
}

/// Convert a bin size in Hz to a number of FFT bins
pub fn bin_size_to_bins(sample_rate: f64, bin_size: f64) -> usize {
    (sample_rate / bin_size - EPS).ceil().max(0.0) as usize
}

/// Round the number of FFT bins up to an even number or a power of two
pub fn nearest_bins(bins: usize, even: bool, pow2: bool) -> usize {
    if pow2 && !bins.is_power_of_two() {
        let rounded = bins.next_power_of_two();
        warn!("number of FFT bins should be power of two, changing to {rounded}");
        rounded
    } else if even && bins % 2 != 0 {
        let rounded = bins + 1;
        warn!("number of FFT bins should be even, changing to {rounded}");
        rounded
    } else {
        bins
    }
}

/// Round a crop/overlap fraction so it covers an even number of bins.
///
/// An even count splits cleanly between the two edges of a hop.
pub fn nearest_overlap(overlap: f64, bins: usize) -> f64 {
    let overlap_bins = overlap * bins as f64;
    let even_bins = ((overlap_bins - EPS) / 2.0).ceil().max(0.0) * 2.0;
    if (even_bins - overlap_bins).abs() > EPS {
        let rounded = even_bins / bins as f64;
        warn!(
            "number of overlapping FFT bins should be even, changing overlap/crop factor to {rounded:.5}"
        );
        rounded
    } else {
        overlap
    }
}

/// Number of bin-sized spectra covering `time` seconds
pub fn time_to_repeats(sample_rate: f64, bins: usize, time: f64) -> usize {
    ((sample_rate * time) / bins as f64 - EPS).ceil().max(1.0) as usize
}

/// Resolve the requested resolution to a concrete bin count
pub fn resolve_bins(ctx: &RunContext) -> Result<usize, ConfigError> {
    let rate = ctx.device.sample_rate;
    let bins = match ctx.resolution {
        Resolution::Bins(bins) => bins,
        Resolution::BinSize(size) if size > rate => {
            return Err(ConfigError::BinSizeTooLarge {
                bin_size: size,
                sample_rate: rate,
            })
        }
        Resolution::BinSize(size) => bin_size_to_bins(rate, size),
    };
    if bins < 1 {
        return Err(ConfigError::NoBins);
    }
    Ok(nearest_bins(bins, ctx.even, ctx.pow2))
}

/// Build the hop plan for a session
pub fn plan_session(ctx: &RunContext) -> Result<HopPlan, ConfigError> {
    let bins = resolve_bins(ctx)?;
    plan(
        ctx.freq,
        bins,
        ctx.device.sample_rate,
        ctx.crop,
        ctx.hop_overlap,
    )
}

/// Lay out hops so that their (cropped) bands tile `freq` with no gaps.
///
/// `crop` and `overlap` both shrink the hop spacing to `(1 - f) * sample_rate`.
/// Crop reports the trimmed band per hop, overlap the full shared one.
pub fn plan(
    freq: FreqSpec,
    bins: usize,
    sample_rate: f64,
    crop: f64,
    overlap: f64,
) -> Result<HopPlan, ConfigError> {
    if bins < 1 {
        return Err(ConfigError::NoBins);
    }
    if !(sample_rate > 0.0) {
        return Err(ConfigError::SampleRate(sample_rate));
    }
    if crop > 0.0 && overlap > 0.0 {
        return Err(ConfigError::CropAndOverlap);
    }
    for (name, value) in [("crop", crop), ("overlap", overlap)] {
        if !(0.0..1.0).contains(&value) {
            return Err(ConfigError::Fraction {
                name,
                value: value * 100.0,
            });
        }
    }
    let (min_freq, max_freq) = freq.bounds();
    if min_freq > max_freq {
        return Err(ConfigError::InvertedRange {
            low: min_freq,
            high: max_freq,
        });
    }

    let fraction = nearest_overlap(crop.max(overlap), bins);
    let (crop, overlap) = if crop > 0.0 {
        (fraction, 0.0)
    } else {
        (0.0, fraction)
    };
    let fraction_bins = (fraction * bins as f64).round() as usize;
    if fraction_bins >= bins {
        return Err(ConfigError::CropTooLarge {
            crop_bins: fraction_bins,
            bins,
        });
    }

    let bin_size = sample_rate / bins as f64;
    let sample_rate_crop = (1.0 - fraction) * sample_rate;
    let freq_range = max_freq - min_freq;
    let hopping = freq_range >= sample_rate_crop;
    let hop_size = nearest_freq(sample_rate_crop, bin_size);
    let hops = if hopping {
        ((freq_range / hop_size) - EPS).ceil().max(1.0) as usize
    } else {
        1
    };
    // Odd bin counts put the extra bin above center
    let odd_shift = if bins % 2 == 1 { bin_size / 2.0 } else { 0.0 };
    let min_center_freq = if hopping {
        min_freq + hop_size / 2.0 - odd_shift
    } else {
        min_freq + freq_range / 2.0 - odd_shift
    };

    let hops: Vec<HopSpec> = (0..hops)
        .map(|index| HopSpec {
            index,
            center_frequency: min_center_freq + index as f64 * hop_size,
            sample_rate,
            bin_count: bins,
            crop_fraction: crop,
            overlap_fraction: overlap,
        })
        .collect();
    let plan = HopPlan { hops, hop_size };
    log_plan(&plan, fraction, freq_range, hopping);
    Ok(plan)
}

fn log_plan(plan: &HopPlan, fraction: f64, freq_range: f64, hopping: bool) {
    let (Some(first), Some(last)) = (plan.hops.first(), plan.hops.last()) else {
        return;
    };
    info!("overlap: {fraction:.5}");
    info!("bin_size: {:.2} Hz", first.bin_size());
    info!("bins: {}", first.bin_count);
    info!("bins (after crop): {}", first.kept_bins());
    info!("sample_rate: {:.3} MHz", first.sample_rate / 1e6);
    info!(
        "sample_rate (after crop): {:.3} MHz",
        (1.0 - fraction) * first.sample_rate / 1e6
    );
    info!("freq_range: {:.3} MHz", freq_range / 1e6);
    info!("hopping: {}", if hopping { "YES" } else { "NO" });
    info!("hop_size: {:.3} MHz", plan.hop_size / 1e6);
    info!("hops: {}", plan.len());
    info!("min_center_freq: {:.3} MHz", first.center_frequency / 1e6);
    info!("max_center_freq: {:.3} MHz", last.center_frequency / 1e6);
    info!("min_freq (after crop): {:.3} MHz", first.band().0 / 1e6);
    info!("max_freq (after crop): {:.3} MHz", last.band().1 / 1e6);

    debug!("Frequency hops table:");
    debug!("  {:8}      {:8}      {:8}", "Min:", "Center:", "Max:");
    for hop in plan.iter() {
        debug!(
            "  {:8.3} MHz  {:8.3} MHz  {:8.3} MHz",
            (hop.center_frequency - hop.sample_rate / 2.0) / 1e6,
            hop.center_frequency / 1e6,
            (hop.center_frequency + hop.sample_rate / 2.0) / 1e6,
        );
    }
}

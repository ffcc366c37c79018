//! Session-wide configuration.
//!
//! A [`RunContext`] is built once per invocation, validated, and then only ever
//! read. It's shared between the acquisition loop, the PSD workers, the
//! aggregator and the writer behind an `Arc`.

use std::{str::FromStr, thread, time::Duration};

use crate::{
    error::ConfigError,
    f_engine::FftBackend,
    radio::Gain,
    window::{Detrend, Window, WindowKind},
};

/// Convert a string with an optional k, M, G or T multiplier to a float
pub fn float_with_multiplier(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (num, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1e3),
        Some('M') => (&s[..s.len() - 1], 1e6),
        Some('G') => (&s[..s.len() - 1], 1e9),
        Some('T') => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };
    match num.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n * multiplier),
        _ => Err(format!("`{s}` is not a finite number")),
    }
}

/// What to scan
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FreqSpec {
    Single(f64),
    Range { low: f64, high: f64 },
}

impl FreqSpec {
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            FreqSpec::Single(f) => (f, f),
            FreqSpec::Range { low, high } => (low, high),
        }
    }
}

impl FromStr for FreqSpec {
    type Err = String;

    /// `FREQ` or `LOW:HIGH`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((low, high)) => Ok(FreqSpec::Range {
                low: float_with_multiplier(low)?,
                high: float_with_multiplier(high)?,
            }),
            None => Ok(FreqSpec::Single(float_with_multiplier(s)?)),
        }
    }
}

/// Frequency resolution, either directly or as a bin width
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Resolution {
    Bins(usize),
    BinSize(f64),
}

/// How much to average per hop
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AveragingTarget {
    /// Number of bin-sized spectra
    Repeats(usize),
    /// Integration time per hop
    Time(f64),
    /// Integration time for the whole sweep, split evenly over hops
    TotalTime(f64),
}

/// How many times to sweep the plan
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunMode {
    Runs(u64),
    Continuous,
    /// Keep sweeping until this much time has passed (checked between runs)
    Elapsed(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// One CSV-like text line per hop
    RtlPower,
    /// Commented block of `frequency power` lines per hop
    RtlPowerFftw,
    /// Packed little endian header + f32 values
    SoapyPowerBin,
    /// Fixed native endian header + f32 values
    Raw,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rtl_power" => Ok(Self::RtlPower),
            "rtl_power_fftw" => Ok(Self::RtlPowerFftw),
            "soapy_power_bin" => Ok(Self::SoapyPowerBin),
            "raw" => Ok(Self::Raw),
            _ => Err(ConfigError::UnknownOption {
                kind: "output format",
                value: s.to_owned(),
            }),
        }
    }
}

/// Everything handed to the radio before streaming
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceParams {
    pub args: String,
    pub channel: usize,
    pub antenna: Option<String>,
    pub sample_rate: f64,
    /// 0 leaves the filter at the driver default
    pub bandwidth: f64,
    pub ppm: i32,
    pub gain: Gain,
    pub force_sample_rate: bool,
    pub force_bandwidth: bool,
    pub settings: Vec<(String, String)>,
    pub tune_delay: Duration,
    pub reset_stream: bool,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            args: String::new(),
            channel: 0,
            antenna: None,
            sample_rate: 2.0e6,
            bandwidth: 0.0,
            ppm: 0,
            gain: Gain::Manual(37.2),
            force_sample_rate: false,
            force_bandwidth: false,
            settings: Vec::new(),
            tune_delay: Duration::ZERO,
            reset_stream: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunContext {
    pub freq: FreqSpec,
    pub resolution: Resolution,
    /// Round bins up to an even number
    pub even: bool,
    /// Round bins up to a power of two
    pub pow2: bool,
    pub averaging: AveragingTarget,
    pub run_mode: RunMode,
    pub device: DeviceParams,
    /// Fraction of each hop's band thrown away (half at each edge)
    pub crop: f64,
    /// Fraction by which adjacent hops' bands overlap
    pub hop_overlap: f64,
    pub window: Window,
    pub detrend: Detrend,
    pub remove_dc: bool,
    /// Emit linear power instead of dB
    pub linear: bool,
    /// Overlap between successive Welch segments inside one buffer
    pub fft_overlap: f64,
    pub fft_backend: FftBackend,
    /// 0 lets the device decide
    pub base_buffer_size: usize,
    /// 0 is auto (base * 100), -1 is unlimited
    pub max_buffer_size: i64,
    /// 0 uses every available core
    pub max_threads: usize,
    /// 0 is auto (threads * 10), -1 is unlimited
    pub max_queue_size: i64,
    /// 0 is auto, -1 is unlimited
    pub max_output_queue_size: i64,
    pub output_format: OutputFormat,
    /// How long an out-of-order hop may wait for its predecessor
    pub stall_timeout: Duration,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            freq: FreqSpec::Single(1_420_405_752.0),
            resolution: Resolution::Bins(512),
            even: false,
            pow2: false,
            averaging: AveragingTarget::Repeats(1600),
            run_mode: RunMode::Runs(1),
            device: DeviceParams::default(),
            crop: 0.0,
            hop_overlap: 0.0,
            window: Window::new(WindowKind::Hann, None),
            detrend: Detrend::None,
            remove_dc: false,
            linear: false,
            fft_overlap: 0.5,
            fft_backend: FftBackend::Auto,
            base_buffer_size: 0,
            max_buffer_size: 0,
            max_threads: 0,
            max_queue_size: 0,
            max_output_queue_size: 0,
            output_format: OutputFormat::RtlPower,
            stall_timeout: Duration::from_secs(10),
        }
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Fraction {
            name,
            value: value * 100.0,
        })
    }
}

impl RunContext {
    /// Check every invariant that doesn't need the device
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (low, high) = self.freq.bounds();
        if let Some(f) = [low, high].into_iter().find(|f| !f.is_finite()) {
            return Err(ConfigError::Frequency(f));
        }
        if let FreqSpec::Range { low, high } = self.freq {
            if low > high {
                return Err(ConfigError::InvertedRange { low, high });
            }
        }
        let rate = self.device.sample_rate;
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(ConfigError::SampleRate(rate));
        }
        match self.resolution {
            Resolution::Bins(0) => return Err(ConfigError::NoBins),
            Resolution::BinSize(size) if size <= 0.0 => {
                return Err(ConfigError::NotPositive("bin size"))
            }
            Resolution::BinSize(size) if size > rate => {
                return Err(ConfigError::BinSizeTooLarge {
                    bin_size: size,
                    sample_rate: rate,
                })
            }
            _ => {}
        }
        if self.crop > 0.0 && self.hop_overlap > 0.0 {
            return Err(ConfigError::CropAndOverlap);
        }
        check_fraction("crop", self.crop)?;
        check_fraction("overlap", self.hop_overlap)?;
        check_fraction("FFT overlap", self.fft_overlap)?;
        match self.averaging {
            AveragingTarget::Repeats(0) => return Err(ConfigError::NoRepeats),
            AveragingTarget::Time(t) | AveragingTarget::TotalTime(t) if t <= 0.0 => {
                return Err(ConfigError::NotPositive("integration time"))
            }
            _ => {}
        }
        if let RunMode::Elapsed(d) = self.run_mode {
            if d.is_zero() {
                return Err(ConfigError::NotPositive("elapsed time"));
            }
        }
        if let Gain::Manual(db) = self.device.gain {
            if !db.is_finite() {
                return Err(ConfigError::NotPositive("gain"));
            }
        }
        if self.max_buffer_size < -1 {
            return Err(ConfigError::BufferSize(format!(
                "max buffer size {} (use -1 for unlimited)",
                self.max_buffer_size
            )));
        }
        if self.max_queue_size < -1 || self.max_output_queue_size < -1 {
            return Err(ConfigError::BufferSize(
                "queue sizes must be -1, 0 or positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        match self.max_threads {
            0 => thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }

    /// Acquisition queue capacity, `None` when unbounded
    pub fn queue_capacity(&self) -> Option<usize> {
        match self.max_queue_size {
            -1 => None,
            0 => Some(self.worker_threads() * 10),
            n => Some(n as usize),
        }
    }

    /// Output queue capacity, `None` when unbounded
    pub fn output_queue_capacity(&self) -> Option<usize> {
        match self.max_output_queue_size {
            -1 => None,
            0 => Some(100),
            n => Some(n as usize),
        }
    }

    /// Runs to perform, `None` when open-ended
    pub fn run_limit(&self) -> Option<u64> {
        match self.run_mode {
            RunMode::Runs(n) => Some(n.max(1)),
            RunMode::Continuous | RunMode::Elapsed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers() {
        assert_eq!(float_with_multiplier("88M").unwrap(), 88.0e6);
        assert_eq!(float_with_multiplier("2.56M").unwrap(), 2.56e6);
        assert_eq!(float_with_multiplier("500k").unwrap(), 500.0e3);
        assert_eq!(float_with_multiplier("1.2G").unwrap(), 1.2e9);
        assert_eq!(float_with_multiplier("1420405752").unwrap(), 1_420_405_752.0);
        assert!(float_with_multiplier("fast").is_err());
        assert!(float_with_multiplier("inf").is_err());
        assert!(float_with_multiplier("nanM").is_err());
    }

    #[test]
    fn freq_spec() {
        assert_eq!(
            "88M:98M".parse::<FreqSpec>().unwrap(),
            FreqSpec::Range {
                low: 88.0e6,
                high: 98.0e6
            }
        );
        assert_eq!("100M".parse::<FreqSpec>().unwrap(), FreqSpec::Single(100.0e6));
        assert!("nan".parse::<FreqSpec>().is_err());
        assert!("88M:inf".parse::<FreqSpec>().is_err());
    }

    #[test]
    fn default_context_is_valid() {
        RunContext::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_options() {
        let crop_and_overlap = RunContext {
            crop: 0.1,
            hop_overlap: 0.1,
            ..RunContext::default()
        };
        assert_eq!(
            crop_and_overlap.validate(),
            Err(ConfigError::CropAndOverlap)
        );
        let full_crop = RunContext {
            crop: 1.0,
            ..RunContext::default()
        };
        assert!(matches!(
            full_crop.validate(),
            Err(ConfigError::Fraction { name: "crop", .. })
        ));
        let full_overlap = RunContext {
            hop_overlap: 1.0,
            ..RunContext::default()
        };
        assert!(full_overlap.validate().is_err());
        let wide_bins = RunContext {
            resolution: Resolution::BinSize(3.0e6),
            ..RunContext::default()
        };
        assert!(matches!(
            wide_bins.validate(),
            Err(ConfigError::BinSizeTooLarge { .. })
        ));
        let inverted = RunContext {
            freq: FreqSpec::Range {
                low: 2.0e6,
                high: 1.0e6,
            },
            ..RunContext::default()
        };
        assert!(inverted.validate().is_err());
        let not_finite = RunContext {
            freq: FreqSpec::Single(f64::NAN),
            ..RunContext::default()
        };
        assert!(matches!(
            not_finite.validate(),
            Err(ConfigError::Frequency(f)) if f.is_nan()
        ));
    }

    #[test]
    fn queue_capacities() {
        let ctx = RunContext {
            max_threads: 3,
            ..RunContext::default()
        };
        assert_eq!(ctx.queue_capacity(), Some(30));
        let unbounded = RunContext {
            max_queue_size: -1,
            ..ctx
        };
        assert_eq!(unbounded.queue_capacity(), None);
    }
}

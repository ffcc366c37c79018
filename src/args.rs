//! Argument parsing for running from the command line

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{ArgGroup, Parser};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::{
    config::{
        float_with_multiplier, AveragingTarget, DeviceParams, FreqSpec, OutputFormat, Resolution,
        RunContext, RunMode,
    },
    error::ConfigError,
    exfil::OutputTarget,
    f_engine::FftBackend,
    radio::{DeviceArgs, Gain},
    window::{Detrend, Window, WindowKind},
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Obtain a power spectrum from an SDR by frequency hopping", long_about = None)]
#[clap(group(ArgGroup::new("resolution").args(&["bins", "bin_size"])))]
#[clap(group(ArgGroup::new("averaging").args(&["repeats", "time", "total_time"])))]
#[clap(group(ArgGroup::new("runmode").args(&["endless", "runs", "elapsed"])))]
#[clap(group(ArgGroup::new("gainmode").args(&["gain", "agc"])))]
#[clap(group(ArgGroup::new("hopping").args(&["overlap", "crop"])))]
#[clap(group(ArgGroup::new("binrule").args(&["even", "pow2"])))]
#[clap(group(ArgGroup::new("target").args(&["output", "output_fd"])))]
pub struct Args {
    /// Center frequency or LOW:HIGH range to scan, numbers take a k, M or G suffix
    #[clap(short, long, value_parser = FreqSpec::from_str, default_value = "1420405752")]
    pub freq: FreqSpec,
    /// Number of FFT bins [default: 512]
    #[clap(short, long)]
    pub bins: Option<usize>,
    /// Bin size in Hz, instead of a bin count
    #[clap(short = 'B', long, value_parser = float_with_multiplier)]
    pub bin_size: Option<f64>,
    /// Use only even numbers of FFT bins
    #[clap(long)]
    pub even: bool,
    /// Use only powers of two as number of FFT bins
    #[clap(long)]
    pub pow2: bool,

    /// Number of spectra to average per hop [default: 1600]
    #[clap(short = 'n', long)]
    pub repeats: Option<usize>,
    /// Integration time per hop in seconds
    #[clap(short, long)]
    pub time: Option<f64>,
    /// Integration time of the whole sweep in seconds
    #[clap(short = 'T', long)]
    pub total_time: Option<f64>,

    /// Repeat the measurement until interrupted
    #[clap(short = 'c', long = "continue")]
    pub endless: bool,
    /// Number of measurements [default: 1]
    #[clap(short = 'u', long)]
    pub runs: Option<u64>,
    /// Session duration in seconds
    #[clap(short, long)]
    pub elapsed: Option<f64>,

    /// Device arguments, `driver=tone,...` style
    #[clap(short, long, default_value = "")]
    pub device: String,
    /// RX channel
    #[clap(short = 'C', long, default_value_t = 0)]
    pub channel: usize,
    /// Antenna to select
    #[clap(short = 'A', long)]
    pub antenna: Option<String>,
    /// Sample rate in Hz
    #[clap(short, long, value_parser = float_with_multiplier, default_value = "2M")]
    pub rate: f64,
    /// Filter bandwidth in Hz, 0 keeps the device default
    #[clap(short = 'w', long, value_parser = float_with_multiplier, default_value = "0")]
    pub bandwidth: f64,
    /// Frequency correction in ppm
    #[clap(short, long, default_value_t = 0, allow_hyphen_values = true)]
    pub ppm: i32,
    /// Gain in dB [default: 37.2]
    #[clap(short, long)]
    pub gain: Option<f64>,
    /// Enable automatic gain control
    #[clap(short, long)]
    pub agc: bool,
    /// Extra device settings, `key=value,key=value`
    #[clap(long)]
    pub device_settings: Option<String>,
    /// Allow sample rates the device doesn't advertise
    #[clap(long)]
    pub force_rate: bool,
    /// Allow filter bandwidths the device doesn't advertise
    #[clap(long)]
    pub force_bandwidth: bool,
    /// Seconds to wait after retuning before measuring
    #[clap(long, default_value_t = 0.0)]
    pub tune_delay: f64,
    /// Reset the stream after every retune
    #[clap(long)]
    pub reset_stream: bool,

    /// Percent of overlap between adjacent hops
    #[clap(short, long)]
    pub overlap: Option<f64>,
    /// Percent of each hop's band to crop away
    #[clap(short = 'k', long)]
    pub crop: Option<f64>,

    /// Base buffer size in samples, 0 = device default
    #[clap(short = 's', long, default_value_t = 0)]
    pub buffer_size: usize,
    /// Maximum buffer size in samples, -1 = unlimited, 0 = auto
    #[clap(short = 'S', long, default_value_t = 0, allow_hyphen_values = true)]
    pub max_buffer_size: i64,
    /// Maximum number of PSD threads, 0 = all cores
    #[clap(long, default_value_t = 0)]
    pub max_threads: usize,
    /// Maximum size of the PSD work queue, -1 = unlimited, 0 = auto
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    pub max_queue_size: i64,
    /// Maximum size of the output queue, -1 = unlimited, 0 = auto
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    pub max_output_queue_size: i64,

    /// Linear power values instead of dB
    #[clap(short, long)]
    pub linear: bool,
    /// Interpolate the center bin to cancel DC bias
    #[clap(short = 'R', long)]
    pub remove_dc: bool,
    /// Remove the mean or the linear trend of each segment: no, constant, linear
    #[clap(short = 'D', long, value_parser = Detrend::from_str, default_value = "no")]
    pub detrend: Detrend,
    /// Welch window function
    #[clap(long, value_parser = WindowKind::from_str, default_value = "hann")]
    pub fft_window: WindowKind,
    /// Window shape parameter (tukey alpha, kaiser beta)
    #[clap(long)]
    pub fft_window_shape: Option<f64>,
    /// Percent of overlap between Welch segments
    #[clap(long, default_value_t = 50.0)]
    pub fft_overlap: f64,
    /// FFT implementation: auto, scalar
    #[clap(long, value_parser = FftBackend::from_str, default_value = "auto")]
    pub fft_backend: FftBackend,

    /// Output format: rtl_power, rtl_power_fftw, soapy_power_bin, raw
    #[clap(short = 'F', long, value_parser = OutputFormat::from_str, default_value = "rtl_power")]
    pub format: OutputFormat,
    /// Write to this file instead of stdout
    #[clap(short = 'O', long)]
    pub output: Option<PathBuf>,
    /// Write to an already open file descriptor
    #[clap(long)]
    pub output_fd: Option<i32>,
    /// Seconds a hop may wait for its predecessor before the run is aborted
    #[clap(long, default_value_t = 10.0)]
    pub stall_timeout: f64,

    /// List available devices and exit
    #[clap(long)]
    pub detect: bool,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(Duration::from_secs_f64(value))
    } else {
        Err(ConfigError::NotPositive(name))
    }
}

impl Args {
    pub fn output_target(&self) -> OutputTarget {
        match (&self.output, self.output_fd) {
            (_, Some(fd)) => OutputTarget::Fd(fd),
            (Some(path), None) if path.as_os_str() != "-" => OutputTarget::File(path.clone()),
            _ => OutputTarget::Stdout,
        }
    }
}

impl TryFrom<&Args> for RunContext {
    type Error = ConfigError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        RunContext::from_args(args)
    }
}

impl RunContext {
    /// Resolve the command line into a validated context
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let defaults = RunContext::default();
        let resolution = match (args.bin_size, args.bins) {
            (Some(size), _) => Resolution::BinSize(size),
            (None, Some(bins)) => Resolution::Bins(bins),
            (None, None) => defaults.resolution,
        };
        let averaging = match (args.time, args.total_time, args.repeats) {
            (Some(t), _, _) => AveragingTarget::Time(t),
            (None, Some(t), _) => AveragingTarget::TotalTime(t),
            (None, None, Some(n)) => AveragingTarget::Repeats(n),
            (None, None, None) => defaults.averaging,
        };
        let run_mode = if args.endless {
            RunMode::Continuous
        } else if let Some(limit) = args.elapsed {
            let limit = seconds("elapsed time", limit)?;
            RunMode::Elapsed(limit)
        } else {
            match args.runs {
                Some(0) => return Err(ConfigError::NotPositive("number of runs")),
                Some(n) => RunMode::Runs(n),
                None => defaults.run_mode,
            }
        };
        let gain = match (args.agc, args.gain) {
            (true, Some(_)) => return Err(ConfigError::GainAndAgc),
            (true, None) => Gain::Auto,
            (false, gain) => gain.map_or(defaults.device.gain, Gain::Manual),
        };
        let settings = match &args.device_settings {
            Some(s) => DeviceArgs::parse(s)?.into_pairs(),
            None => Vec::new(),
        };
        let stall_timeout = seconds("stall timeout", args.stall_timeout)?;
        if stall_timeout.is_zero() {
            return Err(ConfigError::NotPositive("stall timeout"));
        }

        let ctx = RunContext {
            freq: args.freq,
            resolution,
            even: args.even,
            pow2: args.pow2,
            averaging,
            run_mode,
            device: DeviceParams {
                args: args.device.clone(),
                channel: args.channel,
                antenna: args.antenna.clone().filter(|a| !a.is_empty()),
                sample_rate: args.rate,
                bandwidth: args.bandwidth,
                ppm: args.ppm,
                gain,
                force_sample_rate: args.force_rate,
                force_bandwidth: args.force_bandwidth,
                settings,
                tune_delay: seconds("tune delay", args.tune_delay)?,
                reset_stream: args.reset_stream,
            },
            crop: args.crop.unwrap_or(0.0) / 100.0,
            hop_overlap: args.overlap.unwrap_or(0.0) / 100.0,
            window: Window::new(args.fft_window, args.fft_window_shape),
            detrend: args.detrend,
            remove_dc: args.remove_dc,
            linear: args.linear,
            fft_overlap: args.fft_overlap / 100.0,
            fft_backend: args.fft_backend,
            base_buffer_size: args.buffer_size,
            max_buffer_size: args.max_buffer_size,
            max_threads: args.max_threads,
            max_queue_size: args.max_queue_size,
            max_output_queue_size: args.max_output_queue_size,
            output_format: args.format,
            stall_timeout,
        };
        ctx.validate()?;
        Ok(ctx)
    }
}

//! Error taxonomy for the whole pipeline

use thiserror::Error;

/// Invalid or conflicting options. Always raised before any device I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("frequency range is inverted: {low} Hz > {high} Hz")]
    InvertedRange { low: f64, high: f64 },
    #[error("frequency must be finite, got {0} Hz")]
    Frequency(f64),
    #[error("sample rate must be positive, got {0} Hz")]
    SampleRate(f64),
    #[error("bin size {bin_size} Hz exceeds sample rate {sample_rate} Hz")]
    BinSizeTooLarge { bin_size: f64, sample_rate: f64 },
    #[error("number of FFT bins must be at least 1")]
    NoBins,
    #[error("crop and overlap are mutually exclusive")]
    CropAndOverlap,
    #[error("{name} must be in [0, 100) percent, got {value}")]
    Fraction { name: &'static str, value: f64 },
    #[error("crop of {crop_bins} bins leaves nothing of a {bins} bin spectrum")]
    CropTooLarge { crop_bins: usize, bins: usize },
    #[error("gain and automatic gain control are mutually exclusive")]
    GainAndAgc,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("averaging target must request at least one repeat")]
    NoRepeats,
    #[error("invalid buffer size: {0}")]
    BufferSize(String),
    #[error("unknown window function `{0}`")]
    UnknownWindow(String),
    #[error("unknown {kind} `{value}`")]
    UnknownOption { kind: &'static str, value: String },
    #[error("sample rate {0} Hz is not supported by the device (use --force-rate to override)")]
    UnsupportedRate(f64),
    #[error("bandwidth {0} Hz is not supported by the device (use --force-bandwidth to override)")]
    UnsupportedBandwidth(f64),
    #[error("invalid device argument `{0}`")]
    DeviceArgs(String),
}

/// Device open / tune / stream failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("no such device driver `{0}`")]
    NoDriver(String),
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("failed to tune to {freq} Hz: {reason}")]
    Tune { freq: f64, reason: String },
    #[error("failed to set {setting}: {reason}")]
    Setting { setting: &'static str, reason: String },
    #[error("stream read timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream ended after {0} samples")]
    EndOfStream(usize),
}

/// A single FFT segment could not be turned into a usable power spectrum
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("segment length {got} does not match transform length {expected}")]
    Length { expected: usize, got: usize },
    #[error("transform produced a non-finite value at bin {0}")]
    NonFinite(usize),
}

/// Why a hop produced no spectrum
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HopFailure {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("no usable FFT segments")]
    NoSegments,
}

/// Conditions that abort only the run they happen in
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("hop {hop} of run {run} never arrived after {waited:?}")]
    QueueStall {
        run: u64,
        hop: usize,
        waited: std::time::Duration,
    },
    #[error("run {run} aborted at hop {hop}: {reason}")]
    Fatal { run: u64, hop: usize, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} run(s) aborted")]
    RunsAborted(u64),
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

impl Error {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 2,
            Error::Device(_) => 3,
            Error::RunsAborted(_) => 4,
            Error::Io(_) | Error::Spawn(_) | Error::Panicked(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

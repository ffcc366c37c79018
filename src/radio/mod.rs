//! The radio the samples come from.
//!
//! Everything downstream of the acquisition loop only sees [`Radio`]. Backends
//! are picked with SoapySDR-style device arguments (`driver=tone,tone=95M`).

pub mod file;
pub mod tone;

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    config::{float_with_multiplier, DeviceParams},
    error::{ConfigError, DeviceError, Error},
    Sample,
};

/// Receive gain
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Gain {
    /// Fixed gain in dB
    Manual(f64),
    /// Automatic gain control
    Auto,
}

/// Inclusive range of supported values
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Capabilities {
    pub sample_rates: Vec<Range>,
    pub bandwidths: Vec<Range>,
    pub gain: Range,
    pub antennas: Vec<String>,
    pub channels: usize,
    /// Stream transfer size the driver prefers, in samples
    pub default_buffer_size: usize,
}

impl Capabilities {
    pub fn supports_rate(&self, rate: f64) -> bool {
        self.sample_rates.iter().any(|r| r.contains(rate))
    }

    pub fn supports_bandwidth(&self, bandwidth: f64) -> bool {
        self.bandwidths.iter().any(|r| r.contains(bandwidth))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver: String,
    pub label: String,
    pub hardware: String,
}

/// Result of a single stream read
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamRead {
    /// Number of samples written to the front of the buffer
    pub samples: usize,
    /// The device reported an overrun since the last read
    pub overflow: bool,
}

pub trait Radio: Send {
    fn info(&self) -> &DeviceInfo;
    fn capabilities(&self) -> &Capabilities;

    fn set_channel(&mut self, channel: usize) -> Result<(), DeviceError>;
    fn set_antenna(&mut self, antenna: &str) -> Result<(), DeviceError>;
    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DeviceError>;
    fn sample_rate(&self) -> f64;
    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<(), DeviceError>;
    fn set_gain(&mut self, gain: Gain) -> Result<(), DeviceError>;
    fn set_frequency_correction(&mut self, ppm: f64) -> Result<(), DeviceError>;
    fn apply_device_settings(&mut self, settings: &[(String, String)]) -> Result<(), DeviceError>;

    fn set_frequency(&mut self, freq: f64) -> Result<(), DeviceError>;
    fn frequency(&self) -> f64;

    fn start_stream(&mut self) -> Result<(), DeviceError>;
    /// Read up to `buf.len()` samples, waiting at most `timeout`
    fn read_stream(
        &mut self,
        buf: &mut [Sample],
        timeout: Duration,
    ) -> Result<StreamRead, DeviceError>;
    /// Throw away anything buffered in the device (stale samples after a retune)
    fn reset_stream(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);
}

/// Settings every backend tracks the same way
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Tuning {
    pub frequency: f64,
    pub sample_rate: f64,
    pub bandwidth: f64,
    pub gain: Gain,
    pub antenna: String,
    pub channel: usize,
    pub ppm: f64,
    pub settings: BTreeMap<String, String>,
    pub streaming: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            sample_rate: 2.0e6,
            bandwidth: 0.0,
            gain: Gain::Manual(0.0),
            antenna: String::new(),
            channel: 0,
            ppm: 0.0,
            settings: BTreeMap::new(),
            streaming: false,
        }
    }
}

impl Tuning {
    pub fn check_gain(&self, caps: &Capabilities, gain: Gain) -> Result<(), DeviceError> {
        match gain {
            Gain::Manual(db) if !caps.gain.contains(db) => Err(DeviceError::Setting {
                setting: "gain",
                reason: format!(
                    "{db} dB outside of {}..={} dB",
                    caps.gain.min, caps.gain.max
                ),
            }),
            _ => Ok(()),
        }
    }

    pub fn check_antenna(&self, caps: &Capabilities, antenna: &str) -> Result<(), DeviceError> {
        if antenna.is_empty() || caps.antennas.iter().any(|a| a == antenna) {
            Ok(())
        } else {
            Err(DeviceError::Setting {
                setting: "antenna",
                reason: format!("`{antenna}` not in {:?}", caps.antennas),
            })
        }
    }

    pub fn check_channel(&self, caps: &Capabilities, channel: usize) -> Result<(), DeviceError> {
        if channel < caps.channels {
            Ok(())
        } else {
            Err(DeviceError::Setting {
                setting: "channel",
                reason: format!("device has {} channel(s)", caps.channels),
            })
        }
    }
}

/// Parsed `key=value,key=value` device arguments
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceArgs(BTreeMap<String, String>);

impl DeviceArgs {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::DeviceArgs(pair.to_owned()))?;
            map.insert(k.trim().to_owned(), v.trim().to_owned());
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn driver(&self) -> &str {
        self.get("driver").unwrap_or(tone::DRIVER)
    }

    pub fn float(&self, key: &str) -> Result<Option<f64>, DeviceError> {
        self.get(key)
            .map(|v| {
                float_with_multiplier(v)
                    .map_err(|e| DeviceError::Open(format!("argument `{key}`: {e}")))
            })
            .transpose()
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "yes"))
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0.into_iter().collect()
    }
}

/// Every backend that can be opened
pub fn detect_devices() -> Vec<DeviceInfo> {
    vec![tone::ToneRadio::device_info(), file::FileRadio::device_info()]
}

pub fn open(args: &str) -> Result<Box<dyn Radio>, Error> {
    let args = DeviceArgs::parse(args)?;
    let radio: Box<dyn Radio> = match args.driver() {
        tone::DRIVER => Box::new(tone::ToneRadio::open(&args)?),
        file::DRIVER => Box::new(file::FileRadio::open(&args)?),
        other => return Err(DeviceError::NoDriver(other.to_owned()).into()),
    };
    Ok(radio)
}

/// Push the session's device parameters down to an open radio.
///
/// Rates and bandwidths the device doesn't advertise are configuration errors
/// unless explicitly forced.
pub fn configure(radio: &mut dyn Radio, params: &DeviceParams) -> Result<(), Error> {
    let caps = radio.capabilities().clone();
    if !params.force_sample_rate && !caps.supports_rate(params.sample_rate) {
        return Err(ConfigError::UnsupportedRate(params.sample_rate).into());
    }
    if params.bandwidth > 0.0
        && !params.force_bandwidth
        && !caps.supports_bandwidth(params.bandwidth)
    {
        return Err(ConfigError::UnsupportedBandwidth(params.bandwidth).into());
    }
    radio.set_channel(params.channel)?;
    if let Some(antenna) = &params.antenna {
        radio.set_antenna(antenna)?;
    }
    radio.set_sample_rate(params.sample_rate)?;
    if params.bandwidth > 0.0 {
        radio.set_bandwidth(params.bandwidth)?;
    }
    radio.set_gain(params.gain)?;
    if params.ppm != 0 {
        radio.set_frequency_correction(params.ppm as f64)?;
    }
    if !params.settings.is_empty() {
        radio.apply_device_settings(&params.settings)?;
    }
    debug!(
        rate = params.sample_rate,
        bandwidth = params.bandwidth,
        gain = ?params.gain,
        "Device configured"
    );
    Ok(())
}

/// How long a read of `samples` samples may take before we call it a failure
pub fn read_timeout(samples: usize, sample_rate: f64) -> Duration {
    Duration::from_secs_f64(2.0 * (samples as f64 / sample_rate + 0.1))
}

/// Fill `buf` completely, returning the number of overflow indications seen
pub fn read_exact(
    radio: &mut dyn Radio,
    buf: &mut [Sample],
    timeout: Duration,
) -> Result<u64, DeviceError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    let mut overflows = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeviceError::Timeout(timeout));
        }
        let read = radio.read_stream(&mut buf[filled..], remaining)?;
        if read.overflow {
            overflows += 1;
            warn!("Device buffer overflow");
        }
        filled += read.samples;
    }
    Ok(overflows)
}

/// Human readable device listing for `--detect`
pub fn describe_devices(devices: &[DeviceInfo]) -> String {
    let mut text = vec!["Detected devices:".to_owned()];
    if devices.is_empty() {
        text.push("  No devices found".to_owned());
    }
    for (i, d) in devices.iter().enumerate() {
        text.push(format!(
            "  device_id={i}, driver={}, label={}, hardware={}",
            d.driver, d.label, d.hardware
        ));
    }
    info!(count = devices.len(), "Device detection finished");
    text.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_args() {
        let args = DeviceArgs::parse("driver=file, path=/tmp/x.cu8,loop=true").unwrap();
        assert_eq!(args.driver(), "file");
        assert_eq!(args.get("path"), Some("/tmp/x.cu8"));
        assert!(args.flag("loop"));
        assert!(DeviceArgs::parse("driver").is_err());
        assert_eq!(DeviceArgs::parse("").unwrap().driver(), tone::DRIVER);
    }

    #[test]
    fn unknown_driver() {
        assert!(matches!(
            open("driver=hackrf"),
            Err(Error::Device(DeviceError::NoDriver(_)))
        ));
    }

    #[test]
    fn unsupported_rate_is_config_error() {
        let mut radio = open("driver=tone").unwrap();
        let params = DeviceParams {
            sample_rate: 1.0e12,
            ..DeviceParams::default()
        };
        assert!(matches!(
            configure(radio.as_mut(), &params),
            Err(Error::Config(ConfigError::UnsupportedRate(_)))
        ));
        let forced = DeviceParams {
            force_sample_rate: true,
            ..params
        };
        configure(radio.as_mut(), &forced).unwrap();
        assert_eq!(radio.sample_rate(), 1.0e12);
    }

    #[test]
    fn read_exact_fills_and_counts_overflows() {
        let mut radio = open("driver=tone,overflow_every=2").unwrap();
        radio.start_stream().unwrap();
        let mut buf = vec![Sample::default(); 10_000];
        let overflows = read_exact(radio.as_mut(), &mut buf, Duration::from_secs(1)).unwrap();
        assert!(overflows >= 1);
    }

    #[test]
    fn device_listing_names_the_hardware() {
        let text = describe_devices(&detect_devices());
        assert!(text.starts_with("Detected devices:"));
        assert!(text.contains("device_id=0, driver=tone"));
        assert!(text.contains("hardware=tone"));
        assert!(text.contains("hardware=file"));
        assert_eq!(describe_devices(&[]), "Detected devices:\n  No devices found");
    }
}

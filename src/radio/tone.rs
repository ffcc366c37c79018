//! Deterministic synthetic radio.
//!
//! Produces one or more complex tones at absolute RF frequencies plus seeded
//! uniform noise. Two radios opened with the same arguments and driven the same
//! way produce bit-identical sample streams.

use std::{f64::consts::TAU, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{Capabilities, DeviceArgs, DeviceInfo, Gain, Radio, Range, StreamRead, Tuning};
use crate::{error::DeviceError, Sample};

pub const DRIVER: &str = "tone";
/// Largest single transfer, also reported as the default buffer size
const MTU: usize = 4096;

pub struct ToneRadio {
    info: DeviceInfo,
    caps: Capabilities,
    tuning: Tuning,
    tones: Vec<f64>,
    amplitude: f64,
    noise: f64,
    seed: u64,
    rng: StdRng,
    /// Samples produced since the stream started
    position: u64,
    reads: u64,
    overflow_every: Option<u64>,
    fail_on_read: Option<u64>,
}

impl ToneRadio {
    pub fn device_info() -> DeviceInfo {
        DeviceInfo {
            driver: DRIVER.to_owned(),
            label: "Synthetic tone generator".to_owned(),
            hardware: "tone".to_owned(),
        }
    }

    pub fn open(args: &DeviceArgs) -> Result<Self, DeviceError> {
        let tones = match args.get("tone") {
            Some(list) => list
                .split(';')
                .map(|t| {
                    crate::config::float_with_multiplier(t)
                        .map_err(|e| DeviceError::Open(format!("argument `tone`: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let seed = args.float("seed")?.unwrap_or(0.0) as u64;
        let positive = |key: &str| -> Result<Option<u64>, DeviceError> {
            Ok(args.float(key)?.filter(|v| *v >= 1.0).map(|v| v as u64))
        };
        Ok(Self {
            info: Self::device_info(),
            caps: Capabilities {
                sample_rates: vec![Range::new(1.0e3, 100.0e6)],
                bandwidths: vec![Range::new(0.0, 100.0e6)],
                gain: Range::new(0.0, 50.0),
                antennas: vec!["RX".to_owned()],
                channels: 1,
                default_buffer_size: MTU,
            },
            tuning: Tuning::default(),
            tones,
            amplitude: args.float("amplitude")?.unwrap_or(0.5),
            noise: args.float("noise")?.unwrap_or(0.0),
            seed,
            rng: StdRng::seed_from_u64(seed),
            position: 0,
            reads: 0,
            overflow_every: positive("overflow_every")?,
            fail_on_read: positive("fail_on_read")?,
        })
    }

    fn sample_at(&mut self, position: u64) -> Sample {
        let t = position as f64 / self.tuning.sample_rate;
        let mut re = 0.0;
        let mut im = 0.0;
        for tone in &self.tones {
            let offset = tone - self.tuning.frequency;
            let phase = TAU * (offset * t).fract();
            re += self.amplitude * phase.cos();
            im += self.amplitude * phase.sin();
        }
        if self.noise > 0.0 {
            re += self.rng.gen_range(-self.noise..=self.noise);
            im += self.rng.gen_range(-self.noise..=self.noise);
        }
        Sample::new(re as f32, im as f32)
    }
}

impl Radio for ToneRadio {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn set_channel(&mut self, channel: usize) -> Result<(), DeviceError> {
        self.tuning.check_channel(&self.caps, channel)?;
        self.tuning.channel = channel;
        Ok(())
    }

    fn set_antenna(&mut self, antenna: &str) -> Result<(), DeviceError> {
        self.tuning.check_antenna(&self.caps, antenna)?;
        self.tuning.antenna = antenna.to_owned();
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DeviceError> {
        if rate <= 0.0 {
            return Err(DeviceError::Setting {
                setting: "sample rate",
                reason: format!("{rate} Hz"),
            });
        }
        self.tuning.sample_rate = rate;
        Ok(())
    }

    fn sample_rate(&self) -> f64 {
        self.tuning.sample_rate
    }

    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<(), DeviceError> {
        self.tuning.bandwidth = bandwidth;
        Ok(())
    }

    fn set_gain(&mut self, gain: Gain) -> Result<(), DeviceError> {
        self.tuning.check_gain(&self.caps, gain)?;
        self.tuning.gain = gain;
        Ok(())
    }

    fn set_frequency_correction(&mut self, ppm: f64) -> Result<(), DeviceError> {
        self.tuning.ppm = ppm;
        Ok(())
    }

    fn apply_device_settings(&mut self, settings: &[(String, String)]) -> Result<(), DeviceError> {
        self.tuning.settings.extend(settings.iter().cloned());
        Ok(())
    }

    fn set_frequency(&mut self, freq: f64) -> Result<(), DeviceError> {
        if !freq.is_finite() || freq < 0.0 {
            return Err(DeviceError::Tune {
                freq,
                reason: "out of range".to_owned(),
            });
        }
        self.tuning.frequency = freq * (1.0 + self.tuning.ppm * 1e-6);
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.tuning.frequency / (1.0 + self.tuning.ppm * 1e-6)
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        self.tuning.streaming = true;
        self.position = 0;
        self.reads = 0;
        self.rng = StdRng::seed_from_u64(self.seed);
        Ok(())
    }

    fn read_stream(
        &mut self,
        buf: &mut [Sample],
        _timeout: Duration,
    ) -> Result<StreamRead, DeviceError> {
        if !self.tuning.streaming {
            return Err(DeviceError::Stream("stream not started".to_owned()));
        }
        self.reads += 1;
        if self.fail_on_read == Some(self.reads) {
            return Err(DeviceError::Stream(format!(
                "injected failure on read {}",
                self.reads
            )));
        }
        let n = buf.len().min(MTU);
        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = self.sample_at(self.position + i as u64);
        }
        self.position += n as u64;
        Ok(StreamRead {
            samples: n,
            overflow: self
                .overflow_every
                .map_or(false, |every| self.reads % every == 0),
        })
    }

    fn reset_stream(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) {
        self.tuning.streaming = false;
    }
}

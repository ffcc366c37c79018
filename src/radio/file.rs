//! Replays interleaved IQ recordings as if they came off a receiver.
//!
//! Tuning is accepted but has no effect on the samples, so this is mostly useful
//! for single-hop captures and for exercising the pipeline offline.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::PathBuf,
    time::Duration,
};

use super::{Capabilities, DeviceArgs, DeviceInfo, Gain, Radio, Range, StreamRead, Tuning};
use crate::{error::DeviceError, Sample};

pub const DRIVER: &str = "file";
const MTU: usize = 16384;

/// On-disk sample encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8 bit, as written by rtl_sdr
    Cu8,
    Cs8,
    /// Little endian signed 16 bit
    Cs16,
    /// Little endian 32 bit float
    Cf32,
}

impl SampleFormat {
    fn parse(s: &str) -> Result<Self, DeviceError> {
        match s.to_ascii_lowercase().as_str() {
            "cu8" => Ok(Self::Cu8),
            "cs8" => Ok(Self::Cs8),
            "cs16" => Ok(Self::Cs16),
            "cf32" => Ok(Self::Cf32),
            other => Err(DeviceError::Open(format!("unknown sample format `{other}`"))),
        }
    }

    /// Bytes per complex sample
    pub fn width(self) -> usize {
        match self {
            Self::Cu8 | Self::Cs8 => 2,
            Self::Cs16 => 4,
            Self::Cf32 => 8,
        }
    }

    pub fn decode(self, raw: &[u8]) -> Sample {
        match self {
            Self::Cu8 => Sample::new(
                (raw[0] as f32 - 127.5) / 127.5,
                (raw[1] as f32 - 127.5) / 127.5,
            ),
            Self::Cs8 => Sample::new(raw[0] as i8 as f32 / 128.0, raw[1] as i8 as f32 / 128.0),
            Self::Cs16 => Sample::new(
                i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
                i16::from_le_bytes([raw[2], raw[3]]) as f32 / 32768.0,
            ),
            Self::Cf32 => Sample::new(
                f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
        }
    }
}

pub struct FileRadio {
    info: DeviceInfo,
    caps: Capabilities,
    tuning: Tuning,
    path: PathBuf,
    format: SampleFormat,
    looping: bool,
    reader: Option<BufReader<File>>,
    scratch: Vec<u8>,
    delivered: usize,
}

impl FileRadio {
    pub fn device_info() -> DeviceInfo {
        DeviceInfo {
            driver: DRIVER.to_owned(),
            label: "IQ file replay".to_owned(),
            hardware: "file".to_owned(),
        }
    }

    pub fn open(args: &DeviceArgs) -> Result<Self, DeviceError> {
        let path = PathBuf::from(
            args.get("path")
                .ok_or_else(|| DeviceError::Open("file driver needs `path=`".to_owned()))?,
        );
        let format = SampleFormat::parse(args.get("format").unwrap_or("cu8"))?;
        let mut info = Self::device_info();
        info.label = format!("IQ file replay ({})", path.display());
        let file = File::open(&path)
            .map_err(|e| DeviceError::Open(format!("{}: {e}", path.display())))?;
        Ok(Self {
            info,
            caps: Capabilities {
                sample_rates: vec![Range::new(1.0, f64::MAX)],
                bandwidths: vec![Range::new(0.0, f64::MAX)],
                gain: Range::new(0.0, f64::MAX),
                antennas: Vec::new(),
                channels: 1,
                default_buffer_size: MTU,
            },
            tuning: Tuning::default(),
            path,
            format,
            looping: args.flag("loop"),
            reader: Some(BufReader::new(file)),
            scratch: Vec::new(),
            delivered: 0,
        })
    }

    fn stream_error(&self, e: std::io::Error) -> DeviceError {
        DeviceError::Stream(format!("{}: {e}", self.path.display()))
    }

    /// Read as many whole samples as are available, up to `max_bytes`
    fn fill_scratch(&mut self, max_bytes: usize) -> Result<usize, DeviceError> {
        self.scratch.resize(max_bytes, 0);
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DeviceError::Stream("device closed".to_owned()))?;
        let mut got = 0;
        while got < max_bytes {
            match reader.read(&mut self.scratch[got..max_bytes]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(DeviceError::Stream(format!(
                        "{}: {e}",
                        self.path.display()
                    )))
                }
            }
        }
        Ok(got - got % self.format.width())
    }
}

impl Radio for FileRadio {
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
        self.tuning.frequency = freq;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.tuning.frequency
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        self.tuning.streaming = true;
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
        let width = self.format.width();
        let wanted = buf.len().min(MTU) * width;
        let mut got = self.fill_scratch(wanted)?;
        if got == 0 {
            if !self.looping {
                return Err(DeviceError::EndOfStream(self.delivered));
            }
            let rewind = self
                .reader
                .as_mut()
                .map(|r| r.seek(SeekFrom::Start(0)))
                .transpose();
            rewind.map_err(|e| self.stream_error(e))?;
            got = self.fill_scratch(wanted)?;
            if got == 0 {
                return Err(DeviceError::EndOfStream(self.delivered));
            }
        }
        let samples = got / width;
        for (slot, raw) in buf.iter_mut().zip(self.scratch[..got].chunks_exact(width)) {
            *slot = self.format.decode(raw);
        }
        self.delivered += samples;
        Ok(StreamRead {
            samples,
            overflow: false,
        })
    }

    fn reset_stream(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) {
        self.tuning.streaming = false;
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_formats() {
        assert_eq!(SampleFormat::Cu8.decode(&[255, 0]), Sample::new(1.0, -1.0));
        assert_eq!(SampleFormat::Cs8.decode(&[64, 192]), Sample::new(0.5, -0.5));
        assert_eq!(
            SampleFormat::Cs16.decode(&[0x00, 0x40, 0x00, 0xc0]),
            Sample::new(0.5, -0.5)
        );
        let mut raw = 0.25f32.to_le_bytes().to_vec();
        raw.extend_from_slice(&(-2.0f32).to_le_bytes());
        assert_eq!(SampleFormat::Cf32.decode(&raw), Sample::new(0.25, -2.0));
    }

    #[test]
    fn missing_path() {
        let args = DeviceArgs::parse("driver=file").unwrap();
        assert!(matches!(FileRadio::open(&args), Err(DeviceError::Open(_))));
    }

    #[test]
    fn replays_and_loops() {
        let path = std::env::temp_dir().join(format!("slurper-{}.cs8", std::process::id()));
        std::fs::write(&path, [64u8, 192, 0, 0, 192, 64]).unwrap();
        let args = DeviceArgs::parse(&format!(
            "driver=file,format=cs8,loop=true,path={}",
            path.display()
        ))
        .unwrap();
        let mut radio = FileRadio::open(&args).unwrap();
        radio.start_stream().unwrap();
        let mut buf = vec![Sample::default(); 5];
        let first = radio.read_stream(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(first.samples, 3);
        let second = radio.read_stream(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(second.samples, 3);
        assert_eq!(buf[0], Sample::new(0.5, -0.5));
        std::fs::remove_file(path).unwrap();
    }
}

//! This module is responsible for exfilling stitched spectra to the outside
//! world: the wire formats and the single writer thread that owns the sink.

use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::{aggregate::Record, config::OutputFormat, monitoring::Stats, psd::Spectrum};

/// Magic at the start of every `soapy_power_bin` record
pub const BIN_MAGIC: &[u8; 5] = b"SDRFF";
pub const BIN_VERSION: u8 = 1;

/// Serializes records into bytes. Each call produces one complete record so the
/// writer can hand it to the sink in a single write.
pub trait RecordEncoder: Send {
    fn encode_hop(&self, spectrum: &Spectrum, out: &mut Vec<u8>) -> io::Result<()>;

    /// Marker between runs, nothing by default
    fn encode_run_end(&self, _run: u64, _out: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }
}

/// `date, time, min, max, bin_size, bin_count, values...`
pub struct RtlPower;

/// Commented header per hop, then `frequency power` lines
pub struct RtlPowerFftw;

/// Little endian packed header + f32 values
pub struct SoapyPowerBin;

/// Native endian fixed header + f32 values, for zero-parse consumers
pub struct RawBinary;

fn unix_seconds(time: &DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + time.timestamp_subsec_nanos() as f64 * 1e-9
}

fn values_f32(spectrum: &Spectrum) -> Vec<f32> {
    spectrum.values.iter().map(|v| *v as f32).collect()
}

impl RecordEncoder for RtlPower {
    fn encode_hop(&self, s: &Spectrum, out: &mut Vec<u8>) -> io::Result<()> {
        write!(
            out,
            "{}, {}, {:.0}, {:.0}, {:.2}, {}",
            s.time_stop.format("%Y-%m-%d"),
            s.time_stop.format("%H:%M:%S"),
            s.min_freq,
            s.max_freq,
            s.bin_size,
            s.bin_count()
        )?;
        for v in &s.values {
            write!(out, ", {v:.2}")?;
        }
        writeln!(out)
    }
}

impl RecordEncoder for RtlPowerFftw {
    fn encode_hop(&self, s: &Spectrum, out: &mut Vec<u8>) -> io::Result<()> {
        const STAMP: &str = "%Y-%m-%d %H:%M:%S%.6f UTC";
        writeln!(out, "# spectrum_slurper output")?;
        writeln!(out, "# Acquisition start: {}", s.time_start.format(STAMP))?;
        writeln!(out, "# Acquisition end: {}", s.time_stop.format(STAMP))?;
        writeln!(out, "#")?;
        writeln!(out, "# frequency [Hz] power spectral density [dB/Hz]")?;
        for (f, v) in s.frequencies().zip(&s.values) {
            writeln!(out, "{f:.2} {v}")?;
        }
        writeln!(out)
    }

    fn encode_run_end(&self, _run: u64, out: &mut Vec<u8>) -> io::Result<()> {
        writeln!(out)
    }
}

impl RecordEncoder for SoapyPowerBin {
    fn encode_hop(&self, s: &Spectrum, out: &mut Vec<u8>) -> io::Result<()> {
        let values = values_f32(s);
        out.extend_from_slice(BIN_MAGIC);
        out.push(BIN_VERSION);
        for x in [
            unix_seconds(&s.time_start),
            unix_seconds(&s.time_stop),
            s.min_freq,
            s.max_freq,
            s.bin_size,
        ] {
            out.extend_from_slice(&x.to_le_bytes());
        }
        out.extend_from_slice(&(values.len() as u64).to_le_bytes());
        out.extend_from_slice(&((values.len() * 4) as u64).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }
}

impl RecordEncoder for RawBinary {
    fn encode_hop(&self, s: &Spectrum, out: &mut Vec<u8>) -> io::Result<()> {
        for x in [s.min_freq, s.max_freq, s.bin_size] {
            out.extend_from_slice(&x.to_ne_bytes());
        }
        out.extend_from_slice(&(s.bin_count() as u64).to_ne_bytes());
        out.extend_from_slice(values_f32(s).as_byte_slice());
        Ok(())
    }
}

/// Pick the encoder once, at startup
pub fn encoder(format: OutputFormat) -> Box<dyn RecordEncoder> {
    match format {
        OutputFormat::RtlPower => Box::new(RtlPower),
        OutputFormat::RtlPowerFftw => Box::new(RtlPowerFftw),
        OutputFormat::SoapyPowerBin => Box::new(SoapyPowerBin),
        OutputFormat::Raw => Box::new(RawBinary),
    }
}

/// Where records end up
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum OutputTarget {
    #[default]
    Stdout,
    File(PathBuf),
    /// Already open descriptor inherited from the parent process
    Fd(i32),
}

pub fn open_sink(target: &OutputTarget) -> io::Result<Box<dyn Write + Send>> {
    match target {
        OutputTarget::Stdout => Ok(Box::new(io::stdout())),
        OutputTarget::File(path) => {
            info!("Writing output to {}", path.display());
            Ok(Box::new(File::create(path)?))
        }
        #[cfg(unix)]
        OutputTarget::Fd(fd) => {
            use std::os::unix::io::FromRawFd;
            // Safety: the descriptor is handed to us by the caller and owned
            // by this process from here on
            Ok(Box::new(unsafe { File::from_raw_fd(*fd) }))
        }
        #[cfg(not(unix))]
        OutputTarget::Fd(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file descriptor output is only available on unix",
        )),
    }
}

/// The single consumer of the output queue
pub struct OutputWriter<W: Write> {
    sink: W,
    encoder: Box<dyn RecordEncoder>,
    stats: Arc<Stats>,
    buf: Vec<u8>,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(sink: W, encoder: Box<dyn RecordEncoder>, stats: Arc<Stats>) -> Self {
        Self {
            sink,
            encoder,
            stats,
            buf: Vec::new(),
        }
    }

    /// Encode and write one record in a single write so records never interleave
    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        self.buf.clear();
        match record {
            Record::Hop(spectrum) => self.encoder.encode_hop(spectrum, &mut self.buf)?,
            Record::RunEnd { run, .. } => self.encoder.encode_run_end(*run, &mut self.buf)?,
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        self.sink.write_all(&self.buf)?;
        self.sink.flush()?;
        if let Record::Hop(spectrum) = record {
            self.stats.record_written();
            debug!(
                run = spectrum.run,
                hop = spectrum.hop_index,
                bytes = self.buf.len(),
                "Record written"
            );
        }
        Ok(())
    }

    /// Write everything that comes through `records`, handing the sink back
    /// once the aggregator hangs up
    pub fn run(mut self, records: Receiver<Record>) -> io::Result<W> {
        for record in records.iter() {
            self.write(&record)?;
        }
        self.sink.flush()?;
        Ok(self.sink)
    }
}

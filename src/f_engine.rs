//! The transform backend behind the PSD workers.
//!
//! The workers only ever see [`SpectralEngine`], so which rustfft planner sits
//! underneath is a configuration choice made once at startup.

use std::{str::FromStr, sync::Arc};

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner, FftPlannerScalar};

use crate::error::{ConfigError, TransformError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FftBackend {
    /// Let rustfft pick the fastest (SIMD) implementation for this CPU
    #[default]
    Auto,
    /// Portable scalar implementation
    Scalar,
}

impl FromStr for FftBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "scalar" => Ok(Self::Scalar),
            _ => Err(ConfigError::UnknownOption {
                kind: "FFT backend",
                value: s.to_owned(),
            }),
        }
    }
}

pub trait SpectralEngine: Send + Sync {
    /// Transform length
    fn len(&self) -> usize;

    /// Scratch space `forward` needs, in elements
    fn scratch_len(&self) -> usize;

    /// Multiply `segment` by `window` and replace it with its forward DFT
    fn forward(
        &self,
        segment: &mut [Complex64],
        window: &[f64],
        scratch: &mut [Complex64],
    ) -> Result<(), TransformError>;
}

/// rustfft-backed engine with a plan built once for a fixed length
pub struct RustFft {
    fft: Arc<dyn Fft<f64>>,
}

impl RustFft {
    pub fn new(len: usize, backend: FftBackend) -> Self {
        let fft = match backend {
            FftBackend::Auto => FftPlanner::<f64>::new().plan_fft_forward(len),
            FftBackend::Scalar => FftPlannerScalar::<f64>::new().plan_fft_forward(len),
        };
        Self { fft }
    }
}

impl SpectralEngine for RustFft {
    fn len(&self) -> usize {
        self.fft.len()
    }

    fn scratch_len(&self) -> usize {
        self.fft.get_inplace_scratch_len()
    }

    fn forward(
        &self,
        segment: &mut [Complex64],
        window: &[f64],
        scratch: &mut [Complex64],
    ) -> Result<(), TransformError> {
        let n = self.fft.len();
        for got in [segment.len(), window.len()] {
            if got != n {
                return Err(TransformError::Length { expected: n, got });
            }
        }
        segment
            .iter_mut()
            .zip(window)
            .for_each(|(x, w)| *x *= *w);
        self.fft.process_with_scratch(segment, scratch);
        Ok(())
    }
}

pub fn engine(len: usize, backend: FftBackend) -> Arc<dyn SpectralEngine> {
    Arc::new(RustFft::new(len, backend))
}

//! Segment conditioning ahead of the FFT: named window functions and detrending.
//!
//! Every window here is generated in its periodic ("DFT-even") form: a
//! symmetric window of `n + 1` points with the last point dropped. That is the
//! form you want for spectral analysis, where the segment is implicitly
//! treated as one period of a periodic signal.

use std::{f64::consts::PI, fmt, str::FromStr};

use num_complex::Complex64;
use num_traits::Zero;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Boxcar,
    Hann,
    Hamming,
    Bartlett,
    Triang,
    Blackman,
    BlackmanHarris,
    Nuttall,
    Flattop,
    Bohman,
    Parzen,
    Barthann,
    /// Tapered cosine, shape parameter is the taper fraction alpha
    Tukey,
    /// Shape parameter is beta
    Kaiser,
}

impl WindowKind {
    pub const ALL: [WindowKind; 14] = [
        WindowKind::Boxcar,
        WindowKind::Hann,
        WindowKind::Hamming,
        WindowKind::Bartlett,
        WindowKind::Triang,
        WindowKind::Blackman,
        WindowKind::BlackmanHarris,
        WindowKind::Nuttall,
        WindowKind::Flattop,
        WindowKind::Bohman,
        WindowKind::Parzen,
        WindowKind::Barthann,
        WindowKind::Tukey,
        WindowKind::Kaiser,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WindowKind::Boxcar => "boxcar",
            WindowKind::Hann => "hann",
            WindowKind::Hamming => "hamming",
            WindowKind::Bartlett => "bartlett",
            WindowKind::Triang => "triang",
            WindowKind::Blackman => "blackman",
            WindowKind::BlackmanHarris => "blackmanharris",
            WindowKind::Nuttall => "nuttall",
            WindowKind::Flattop => "flattop",
            WindowKind::Bohman => "bohman",
            WindowKind::Parzen => "parzen",
            WindowKind::Barthann => "barthann",
            WindowKind::Tukey => "tukey",
            WindowKind::Kaiser => "kaiser",
        }
    }

    /// Shape parameter used when none is given
    pub fn default_shape(self) -> Option<f64> {
        match self {
            WindowKind::Tukey => Some(0.5),
            WindowKind::Kaiser => Some(14.0),
            _ => None,
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WindowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WindowKind::ALL
            .into_iter()
            .find(|w| w.name() == s)
            .ok_or_else(|| ConfigError::UnknownWindow(s.to_owned()))
    }
}

/// A window function together with its (optional) shape parameter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    pub kind: WindowKind,
    pub shape: Option<f64>,
}

impl Window {
    pub fn new(kind: WindowKind, shape: Option<f64>) -> Self {
        Self { kind, shape }
    }

    /// Periodic window coefficients of length `n`
    pub fn coefficients(&self, n: usize) -> Vec<f64> {
        match n {
            0 => Vec::new(),
            1 => vec![1.0],
            _ => {
                let mut w = self.symmetric(n + 1);
                w.truncate(n);
                w
            }
        }
    }

    fn symmetric(&self, m: usize) -> Vec<f64> {
        let shape = self.shape.or_else(|| self.kind.default_shape());
        let span = (m - 1) as f64;
        let points = 0..m;
        match self.kind {
            WindowKind::Boxcar => vec![1.0; m],
            WindowKind::Hann => general_cosine(m, &[0.5, 0.5]),
            WindowKind::Hamming => general_cosine(m, &[0.54, 0.46]),
            WindowKind::Blackman => general_cosine(m, &[0.42, 0.50, 0.08]),
            WindowKind::BlackmanHarris => {
                general_cosine(m, &[0.35875, 0.48829, 0.14128, 0.01168])
            }
            WindowKind::Nuttall => {
                general_cosine(m, &[0.3635819, 0.4891775, 0.1365995, 0.0106411])
            }
            WindowKind::Flattop => general_cosine(
                m,
                &[
                    0.21557895,
                    0.41663158,
                    0.277263158,
                    0.083578947,
                    0.006947368,
                ],
            ),
            WindowKind::Bartlett => points
                .map(|n| 1.0 - (2.0 * n as f64 / span - 1.0).abs())
                .collect(),
            WindowKind::Triang => {
                let half = if m % 2 == 1 {
                    (m + 1) as f64 / 2.0
                } else {
                    m as f64 / 2.0
                };
                points
                    .map(|n| 1.0 - ((n as f64 - span / 2.0) / half).abs())
                    .collect()
            }
            WindowKind::Bohman => points
                .map(|n| {
                    let x = (2.0 * n as f64 / span - 1.0).abs();
                    if x >= 1.0 {
                        0.0
                    } else {
                        (1.0 - x) * (PI * x).cos() + (PI * x).sin() / PI
                    }
                })
                .collect(),
            WindowKind::Parzen => {
                let half = m as f64 / 2.0;
                points
                    .map(|n| {
                        let x = (n as f64 - span / 2.0).abs();
                        let r = x / half;
                        if x <= span / 4.0 {
                            1.0 - 6.0 * r * r + 6.0 * r * r * r
                        } else {
                            2.0 * (1.0 - r).powi(3)
                        }
                    })
                    .collect()
            }
            WindowKind::Barthann => points
                .map(|n| {
                    let fac = (n as f64 / span - 0.5).abs();
                    0.62 - 0.48 * fac + 0.38 * (2.0 * PI * fac).cos()
                })
                .collect(),
            WindowKind::Tukey => tukey(m, shape.unwrap_or(0.5)),
            WindowKind::Kaiser => {
                let beta = shape.unwrap_or(14.0);
                let norm = bessel_i0(beta);
                points
                    .map(|n| {
                        let r = 2.0 * n as f64 / span - 1.0;
                        bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / norm
                    })
                    .collect()
            }
        }
    }
}

fn general_cosine(m: usize, a: &[f64]) -> Vec<f64> {
    let span = (m - 1) as f64;
    (0..m)
        .map(|n| {
            let phase = 2.0 * PI * n as f64 / span;
            a.iter()
                .enumerate()
                .map(|(k, ak)| {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    sign * ak * (k as f64 * phase).cos()
                })
                .sum()
        })
        .collect()
}

fn tukey(m: usize, alpha: f64) -> Vec<f64> {
    if alpha <= 0.0 {
        return vec![1.0; m];
    }
    if alpha >= 1.0 {
        return general_cosine(m, &[0.5, 0.5]);
    }
    let span = (m - 1) as f64;
    let width = (alpha * span / 2.0).floor() as usize;
    (0..m)
        .map(|n| {
            let x = n as f64;
            if n <= width {
                0.5 * (1.0 + (PI * (-1.0 + 2.0 * x / alpha / span)).cos())
            } else if n >= m - width - 1 {
                0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * x / alpha / span)).cos())
            } else {
                1.0
            }
        })
        .collect()
}

/// Zeroth order modified Bessel function of the first kind
fn bessel_i0(x: f64) -> f64 {
    let quarter_sq = x * x / 4.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    while term > sum * 1e-17 {
        term *= quarter_sq / (k * k);
        sum += term;
        k += 1.0;
    }
    sum
}

/// Trend removed from every FFT segment before windowing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Detrend {
    #[default]
    None,
    /// Subtract the segment mean
    Constant,
    /// Subtract the least-squares line through the segment
    Linear,
}

impl FromStr for Detrend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" | "none" => Ok(Detrend::None),
            "constant" => Ok(Detrend::Constant),
            "linear" => Ok(Detrend::Linear),
            _ => Err(ConfigError::UnknownOption {
                kind: "detrend mode",
                value: s.to_owned(),
            }),
        }
    }
}

impl Detrend {
    pub fn apply(self, segment: &mut [Complex64]) {
        let n = segment.len();
        if n == 0 {
            return;
        }
        match self {
            Detrend::None => {}
            Detrend::Constant => {
                let mean = segment.iter().fold(Complex64::zero(), |acc, x| acc + x) / n as f64;
                segment.iter_mut().for_each(|x| *x -= mean);
            }
            Detrend::Linear => {
                if n == 1 {
                    segment[0] = Complex64::zero();
                    return;
                }
                // Least squares against t = 0..n, real and imaginary parts independently
                let t_mean = (n - 1) as f64 / 2.0;
                let mean = segment.iter().fold(Complex64::zero(), |acc, x| acc + x) / n as f64;
                let mut cov = Complex64::zero();
                let mut var = 0.0;
                for (t, x) in segment.iter().enumerate() {
                    let dt = t as f64 - t_mean;
                    cov += (x - mean) * dt;
                    var += dt * dt;
                }
                let slope = cov / var;
                for (t, x) in segment.iter_mut().enumerate() {
                    *x -= mean + slope * (t as f64 - t_mean);
                }
            }
        }
    }
}

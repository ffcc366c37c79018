pub mod aggregate;
pub mod args;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod exfil;
pub mod f_engine;
pub mod monitoring;
pub mod plan;
pub mod psd;
pub mod radio;
pub mod sweep;
pub mod window;

/// Baseband IQ sample as it comes off the radio
pub type Sample = num_complex::Complex32;

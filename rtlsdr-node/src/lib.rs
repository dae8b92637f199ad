//! # RTL-SDR acquisition node
//!
//! This crate bridges RTL-SDR dongles to a host signal-processing
//! application. The host builds a [`Registry`] over the attached devices,
//! assigns each an identifier, tunes it and starts streaming. Every device
//! gets its own streaming thread which converts the raw unsigned 8-bit IQ
//! stream into DC-free [`Complex32`][num_complex::Complex32] samples and pushes
//! them, tagged with a versioned [`Context`], into a [`SampleSink`].
//!
//! The hardware is reached through the [`Device`] trait. With the `librtlsdr`
//! feature enabled `RtlSdr` implements it on top of [librtlsdr][1].
//! [`ReplayDevice`] plays back recorded IQ data instead.
//!
//! [1]: https://gitea.osmocom.org/sdr/rtl-sdr

pub mod calibration;
mod config;
mod context;
pub mod dc_filter;
mod device;
mod engine;
mod registry;
mod replay;
pub mod sink;

#[cfg(feature = "librtlsdr")]
mod enumerate;
#[cfg(feature = "librtlsdr")]
mod handle;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt::Debug;

use bytemuck::{
    Pod,
    Zeroable,
};

#[cfg(feature = "librtlsdr")]
pub use crate::{
    enumerate::{
        DeviceInfo,
        DeviceIter,
        devices,
    },
    handle::RtlSdr,
};
pub use crate::{
    config::Config,
    context::Context,
    device::Device,
    engine::EngineState,
    registry::{
        GainStageKind,
        Metadata,
        Registry,
    },
    replay::ReplayDevice,
    sink::{
        Push,
        SampleBlock,
        SampleSink,
    },
};

/// Errors returned by the [`Registry`] and the [`Device`] implementations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid device handle {handle}, there are {count} devices")]
    InvalidHandle { handle: usize, count: usize },
    #[error("invalid gain stage: {stage}")]
    InvalidStage { stage: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("hardware rejected request: {function} returned {value}")]
    HardwareRejected { function: &'static str, value: i32 },
    #[error("can't select gain level, because the device doesn't report any supported gain levels")]
    NoSupportedGains,
    #[error("operation not supported")]
    Unsupported,
}

impl Error {
    pub(crate) fn from_lib(function: &'static str, value: i32) -> Self {
        Self::HardwareRejected { function, value }
    }
}

/// 16 bit IQ sample
///
/// 8 bits per component, mapped from [-1, 1] to [0, 255]. K3XEC has [a good
/// reference][1] on the format.
///
/// [1]: https://k3xec.com/packrat-processing-iq/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IqSample {
    /// I: in-phase / real component
    pub i: u8,
    /// Q: quadrature / imaginary component
    pub q: u8,
}

impl Default for IqSample {
    fn default() -> Self {
        Self { i: 127, q: 127 }
    }
}

impl IqSample {
    /// Reinterprets a raw byte block as IQ samples.
    ///
    /// A trailing odd byte is ignored.
    pub fn from_bytes(bytes: &[u8]) -> &[IqSample] {
        bytemuck::cast_slice(&bytes[..bytes.len() & !1])
    }
}

/// Tuner gain mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TunerGainMode {
    /// Tuner gain is set manually
    Manual,
    /// Tuner gain is set automatically by the tuner.
    Auto,
}

/// The type of tuner in an RTL-SDR.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunerType(pub u32);

impl TunerType {
    pub const UNKNOWN: Self = Self(0);
    pub const E4000: Self = Self(1);
    pub const FC0012: Self = Self(2);
    pub const FC0013: Self = Self(3);
    pub const FC2580: Self = Self(4);
    pub const R820T: Self = Self(5);
    pub const R828D: Self = Self(6);
}

impl Debug for TunerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "TunerType::UNKNOWN"),
            Self::E4000 => write!(f, "TunerType::E4000"),
            Self::FC0012 => write!(f, "TunerType::FC0012"),
            Self::FC0013 => write!(f, "TunerType::FC0013"),
            Self::FC2580 => write!(f, "TunerType::FC2580"),
            Self::R820T => write!(f, "TunerType::R820T"),
            Self::R828D => write!(f, "TunerType::R828D"),
            _ => write!(f, "TunerType({})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::IqSample;

    #[test]
    fn size_of_iq_sample_is_two_bytes() {
        assert_eq!(std::mem::size_of::<IqSample>(), 2);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let samples = IqSample::from_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(samples, &[IqSample { i: 1, q: 2 }, IqSample { i: 3, q: 4 }]);
    }
}

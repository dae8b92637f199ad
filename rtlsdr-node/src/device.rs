use crate::{
    Error,
    TunerGainMode,
    TunerType,
};

/// Access to a single receiver.
///
/// This is the boundary to the hardware: `RtlSdr` (feature `librtlsdr`)
/// implements it on top of librtlsdr, [`ReplayDevice`][crate::ReplayDevice]
/// plays back recorded samples.
///
/// All methods take `&self`, because [`Self::read_async`] blocks the
/// streaming thread while the control methods and [`Self::cancel_async`] are
/// called from other threads.
pub trait Device: Send + Sync + 'static {
    fn tuner_type(&self) -> TunerType;

    /// Serial number from the USB descriptor, if available.
    fn serial(&self) -> Option<String>;

    /// Gain steps supported by the tuner, in tenths of a dB.
    fn tuner_gains(&self) -> Vec<i32>;

    fn get_center_frequency(&self) -> Result<u32, Error>;

    fn set_center_frequency(&self, frequency: u32) -> Result<(), Error>;

    fn get_sample_rate(&self) -> Result<u32, Error>;

    fn set_sample_rate(&self, sample_rate: u32) -> Result<(), Error>;

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<(), Error>;

    /// Current tuner gain in tenths of a dB.
    fn get_tuner_gain(&self) -> Result<i32, Error>;

    /// Set tuner gain, in tenths of a dB
    fn set_tuner_gain(&self, gain: i32) -> Result<(), Error>;

    /// Set the automatic gain correction of the RTL2832U. This is not the
    /// tuner gain mode.
    fn set_agc_mode(&self, enable: bool) -> Result<(), Error>;

    /// Clears the sample buffer of the device. Must be called before reading.
    fn reset_buffer(&self) -> Result<(), Error>;

    /// Reads samples until [`Self::cancel_async`] is called or the device
    /// fails.
    ///
    /// `callback` is called on the calling thread with every block of raw
    /// interleaved IQ bytes.
    fn read_async(&self, block_size: usize, callback: &mut dyn FnMut(&[u8]))
    -> Result<(), Error>;

    /// Makes a running [`Self::read_async`] return.
    fn cancel_async(&self) -> Result<(), Error>;
}

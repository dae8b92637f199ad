//! The device registry.
//!
//! The host addresses devices by their handle, an index in `0..count`. The
//! number of devices is fixed once the registry is built.

use std::{
    ops::RangeInclusive,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    Config,
    Context,
    Device,
    EngineState,
    Error,
    SampleSink,
    TunerGainMode,
    calibration::{
        self,
        GAIN_STAGE_NAME,
        GAIN_STAGE_UNIT,
        GainRange,
        GainSteps,
        SAMPLE_RATES,
        TunerInfo,
    },
    engine::Engine,
};

/// Static information about a device.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub name: &'static str,
    pub serial: Option<String>,
    /// Tunable center frequencies in Hz.
    pub frequency_range: RangeInclusive<i64>,
    pub sample_rates: &'static [u32],
    pub preferred_sample_rate: u32,
    /// `None` if the tuner doesn't report any usable gain steps.
    pub gain_range: Option<GainRange>,
}

/// How a gain stage is presented to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GainStageKind {
    /// Any value between the minimum and maximum gain.
    Continuous,
    /// Only the values listed by [`Registry::gain_discrete_values`].
    Discrete,
}

#[derive(Debug)]
struct Tuning {
    center_frequency: i64,
    sample_rate: u32,
    gain: f32,
    context: Context,
}

/// Everything the registry knows about one device.
///
/// Shared between the control path and the streaming thread of the device.
#[derive(derive_more::Debug)]
pub(crate) struct DeviceRecord<D> {
    pub index: usize,
    #[debug(skip)]
    pub device: D,
    name: &'static str,
    serial: Option<String>,
    frequency_range: RangeInclusive<i64>,
    gain_steps: GainSteps,
    gain_range: Option<GainRange>,
    identity: Mutex<Option<Arc<str>>>,
    tuning: Mutex<Tuning>,
}

impl<D: Device> DeviceRecord<D> {
    /// Reads the tuner properties and puts the device into its initial state.
    pub fn open(index: usize, device: D) -> Result<Self, Error> {
        let tuner_type = device.tuner_type();
        let tuner = TunerInfo::for_tuner(tuner_type);
        let center_frequency = tuner.initial_frequency();
        let TunerInfo {
            name,
            frequency_range,
        } = tuner;
        let serial = device.serial();

        let gain_steps = GainSteps::new(device.tuner_gains());
        let gain_range = gain_steps.range();
        if gain_range.is_none() {
            tracing::warn!(index, gains = ?gain_steps.as_slice(), "no continuous gain available");
        }

        // rejected initial settings don't fail the open. the cached values
        // are kept as if they had been applied.
        if let Err(error) = device.set_center_frequency(hardware_frequency(center_frequency)?) {
            tracing::warn!(index, center_frequency, ?error, "initial frequency rejected");
        }

        let sample_rate = calibration::preferred_sample_rate();
        if let Err(error) = device.set_sample_rate(sample_rate) {
            tracing::warn!(index, sample_rate, ?error, "initial sample rate rejected");
        }

        if let Err(error) = device.set_agc_mode(false) {
            tracing::warn!(index, ?error, "failed to disable agc");
        }

        tracing::info!(index, name, ?serial, ?tuner_type, "opened device");

        Ok(Self {
            index,
            device,
            name,
            serial,
            frequency_range,
            gain_steps,
            gain_range,
            identity: Mutex::new(None),
            tuning: Mutex::new(Tuning {
                center_frequency,
                sample_rate,
                gain: gain_range.map_or(0.0, |range| range.midpoint()),
                context: Context::new(center_frequency, sample_rate),
            }),
        })
    }
}

impl<D> DeviceRecord<D> {
    pub fn set_identity(&self, id: &str) {
        *self.identity.lock() = Some(id.into());
    }

    /// The identifier and context a block is tagged with.
    pub fn snapshot(&self) -> (Option<Arc<str>>, Context) {
        let identity = self.identity.lock().clone();
        let context = self.tuning.lock().context;
        (identity, context)
    }

    fn gain_range(&self) -> Result<GainRange, Error> {
        self.gain_range.ok_or(Error::NoSupportedGains)
    }
}

fn hardware_frequency(frequency: i64) -> Result<u32, Error> {
    u32::try_from(frequency).map_err(|_| Error::InvalidArgument("center frequency out of range"))
}

fn check_stage(stage: usize) -> Result<(), Error> {
    if stage == 0 {
        Ok(())
    }
    else {
        Err(Error::InvalidStage { stage })
    }
}

struct Slot<D: Device> {
    // dropped first, so the streaming thread is joined before the device is closed.
    engine: Engine<D>,
    record: Arc<DeviceRecord<D>>,
}

/// The devices served by this node.
///
/// Dropping the registry stops all streaming threads and closes the devices.
pub struct Registry<D: Device> {
    slots: Vec<Slot<D>>,
}

impl<D: Device> std::fmt::Debug for Registry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|slot| &slot.record))
            .finish()
    }
}

impl<D: Device> Registry<D> {
    /// Builds a registry over the given devices. Their position in `devices`
    /// becomes their handle.
    ///
    /// Fails if any device can't be put into its initial state.
    pub fn new(
        devices: impl IntoIterator<Item = D>,
        sink: impl SampleSink,
        config: &Config,
    ) -> Result<Self, Error> {
        let records = devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| DeviceRecord::open(index, device))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self::from_records(records, Arc::new(sink), config))
    }

    fn from_records(
        records: Vec<DeviceRecord<D>>,
        sink: Arc<dyn SampleSink>,
        config: &Config,
    ) -> Self {
        let slots = records
            .into_iter()
            .map(|record| {
                let record = Arc::new(record);
                Slot {
                    engine: Engine::spawn(record.clone(), sink.clone(), config.block_size),
                    record,
                }
            })
            .collect();
        Self { slots }
    }

    fn slot(&self, handle: usize) -> Result<&Slot<D>, Error> {
        self.slots.get(handle).ok_or(Error::InvalidHandle {
            handle,
            count: self.slots.len(),
        })
    }

    fn record(&self, handle: usize) -> Result<&DeviceRecord<D>, Error> {
        Ok(&self.slot(handle)?.record)
    }

    /// Number of devices. Handles are `0..count`.
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Sets the identifier blocks of this device are tagged with.
    pub fn assign_identity(&self, handle: usize, id: &str) -> Result<(), Error> {
        let record = self.record(handle)?;
        if id.is_empty() {
            return Err(Error::InvalidArgument("empty device identifier"));
        }
        tracing::debug!(device = handle, id, "assign identity");
        record.set_identity(id);
        Ok(())
    }

    pub fn identity(&self, handle: usize) -> Result<Option<String>, Error> {
        Ok(self.record(handle)?.identity.lock().as_deref().map(ToOwned::to_owned))
    }

    pub fn metadata(&self, handle: usize) -> Result<Metadata, Error> {
        let record = self.record(handle)?;
        Ok(Metadata {
            name: record.name,
            serial: record.serial.clone(),
            frequency_range: record.frequency_range.clone(),
            sample_rates: &SAMPLE_RATES,
            preferred_sample_rate: calibration::preferred_sample_rate(),
            gain_range: record.gain_range,
        })
    }

    pub fn hardware_name(&self, handle: usize) -> Result<&'static str, Error> {
        Ok(self.record(handle)?.name)
    }

    pub fn serial_number(&self, handle: usize) -> Result<Option<&str>, Error> {
        Ok(self.record(handle)?.serial.as_deref())
    }

    pub fn sample_rate_count(&self, handle: usize) -> Result<usize, Error> {
        self.record(handle)?;
        Ok(SAMPLE_RATES.len())
    }

    pub fn sample_rate_value(&self, handle: usize, index: usize) -> Result<u32, Error> {
        self.record(handle)?;
        SAMPLE_RATES
            .get(index)
            .copied()
            .ok_or(Error::InvalidArgument("sample rate index out of range"))
    }

    pub fn preferred_sample_rate(&self, handle: usize) -> Result<u32, Error> {
        self.record(handle)?;
        Ok(calibration::preferred_sample_rate())
    }

    pub fn min_center_frequency(&self, handle: usize) -> Result<i64, Error> {
        Ok(*self.record(handle)?.frequency_range.start())
    }

    pub fn max_center_frequency(&self, handle: usize) -> Result<i64, Error> {
        Ok(*self.record(handle)?.frequency_range.end())
    }

    /// RTL-SDRs have a single gain stage.
    pub fn gain_stage_count(&self, handle: usize) -> Result<usize, Error> {
        self.record(handle)?;
        Ok(1)
    }

    pub fn gain_stage_name(&self, handle: usize, stage: usize) -> Result<&'static str, Error> {
        self.record(handle)?;
        check_stage(stage)?;
        Ok(GAIN_STAGE_NAME)
    }

    pub fn gain_stage_unit(&self, handle: usize, stage: usize) -> Result<&'static str, Error> {
        self.record(handle)?;
        check_stage(stage)?;
        Ok(GAIN_STAGE_UNIT)
    }

    pub fn gain_stage_kind(&self, handle: usize, stage: usize) -> Result<GainStageKind, Error> {
        self.record(handle)?;
        check_stage(stage)?;
        Ok(GainStageKind::Continuous)
    }

    pub fn min_gain(&self, handle: usize, stage: usize) -> Result<f32, Error> {
        let record = self.record(handle)?;
        check_stage(stage)?;
        Ok(record.gain_range()?.min)
    }

    pub fn max_gain(&self, handle: usize, stage: usize) -> Result<f32, Error> {
        let record = self.record(handle)?;
        check_stage(stage)?;
        Ok(record.gain_range()?.max)
    }

    /// Always empty, as the stage is continuous.
    pub fn gain_discrete_values(&self, handle: usize, stage: usize) -> Result<Vec<f32>, Error> {
        self.record(handle)?;
        check_stage(stage)?;
        Ok(vec![])
    }

    pub fn sample_rate(&self, handle: usize) -> Result<u32, Error> {
        Ok(self.record(handle)?.tuning.lock().sample_rate)
    }

    /// Sets the sample rate, after mapping it onto a rate the hardware
    /// supports (see [`calibration::quantize_sample_rate`]).
    ///
    /// Requesting exactly the rate the device already runs at does nothing.
    /// If the hardware rejects the rate, the rate it actually runs at is read
    /// back and the call still succeeds. The context is left as it was.
    pub fn set_sample_rate(&self, handle: usize, requested: u32) -> Result<(), Error> {
        let record = self.record(handle)?;
        let sample_rate = calibration::quantize_sample_rate(requested);

        let current = record.tuning.lock().sample_rate;
        if requested == current {
            tracing::trace!(device = handle, requested, "sample rate unchanged");
            return Ok(());
        }

        match record.device.set_sample_rate(sample_rate) {
            Ok(()) => {
                let mut tuning = record.tuning.lock();
                tuning.sample_rate = sample_rate;
                tuning.context.resample(sample_rate);
                tracing::debug!(device = handle, requested, sample_rate, version = tuning.context.version, "sample rate set");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(device = handle, requested, sample_rate, ?error, "sample rate rejected");
                match record.device.get_sample_rate() {
                    Ok(actual) if actual > 0 => record.tuning.lock().sample_rate = actual,
                    Ok(_) => {}
                    Err(error) => tracing::warn!(device = handle, ?error, "can't read back sample rate"),
                }
                Ok(())
            }
        }
    }

    /// Current center frequency in Hz, as reported by the hardware.
    pub fn center_frequency(&self, handle: usize) -> Result<i64, Error> {
        let record = self.record(handle)?;
        let read_back = record.device.get_center_frequency();
        let mut tuning = record.tuning.lock();
        match read_back {
            Ok(frequency) if frequency > 0 => tuning.center_frequency = frequency.into(),
            Ok(_) => {}
            Err(error) => tracing::trace!(device = handle, ?error, "using cached center frequency"),
        }
        Ok(tuning.center_frequency)
    }

    /// Tunes the device. The frequency isn't checked against
    /// [`Self::min_center_frequency`] and [`Self::max_center_frequency`].
    pub fn set_center_frequency(&self, handle: usize, frequency: i64) -> Result<(), Error> {
        let record = self.record(handle)?;
        let hardware_frequency = hardware_frequency(frequency)?;

        if let Err(error) = record.device.set_center_frequency(hardware_frequency) {
            tracing::warn!(device = handle, frequency, ?error, "center frequency rejected");
            return Err(error);
        }

        let mut tuning = record.tuning.lock();
        tuning.center_frequency = frequency;
        tuning.context.retune(frequency);
        tracing::debug!(device = handle, frequency, version = tuning.context.version, "center frequency set");
        Ok(())
    }

    /// Current gain in dB, as reported by the hardware.
    pub fn gain(&self, handle: usize, stage: usize) -> Result<f32, Error> {
        let record = self.record(handle)?;
        check_stage(stage)?;
        let read_back = record.device.get_tuner_gain();
        let mut tuning = record.tuning.lock();
        match read_back {
            Ok(tenths) if tenths > 0 => tuning.gain = tenths as f32 / 10.0,
            Ok(_) => {}
            Err(error) => tracing::trace!(device = handle, ?error, "using cached gain"),
        }
        Ok(tuning.gain)
    }

    /// Sets the gain in dB.
    ///
    /// The gain is clamped to the continuous range and snapped down to a
    /// hardware step (see [`GainSteps::snap`]). The tuner is switched to manual
    /// gain first.
    pub fn set_gain(&self, handle: usize, stage: usize, gain: f32) -> Result<(), Error> {
        let record = self.record(handle)?;
        check_stage(stage)?;
        let tenths = record.gain_steps.snap(gain).ok_or(Error::NoSupportedGains)?;

        record.device.set_tuner_gain_mode(TunerGainMode::Manual)?;
        if let Err(error) = record.device.set_tuner_gain(tenths) {
            tracing::warn!(device = handle, gain, tenths, ?error, "gain rejected");
            return Err(error);
        }

        let gain = tenths as f32 / 10.0;
        record.tuning.lock().gain = gain;
        tracing::debug!(device = handle, gain, "gain set");
        Ok(())
    }

    /// Automatic gain isn't offered. The tuner always runs with manual gain.
    pub fn set_auto_gain(&self, handle: usize, stage: usize) -> Result<(), Error> {
        self.record(handle)?;
        check_stage(stage)?;
        Err(Error::Unsupported)
    }

    pub fn context(&self, handle: usize) -> Result<Context, Error> {
        Ok(self.record(handle)?.tuning.lock().context)
    }

    pub fn engine_state(&self, handle: usize) -> Result<EngineState, Error> {
        Ok(self.slot(handle)?.engine.state())
    }

    /// Starts streaming. Returns before the first block is read.
    pub fn start(&self, handle: usize) -> Result<(), Error> {
        self.slot(handle)?.engine.start()
    }

    /// Blocks until the device isn't streaming anymore, e.g. because a
    /// [`ReplayDevice`][crate::ReplayDevice] reached the end of its recording.
    pub fn wait_idle(&self, handle: usize) -> Result<(), Error> {
        self.slot(handle)?.engine.wait_idle();
        Ok(())
    }

    /// Stops streaming. The streaming thread might still be inside the read
    /// when this returns, but it won't deliver any more blocks.
    pub fn stop(&self, handle: usize) -> Result<(), Error> {
        self.slot(handle)?.engine.stop();
        Ok(())
    }
}

#[cfg(feature = "librtlsdr")]
impl Registry<crate::RtlSdr> {
    /// Opens every attached RTL-SDR. Devices that can't be opened are skipped.
    pub fn open_all(sink: impl SampleSink, config: &Config) -> Self {
        let mut records = vec![];
        for info in crate::devices() {
            let device = match info.open() {
                Ok(device) => device,
                Err(error) => {
                    tracing::warn!(index = info.index(), name = info.device_name(), ?error, "can't open device");
                    continue;
                }
            };
            match DeviceRecord::open(records.len(), device) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(index = info.index(), name = info.device_name(), ?error, "can't initialize device");
                }
            }
        }
        Self::from_records(records, Arc::new(sink), config)
    }
}

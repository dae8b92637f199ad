use std::{
    fmt::Debug,
    fs::File,
    io::{
        BufReader,
        ErrorKind,
        Read,
    },
    path::Path,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;

use crate::{
    Device,
    Error,
    TunerGainMode,
    TunerType,
    calibration,
};

/// Gain steps of an R820T, as reported by librtlsdr.
const R820T_GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372,
    386, 402, 421, 434, 439, 445, 480, 496,
];

/// A [`Device`] that plays back recorded unsigned 8 bit IQ samples (`cu8`, as
/// written by `rtl_sdr`).
///
/// Every setting is accepted and stored, but doesn't change the samples.
/// Reading stops at the end of the recording.
pub struct ReplayDevice<R> {
    reader: Mutex<R>,
    tuner_type: TunerType,
    tuner_gains: Vec<i32>,
    serial: Option<String>,
    paced: bool,
    settings: Mutex<Settings>,
    cancelled: AtomicBool,
}

impl<R> Debug for ReplayDevice<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDevice")
            .field("tuner_type", &self.tuner_type)
            .field("serial", &self.serial)
            .field("paced", &self.paced)
            .field("settings", &*self.settings.lock())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
struct Settings {
    center_frequency: u32,
    sample_rate: u32,
    tuner_gain: i32,
    tuner_gain_mode: TunerGainMode,
}

impl ReplayDevice<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read + Send + 'static> ReplayDevice<R> {
    /// Creates a replay device that presents itself as an R820T.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
            tuner_type: TunerType::R820T,
            tuner_gains: R820T_GAINS.to_vec(),
            serial: None,
            paced: false,
            settings: Mutex::new(Settings {
                center_frequency: 0,
                sample_rate: calibration::preferred_sample_rate(),
                tuner_gain: 0,
                tuner_gain_mode: TunerGainMode::Auto,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn with_tuner(mut self, tuner_type: TunerType, tuner_gains: Vec<i32>) -> Self {
        self.tuner_type = tuner_type;
        self.tuner_gains = tuner_gains;
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Deliver blocks at the configured sample rate instead of as fast as
    /// possible.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Fills `buffer` as far as possible. Returns less only at the end of the
    /// recording.
    fn fill(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut reader = self.reader.lock();
        let mut filled = 0;
        while filled < buffer.len() {
            match reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    tracing::error!(?error, "replay read failed");
                    return Err(Error::from_lib("read", -1));
                }
            }
        }
        Ok(filled)
    }
}

impl<R: Read + Send + 'static> Device for ReplayDevice<R> {
    fn tuner_type(&self) -> TunerType {
        self.tuner_type
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }

    fn tuner_gains(&self) -> Vec<i32> {
        self.tuner_gains.clone()
    }

    fn get_center_frequency(&self) -> Result<u32, Error> {
        Ok(self.settings.lock().center_frequency)
    }

    fn set_center_frequency(&self, frequency: u32) -> Result<(), Error> {
        tracing::trace!(frequency, "replay: set center frequency");
        self.settings.lock().center_frequency = frequency;
        Ok(())
    }

    fn get_sample_rate(&self) -> Result<u32, Error> {
        Ok(self.settings.lock().sample_rate)
    }

    fn set_sample_rate(&self, sample_rate: u32) -> Result<(), Error> {
        if sample_rate == 0 {
            return Err(Error::from_lib("set_sample_rate", -22));
        }
        tracing::trace!(sample_rate, "replay: set sample rate");
        self.settings.lock().sample_rate = sample_rate;
        Ok(())
    }

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<(), Error> {
        self.settings.lock().tuner_gain_mode = mode;
        Ok(())
    }

    fn get_tuner_gain(&self) -> Result<i32, Error> {
        Ok(self.settings.lock().tuner_gain)
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<(), Error> {
        let mut settings = self.settings.lock();
        if settings.tuner_gain_mode != TunerGainMode::Manual {
            return Err(Error::from_lib("set_tuner_gain", -1));
        }
        settings.tuner_gain = gain;
        Ok(())
    }

    fn set_agc_mode(&self, enable: bool) -> Result<(), Error> {
        tracing::trace!(enable, "replay: set agc mode");
        Ok(())
    }

    fn reset_buffer(&self) -> Result<(), Error> {
        self.cancelled.store(false, Ordering::Release);
        Ok(())
    }

    fn read_async(
        &self,
        block_size: usize,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<(), Error> {
        let mut buffer = vec![0u8; block_size];
        let mut deadline = Instant::now();

        while !self.cancelled.load(Ordering::Acquire) {
            let filled = self.fill(&mut buffer)?;
            if filled == 0 {
                tracing::debug!("end of recording");
                break;
            }

            callback(&buffer[..filled]);

            if self.paced {
                let sample_rate = self.settings.lock().sample_rate;
                deadline += Duration::from_secs_f64((filled / 2) as f64 / f64::from(sample_rate));
                if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
        }

        Ok(())
    }

    fn cancel_async(&self) -> Result<(), Error> {
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }
}

//! Scripted device for unit tests.

use std::{
    collections::VecDeque,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::{
    Condvar,
    Mutex,
};

use crate::{
    Device,
    Error,
    TunerGainMode,
    TunerType,
};

#[derive(Debug, Default)]
pub struct Hardware {
    pub center_frequency: u32,
    pub sample_rate: u32,
    pub tuner_gain: i32,
    pub tuner_gain_mode: Option<TunerGainMode>,
    pub agc: Option<bool>,
    pub buffer_resets: usize,
    pub cancels: usize,
}

#[derive(Debug, Default)]
struct Stream {
    blocks: VecDeque<Vec<u8>>,
    reading: bool,
    cancel_pending: bool,
    sessions: usize,
}

/// A device whose hardware state can be inspected and whose failures and
/// sample blocks are scripted by the test.
///
/// A cancel that arrives before the read started is delivered once it
/// starts, unless the buffer is reset in between.
#[derive(Debug)]
pub struct MockDevice {
    pub tuner_type: TunerType,
    pub gains: Vec<i32>,
    pub hardware: Mutex<Hardware>,
    pub reject_sample_rate: AtomicBool,
    pub reject_center_frequency: AtomicBool,
    pub reject_gain_mode: AtomicBool,
    pub reject_tuner_gain: AtomicBool,
    pub fail_read: AtomicBool,
    stream: Mutex<Stream>,
    stream_changed: Condvar,
}

impl MockDevice {
    pub fn new(gains: Vec<i32>) -> Self {
        Self {
            tuner_type: TunerType::R820T,
            gains,
            hardware: Mutex::default(),
            reject_sample_rate: AtomicBool::new(false),
            reject_center_frequency: AtomicBool::new(false),
            reject_gain_mode: AtomicBool::new(false),
            reject_tuner_gain: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
            stream: Mutex::default(),
            stream_changed: Condvar::new(),
        }
    }

    /// Queues a raw block for the running (or next) read.
    pub fn feed(&self, block: Vec<u8>) {
        let mut stream = self.stream.lock();
        stream.blocks.push_back(block);
        self.stream_changed.notify_all();
    }

    pub fn is_reading(&self) -> bool {
        self.stream.lock().reading
    }

    pub fn sessions(&self) -> usize {
        self.stream.lock().sessions
    }
}

impl Device for MockDevice {
    fn tuner_type(&self) -> TunerType {
        self.tuner_type
    }

    fn serial(&self) -> Option<String> {
        Some("00000001".to_owned())
    }

    fn tuner_gains(&self) -> Vec<i32> {
        self.gains.clone()
    }

    fn get_center_frequency(&self) -> Result<u32, Error> {
        Ok(self.hardware.lock().center_frequency)
    }

    fn set_center_frequency(&self, frequency: u32) -> Result<(), Error> {
        if self.reject_center_frequency.load(Ordering::SeqCst) {
            return Err(Error::from_lib("set_center_frequency", -1));
        }
        self.hardware.lock().center_frequency = frequency;
        Ok(())
    }

    fn get_sample_rate(&self) -> Result<u32, Error> {
        Ok(self.hardware.lock().sample_rate)
    }

    fn set_sample_rate(&self, sample_rate: u32) -> Result<(), Error> {
        if self.reject_sample_rate.load(Ordering::SeqCst) {
            return Err(Error::from_lib("set_sample_rate", -22));
        }
        self.hardware.lock().sample_rate = sample_rate;
        Ok(())
    }

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<(), Error> {
        if self.reject_gain_mode.load(Ordering::SeqCst) {
            return Err(Error::from_lib("set_tuner_gain_mode", -1));
        }
        self.hardware.lock().tuner_gain_mode = Some(mode);
        Ok(())
    }

    fn get_tuner_gain(&self) -> Result<i32, Error> {
        Ok(self.hardware.lock().tuner_gain)
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<(), Error> {
        if self.reject_tuner_gain.load(Ordering::SeqCst) {
            return Err(Error::from_lib("set_tuner_gain", -1));
        }
        self.hardware.lock().tuner_gain = gain;
        Ok(())
    }

    fn set_agc_mode(&self, enable: bool) -> Result<(), Error> {
        self.hardware.lock().agc = Some(enable);
        Ok(())
    }

    fn reset_buffer(&self) -> Result<(), Error> {
        self.hardware.lock().buffer_resets += 1;
        self.stream.lock().cancel_pending = false;
        Ok(())
    }

    fn read_async(
        &self,
        _block_size: usize,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<(), Error> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(Error::from_lib("read_async", -5));
        }

        let mut stream = self.stream.lock();
        stream.reading = true;
        stream.sessions += 1;
        self.stream_changed.notify_all();

        loop {
            if stream.cancel_pending {
                stream.cancel_pending = false;
                break;
            }
            if let Some(block) = stream.blocks.pop_front() {
                parking_lot::MutexGuard::unlocked(&mut stream, || callback(block.as_slice()));
            }
            else {
                self.stream_changed.wait(&mut stream);
            }
        }

        stream.reading = false;
        self.stream_changed.notify_all();
        Ok(())
    }

    fn cancel_async(&self) -> Result<(), Error> {
        self.hardware.lock().cancels += 1;
        let mut stream = self.stream.lock();
        stream.cancel_pending = true;
        self.stream_changed.notify_all();
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after a generous timeout.
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

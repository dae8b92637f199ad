//! The per device streaming thread.
//!
//! Each device has one thread that sleeps on a start gate until it is armed,
//! then runs the blocking read of the device and pushes converted blocks into
//! the sink. When the read returns the thread goes back to sleep.

use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::{
        self,
        JoinHandle,
    },
};

use num_complex::Complex32;
use parking_lot::{
    Condvar,
    Mutex,
};

use crate::{
    Device,
    Error,
    IqSample,
    Push,
    SampleBlock,
    SampleSink,
    dc_filter::DcBlocker,
    registry::DeviceRecord,
};

/// Lifecycle of a streaming thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Waiting for a start.
    Idle,
    /// Started, but the read hasn't begun yet.
    Armed,
    /// Inside the blocking read.
    Streaming,
}

#[derive(Debug)]
struct Gate {
    state: EngineState,
    /// A start arrived while streaming. The thread arms itself again once
    /// the current read returns.
    rearm: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    stop: AtomicBool,
}

#[derive(derive_more::Debug)]
pub(crate) struct Engine<D: Device> {
    #[debug(skip)]
    record: Arc<DeviceRecord<D>>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl<D: Device> Engine<D> {
    pub fn spawn(
        record: Arc<DeviceRecord<D>>,
        sink: Arc<dyn SampleSink>,
        block_size: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate {
                state: EngineState::Idle,
                rearm: false,
                shutdown: false,
            }),
            gate_changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let thread = thread::spawn({
            let record = record.clone();
            let shared = shared.clone();
            move || streaming_thread(record, shared, sink, block_size)
        });

        Self {
            record,
            shared,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.gate.lock().state
    }

    /// Blocks until the streaming thread is idle.
    pub fn wait_idle(&self) {
        let mut gate = self.shared.gate.lock();
        while gate.state != EngineState::Idle {
            self.shared.gate_changed.wait(&mut gate);
        }
    }

    /// Arms the streaming thread. Returns before streaming has begun.
    pub fn start(&self) -> Result<(), Error> {
        self.shared.stop.store(false, Ordering::Release);
        self.record.device.reset_buffer()?;

        let mut gate = self.shared.gate.lock();
        match gate.state {
            EngineState::Idle => gate.state = EngineState::Armed,
            EngineState::Armed => {}
            EngineState::Streaming => gate.rearm = true,
        }
        tracing::debug!(device = self.record.index, state = ?gate.state, "start");
        self.shared.gate_changed.notify_all();
        Ok(())
    }

    /// Asks the streaming thread to stop. Blocks that arrive until the read
    /// has actually returned are discarded.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);

        let streaming = {
            let mut gate = self.shared.gate.lock();
            gate.rearm = false;
            tracing::debug!(device = self.record.index, state = ?gate.state, "stop");
            match gate.state {
                EngineState::Idle => false,
                EngineState::Armed => {
                    gate.state = EngineState::Idle;
                    self.shared.gate_changed.notify_all();
                    false
                }
                EngineState::Streaming => true,
            }
        };

        if streaming {
            // the read might not have started yet. the thread cancels again
            // when it sees the stop flag in the next block.
            if let Err(error) = self.record.device.cancel_async() {
                tracing::warn!(device = self.record.index, ?error, "cancel failed");
            }
        }
    }
}

impl<D: Device> Drop for Engine<D> {
    fn drop(&mut self) {
        let streaming = {
            let mut gate = self.shared.gate.lock();
            gate.shutdown = true;
            gate.rearm = false;
            self.shared.stop.store(true, Ordering::Release);
            self.shared.gate_changed.notify_all();
            gate.state == EngineState::Streaming
        };

        if streaming {
            if let Err(error) = self.record.device.cancel_async() {
                tracing::warn!(device = self.record.index, ?error, "cancel failed");
            }
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(device = self.record.index, "streaming thread panicked");
            }
        }
    }
}

fn streaming_thread<D: Device>(
    record: Arc<DeviceRecord<D>>,
    shared: Arc<Shared>,
    sink: Arc<dyn SampleSink>,
    block_size: usize,
) {
    let _guard = tracing::debug_span!("streaming thread", device = record.index).entered();
    tracing::debug!("streaming thread spawned");

    // the filter state lives as long as the thread, so it carries over from one
    // streaming session to the next.
    let mut converter = Converter::default();

    loop {
        {
            let mut gate = shared.gate.lock();
            while gate.state != EngineState::Armed && !gate.shutdown {
                shared.gate_changed.wait(&mut gate);
            }
            if gate.shutdown {
                break;
            }
            gate.state = EngineState::Streaming;
            gate.rearm = false;
        }

        tracing::debug!(block_size, "streaming");

        let mut cancelled = false;
        let result = record.device.read_async(block_size, &mut |bytes: &[u8]| {
            if shared.stop.load(Ordering::Acquire) {
                if !cancelled {
                    cancelled = true;
                    if let Err(error) = record.device.cancel_async() {
                        tracing::warn!(?error, "cancel failed");
                    }
                }
                return;
            }
            converter.convert(&record, &*sink, bytes);
        });

        match result {
            Ok(()) => tracing::debug!("read returned"),
            Err(error) => tracing::error!(?error, "read failed"),
        }

        let mut gate = shared.gate.lock();
        gate.state = if gate.rearm && !gate.shutdown {
            EngineState::Armed
        }
        else {
            EngineState::Idle
        };
        gate.rearm = false;
        shared.gate_changed.notify_all();
    }

    tracing::debug!("shutting down");
}

/// Converts raw blocks and hands them to the sink.
#[derive(Debug, Default)]
struct Converter {
    filter: DcBlocker,
    /// Buffer of the last block the sink gave back.
    spare: Vec<Complex32>,
}

impl Converter {
    fn convert<D>(&mut self, record: &DeviceRecord<D>, sink: &dyn SampleSink, bytes: &[u8]) {
        let raw = IqSample::from_bytes(bytes);

        let mut samples = std::mem::take(&mut self.spare);
        samples.clear();
        if let Err(error) = samples.try_reserve_exact(raw.len()) {
            tracing::warn!(?error, samples = raw.len(), "can't allocate sample block. dropping it");
            self.spare = samples;
            return;
        }

        self.filter.process_raw(raw, &mut samples);

        let (device_id, context) = record.snapshot();
        let block = SampleBlock::new(samples, 1, context);
        match sink.push(device_id.as_deref(), block) {
            Push::Taken => {}
            Push::Released(block) => self.spare = block.into_samples(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        Context,
        testing::{
            MockDevice,
            wait_for,
        },
    };

    const GAINS: [i32; 5] = [0, 9, 20, 25, 30];

    struct Collected {
        blocks: Mutex<Vec<(Option<String>, SampleBlock)>>,
    }

    fn engine_with_sink(
        sink: impl SampleSink,
    ) -> (Engine<MockDevice>, Arc<DeviceRecord<MockDevice>>) {
        let record =
            Arc::new(DeviceRecord::open(0, MockDevice::new(GAINS.to_vec())).unwrap());
        let engine = Engine::spawn(record.clone(), Arc::new(sink), 512);
        (engine, record)
    }

    fn collecting_engine() -> (
        Engine<MockDevice>,
        Arc<DeviceRecord<MockDevice>>,
        Arc<Collected>,
    ) {
        let collected = Arc::new(Collected {
            blocks: Mutex::new(vec![]),
        });
        let (engine, record) = engine_with_sink({
            let collected = collected.clone();
            move |device_id: Option<&str>, block: SampleBlock| {
                collected
                    .blocks
                    .lock()
                    .push((device_id.map(ToOwned::to_owned), block));
                Push::Taken
            }
        });
        (engine, record, collected)
    }

    fn received(collected: &Collected) -> usize {
        collected.blocks.lock().len()
    }

    #[test]
    fn idle_until_started() {
        let (engine, record, collected) = collecting_engine();
        assert_eq!(engine.state(), EngineState::Idle);

        record.device.feed(vec![127; 8]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(received(&collected), 0);
        assert_eq!(record.device.sessions(), 0);
    }

    #[test]
    fn delivers_converted_blocks_with_context() {
        let (engine, record, collected) = collecting_engine();
        record.set_identity("rx0");
        record.device.feed(vec![254, 0, 254, 0, 127]);

        engine.start().unwrap();
        wait_for("block", || received(&collected) == 1);
        assert_eq!(engine.state(), EngineState::Streaming);

        let blocks = collected.blocks.lock();
        let (device_id, block) = &blocks[0];
        assert_eq!(device_id.as_deref(), Some("rx0"));
        assert_eq!(block.channels, 1);
        assert_eq!(block.len(), 2);
        assert_eq!(block.samples()[0], Complex32::new(1.0, -1.0));
        assert_eq!(
            block.context,
            Context {
                version: 0,
                center_frequency: 25_000_000,
                sample_rate: 1_024_000,
            }
        );
    }

    #[test]
    fn filter_state_carries_over_blocks() {
        let (engine, record, collected) = collecting_engine();
        record.device.feed(vec![254, 254]);
        record.device.feed(vec![254, 254]);

        engine.start().unwrap();
        wait_for("blocks", || received(&collected) == 2);

        let blocks = collected.blocks.lock();
        assert_eq!(blocks[0].1.samples()[0], Complex32::new(1.0, 1.0));
        // same input again: only the decayed previous output is left
        let second = blocks[1].1.samples()[0];
        assert!((second.re - crate::dc_filter::ALPHA).abs() < 1e-6);
    }

    #[test]
    fn stop_returns_to_idle_and_discards() {
        let (engine, record, collected) = collecting_engine();
        engine.start().unwrap();
        wait_for("read", || record.device.is_reading());

        engine.stop();
        wait_for("idle", || engine.state() == EngineState::Idle);
        assert!(!record.device.is_reading());

        record.device.feed(vec![127; 8]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(received(&collected), 0);
    }

    #[test]
    fn blocks_after_lost_cancel_are_discarded() {
        let (engine, record, collected) = collecting_engine();
        engine.start().unwrap();
        wait_for("read", || record.device.is_reading());

        // a stop whose cancel never reached the running read
        engine.shared.stop.store(true, Ordering::Release);
        record.device.feed(vec![127; 8]);
        record.device.feed(vec![127; 8]);
        wait_for("idle", || engine.state() == EngineState::Idle);

        assert!(!record.device.is_reading());
        assert_eq!(received(&collected), 0);
        assert_eq!(record.device.hardware.lock().cancels, 1);
    }

    #[test]
    fn stop_while_idle_does_nothing() {
        let (engine, record, _collected) = collecting_engine();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(record.device.hardware.lock().cancels, 0);
    }

    #[test]
    fn stop_while_armed_withdraws_start() {
        let (engine, record, _collected) = collecting_engine();
        {
            // pretend the thread hasn't picked up the start yet
            let mut gate = engine.shared.gate.lock();
            gate.state = EngineState::Armed;
        }
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(record.device.hardware.lock().cancels, 0);
    }

    #[test]
    fn restart_after_stop() {
        let (engine, record, collected) = collecting_engine();
        engine.start().unwrap();
        wait_for("read", || record.device.is_reading());
        engine.stop();
        wait_for("idle", || engine.state() == EngineState::Idle);

        engine.start().unwrap();
        wait_for("second read", || record.device.sessions() == 2);
        record.device.feed(vec![127; 4]);
        wait_for("block", || received(&collected) == 1);
        assert!(record.device.hardware.lock().buffer_resets >= 2);
    }

    #[test]
    fn released_buffers_are_reused() {
        let addresses = Arc::new(Mutex::new(vec![]));
        let (engine, record) = engine_with_sink({
            let addresses = addresses.clone();
            move |_: Option<&str>, block: SampleBlock| {
                addresses.lock().push(block.samples().as_ptr() as usize);
                Push::Released(block)
            }
        });

        record.device.feed(vec![127; 64]);
        record.device.feed(vec![127; 64]);
        record.device.feed(vec![127; 32]);
        engine.start().unwrap();
        wait_for("blocks", || addresses.lock().len() == 3);

        let addresses = addresses.lock();
        assert_eq!(addresses[0], addresses[1]);
        assert_eq!(addresses[1], addresses[2]);
    }

    #[test]
    fn taken_blocks_are_left_alone() {
        let (engine, record, collected) = collecting_engine();
        record.device.feed(vec![254; 16]);
        record.device.feed(vec![0; 16]);
        engine.start().unwrap();
        wait_for("blocks", || received(&collected) == 2);

        let blocks = collected.blocks.lock();
        assert_ne!(blocks[0].1.samples().as_ptr(), blocks[1].1.samples().as_ptr());
        assert_eq!(blocks[0].1.samples()[0], Complex32::new(1.0, 1.0));
        assert_eq!(blocks[0].1.len(), 8);
    }

    #[test]
    fn wait_idle_returns_after_stop() {
        let (engine, record, _collected) = collecting_engine();
        let engine = Arc::new(engine);
        engine.start().unwrap();
        wait_for("read", || record.device.is_reading());

        let waiter = std::thread::spawn({
            let engine = engine.clone();
            move || engine.wait_idle()
        });
        engine.stop();
        waiter.join().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn failed_read_returns_to_idle() {
        let (engine, record, _collected) = collecting_engine();
        record
            .device
            .fail_read
            .store(true, std::sync::atomic::Ordering::SeqCst);
        engine.start().unwrap();
        wait_for("idle", || engine.state() == EngineState::Idle);
    }

    #[test]
    fn drop_joins_streaming_thread() {
        let (engine, record, _collected) = collecting_engine();
        engine.start().unwrap();
        wait_for("read", || record.device.is_reading());

        drop(engine);
        assert!(!record.device.is_reading());
        assert_eq!(Arc::strong_count(&record), 1);
    }
}

//! Delivery of converted samples to the host.
//!
//! Every streaming thread hands its blocks to a [`SampleSink`]. The sink
//! decides who owns the block afterwards: it either keeps it
//! ([`Push::Taken`]) or hands it back ([`Push::Released`]), in which case the
//! streaming thread reuses its allocation for the next block.

use std::{
    pin::Pin,
    task::{
        Context as TaskContext,
        Poll,
    },
};

use futures_core::Stream;
use num_complex::Complex32;
use tokio::sync::mpsc::{
    self,
    error::TrySendError,
};

use crate::Context;

/// A block of DC-free complex samples.
#[derive(Clone, derive_more::Debug)]
pub struct SampleBlock {
    #[debug(skip)]
    pub(crate) samples: Vec<Complex32>,
    /// Number of interleaved channels. Always 1 for an RTL-SDR.
    pub channels: usize,
    /// Tuning context the samples were taken with.
    pub context: Context,
}

impl SampleBlock {
    pub fn new(samples: Vec<Complex32>, channels: usize, context: Context) -> Self {
        Self {
            samples,
            channels,
            context,
        }
    }

    pub fn samples(&self) -> &[Complex32] {
        &self.samples
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<Complex32> {
        self.samples
    }
}

/// Outcome of [`SampleSink::push`].
#[derive(Debug)]
#[must_use]
pub enum Push {
    /// The sink keeps the block.
    Taken,
    /// The sink is done with the block and gives it back to the producer.
    Released(SampleBlock),
}

/// Receives sample blocks from the streaming threads.
///
/// `push` is called on the streaming thread of the device, so it should
/// return quickly. Blocks of different devices may be pushed concurrently.
///
/// Closures with the same signature are sinks:
///
/// ```
/// # use rtlsdr_node::{Push, SampleBlock};
/// let sink = |device_id: Option<&str>, block: SampleBlock| {
///     println!("{device_id:?}: {} samples", block.len());
///     Push::Released(block)
/// };
/// # let _: &dyn rtlsdr_node::SampleSink = &sink;
/// ```
pub trait SampleSink: Send + Sync + 'static {
    fn push(&self, device_id: Option<&str>, block: SampleBlock) -> Push;
}

impl<F> SampleSink for F
where
    F: Fn(Option<&str>, SampleBlock) -> Push + Send + Sync + 'static,
{
    fn push(&self, device_id: Option<&str>, block: SampleBlock) -> Push {
        self(device_id, block)
    }
}

/// A block together with the identifier of the device that produced it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub device_id: Option<String>,
    pub block: SampleBlock,
}

/// Creates a bounded channel that can be used as a [`SampleSink`].
///
/// If the receiving side falls behind, blocks are dropped instead of stalling
/// the streaming threads.
pub fn channel(capacity: usize) -> (ChannelSink, SampleStream) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ChannelSink { sender }, SampleStream { receiver })
}

/// Sending half of [`channel`].
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<Delivery>,
}

impl SampleSink for ChannelSink {
    fn push(&self, device_id: Option<&str>, block: SampleBlock) -> Push {
        let delivery = Delivery {
            device_id: device_id.map(ToOwned::to_owned),
            block,
        };
        match self.sender.try_send(delivery) {
            Ok(()) => Push::Taken,
            Err(TrySendError::Full(delivery)) => {
                tracing::debug!(device_id = ?delivery.device_id, "sample channel full. dropping block");
                Push::Released(delivery.block)
            }
            Err(TrySendError::Closed(delivery)) => {
                tracing::trace!(device_id = ?delivery.device_id, "sample channel closed");
                Push::Released(delivery.block)
            }
        }
    }
}

/// Receiving half of [`channel`].
#[derive(Debug)]
pub struct SampleStream {
    receiver: mpsc::Receiver<Delivery>,
}

impl SampleStream {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Blocking receive for use outside of an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Delivery> {
        self.receiver.blocking_recv()
    }
}

impl Stream for SampleStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

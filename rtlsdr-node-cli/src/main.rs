use std::{
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use color_eyre::eyre::{
    Error,
    bail,
};
use futures_util::StreamExt;
use rtlsdr_node::{
    Config,
    Context,
    Device,
    Registry,
    ReplayDevice,
    sink::{
        self,
        SampleStream,
    },
};

#[derive(Debug, Parser)]
struct Args {
    /// Play back a recording of unsigned 8 bit IQ samples instead of using
    /// attached RTL-SDRs.
    #[clap(short, long, env = "RTLSDR_NODE_INPUT")]
    input: Option<PathBuf>,

    /// Deliver replayed samples at the sample rate.
    #[clap(long, env = "RTLSDR_NODE_PACED")]
    paced: bool,

    /// Handle of the device to stream from.
    #[clap(short, long, env = "RTLSDR_NODE_DEVICE", default_value = "0")]
    device: usize,

    /// Identifier blocks of the device are tagged with.
    #[clap(long, env = "RTLSDR_NODE_ID")]
    id: Option<String>,

    /// Frequency to tune to, in Hz
    #[clap(short, long, env = "RTLSDR_NODE_FREQUENCY")]
    frequency: Option<i64>,

    /// Gain in dB
    #[clap(short, long, env = "RTLSDR_NODE_GAIN")]
    gain: Option<f32>,

    /// Sample rate in Hz
    #[clap(short, long, env = "RTLSDR_NODE_SAMPLE_RATE")]
    samplerate: Option<u32>,

    /// Size of raw blocks read from the device, in bytes
    #[clap(long, env = "RTLSDR_NODE_BLOCK_SIZE")]
    block_size: Option<usize>,

    /// Number of blocks the host side may buffer
    #[clap(long, default_value = "32")]
    queue_size: usize,

    /// Only print the device metadata.
    #[clap(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(block_size) = args.block_size {
        config = config.with_block_size(block_size);
    }
    let (sink, stream) = sink::channel(args.queue_size);

    if let Some(input) = &args.input {
        let device = ReplayDevice::open(input)?.paced(args.paced);
        let registry = Registry::new([device], sink, &config)?;
        run(&args, registry, stream).await
    }
    else {
        open_hardware(&args, sink, stream, &config).await
    }
}

#[cfg(feature = "librtlsdr")]
async fn open_hardware(
    args: &Args,
    sink: sink::ChannelSink,
    stream: SampleStream,
    config: &Config,
) -> Result<(), Error> {
    let registry = Registry::open_all(sink, config);
    run(args, registry, stream).await
}

#[cfg(not(feature = "librtlsdr"))]
async fn open_hardware(
    _args: &Args,
    _sink: sink::ChannelSink,
    _stream: SampleStream,
    _config: &Config,
) -> Result<(), Error> {
    bail!("built without librtlsdr support. use --input to play back a recording");
}

async fn run<D: Device>(
    args: &Args,
    registry: Registry<D>,
    mut stream: SampleStream,
) -> Result<(), Error> {
    if registry.count() == 0 {
        bail!("no devices found");
    }

    for handle in 0..registry.count() {
        let metadata = registry.metadata(handle)?;
        println!(
            "#{handle}: {} (serial: {}), {}..={} Hz, gain: {}",
            metadata.name,
            metadata.serial.as_deref().unwrap_or("-"),
            metadata.frequency_range.start(),
            metadata.frequency_range.end(),
            metadata
                .gain_range
                .map(|range| format!("{:.1}..={:.1} dB", range.min, range.max))
                .unwrap_or_else(|| "-".to_owned()),
        );
    }
    if args.list {
        return Ok(());
    }

    let handle = args.device;
    if let Some(id) = &args.id {
        registry.assign_identity(handle, id)?;
    }
    if let Some(frequency) = args.frequency {
        registry.set_center_frequency(handle, frequency)?;
    }
    if let Some(sample_rate) = args.samplerate {
        registry.set_sample_rate(handle, sample_rate)?;
    }
    if let Some(gain) = args.gain {
        registry.set_gain(handle, 0, gain)?;
    }
    tracing::info!(
        center_frequency = registry.center_frequency(handle)?,
        sample_rate = registry.sample_rate(handle)?,
        gain = registry.gain(handle, 0)?,
        "configured"
    );

    let registry = Arc::new(registry);
    registry.start(handle)?;

    // the stream ends when the sink is dropped with the registry.
    let reader = tokio::spawn(report(stream));
    let waiter = tokio::task::spawn_blocking({
        let registry = registry.clone();
        move || registry.wait_idle(handle)
    });

    tokio::select! {
        result = waiter => {
            result??;
            tracing::info!("streaming ended");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("stopping");
            registry.stop(handle)?;
        }
    }

    drop(registry);
    reader.await?;
    Ok(())
}

/// Prints the power of every second of samples.
async fn report(mut stream: SampleStream) {
    let mut context: Option<Context> = None;
    let mut power_sum = 0.0;
    let mut num_samples = 0u32;

    while let Some(delivery) = stream.next().await {
        let block = delivery.block;
        if context.is_none_or(|context| context.version != block.context.version) {
            println!(
                "{}: context v{}: {} Hz at {} S/s",
                delivery.device_id.as_deref().unwrap_or("-"),
                block.context.version,
                block.context.center_frequency,
                block.context.sample_rate,
            );
            context = Some(block.context);
            power_sum = 0.0;
            num_samples = 0;
        }

        for sample in block.samples() {
            power_sum += sample.norm_sqr();
            num_samples += 1;

            if num_samples >= block.context.sample_rate {
                let db = 10.0 * (power_sum / num_samples as f32).log10();
                println!("{db:.4} dBFS");
                power_sum = 0.0;
                num_samples = 0;
            }
        }
    }
}

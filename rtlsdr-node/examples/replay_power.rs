use std::{
    error::Error,
    path::PathBuf,
};

use clap::Parser;
use futures_util::StreamExt;
use rtlsdr_node::{
    Config,
    Registry,
    ReplayDevice,
    sink,
};

/// Plays back a cu8 recording and prints its power once per second of samples.
#[derive(Debug, Parser)]
struct Args {
    /// Recording of unsigned 8 bit IQ samples, as written by `rtl_sdr`
    input: PathBuf,

    #[clap(short, long = "samplerate", default_value = "2048000")]
    sample_rate: u32,

    /// Deliver samples at the sample rate instead of as fast as possible
    #[clap(short, long)]
    paced: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let device = ReplayDevice::open(&args.input)?.paced(args.paced);
    let (sink, mut stream) = sink::channel(16);
    let registry = Registry::new([device], sink, &Config::default())?;

    registry.set_sample_rate(0, args.sample_rate)?;
    let sample_rate = registry.sample_rate(0)?;
    registry.start(0)?;

    // dropping the registry drops the sink, which ends the stream.
    std::thread::spawn(move || {
        let _ = registry.wait_idle(0);
        drop(registry);
    });

    // this is really a measure of energy
    let mut power_sum = 0.0;

    let mut num_samples = 0;
    while let Some(delivery) = stream.next().await {
        for sample in delivery.block.samples() {
            power_sum += sample.norm_sqr();
            num_samples += 1;

            if num_samples == sample_rate {
                // average power (this is now a proper power measure)
                let power_avg = power_sum / num_samples as f32;

                // convert to dBFS
                let db = 10.0 * power_avg.log10();
                println!("{db:.4} dBFS");

                power_sum = 0.0;
                num_samples = 0;
            }
        }
    }

    Ok(())
}

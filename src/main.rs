//! Small CLI demo: connect to one device, run a single capture, print a
//! summary of the decoded channels. Not part of the core driver contract —
//! embedding hosts are expected to build their own surface on top of
//! [`pla_core`].

use std::process::exit;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;

use pla_core::engine::CaptureOutcome;
use pla_core::logging::init_logging;
use pla_core::session::{CaptureSession, TriggerType};
use pla_core::{DriverError, LogicAnalyzer, Result};

#[derive(Parser, Debug)]
#[command(name = "pla-demo", about = "Connect to a logic analyzer and run one capture")]
struct Args {
    /// Connection string: `HOST:PORT` for network, a device path for serial.
    connection: String,
    /// Sample frequency in Hz.
    #[arg(long, default_value_t = 1_000_000)]
    frequency: u32,
    /// Pre-trigger sample count.
    #[arg(long, default_value_t = 100)]
    pre: u32,
    /// Post-trigger sample count.
    #[arg(long, default_value_t = 900)]
    post: u32,
    /// Comma-separated channel numbers to capture.
    #[arg(long, default_value = "0,1,2")]
    channels: String,
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let channels: Vec<u8> = args
        .channels
        .split(',')
        .map(|s| s.trim().parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| DriverError::Config(format!("invalid --channels value '{}'", args.channels)))?;

    println!("Connecting to {}...", args.connection);
    let device = LogicAnalyzer::open(&args.connection)?;
    let info = device.device_info();
    println!(
        "Connected: firmware {} ({} channels, max {} Hz, buffer {} samples)",
        info.version, info.channel_count, info.max_frequency, info.buffer_size
    );

    let session = CaptureSession {
        frequency: args.frequency,
        pre_trigger_samples: args.pre,
        post_trigger_samples: args.post,
        loop_count: 0,
        measure_bursts: false,
        trigger_type: TriggerType::Edge,
        trigger_channel: 0,
        trigger_inverted: false,
        trigger_bit_count: 0,
        trigger_pattern: 0,
        capture_channels: channels,
    };

    println!("Starting capture...");
    let (tx, rx) = mpsc::channel::<CaptureOutcome>();
    device.start_capture(session, move |outcome| {
        let _ = tx.send(outcome);
    })?;

    let outcome = rx
        .recv_timeout(Duration::from_secs(90))
        .map_err(|_| DriverError::Timeout("demo capture did not complete in time".into()))?;

    if !outcome.success {
        let err = outcome
            .error
            .unwrap_or_else(|| DriverError::Hardware("capture failed with no reported error".into()));
        return Err(err);
    }

    let result = outcome.result.expect("successful outcome carries a result");
    for (channel, bits) in &result.channels {
        println!("channel {channel}: {} samples", bits.len());
    }
    if let Some(bursts) = &result.bursts {
        println!("{} bursts reconstructed", bursts.len());
        for (i, burst) in bursts.iter().enumerate() {
            println!(
                "  burst {i}: [{}, {}) gap {} ns ({} samples)",
                burst.burst_sample_start, burst.burst_sample_end, burst.burst_time_gap, burst.burst_sample_gap
            );
        }
    }

    Ok(())
}

// Capture and decode example
//
// This example feeds a UART waveform into the simulated analyzer, captures it
// and runs the UART decoder over the captured channel.

use clap::Parser;
use logic_analyzer_rs::decoders::{DecoderOptionValue, OptionValue};
use logic_analyzer_rs::{
    AnalyzerDriver, CaptureSession, ConnectionParams, DecoderRegistry, DriverType,
    LogicAnalyzerDriver, SimulatedAnalyzer, SimulatorConfig,
};

#[derive(Parser)]
#[command(name = "decode_capture")]
#[command(about = "Decode UART traffic from a simulated capture")]
struct Args {
    /// Text transmitted on channel 0
    #[arg(default_value = "Hello")]
    message: String,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    frequency: u32,

    /// UART baud rate
    #[arg(short, long, default_value_t = 100_000)]
    baudrate: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// 8N1 frames with idle gaps, one value per sample
fn uart_waveform(message: &[u8], samples_per_bit: usize) -> Vec<u8> {
    let mut bits = vec![1u8; 4];
    for byte in message {
        bits.push(0);
        bits.extend((0..8).map(|i| (byte >> i) & 1));
        bits.extend([1, 1]);
    }
    bits.extend([1u8; 4]);
    bits.iter().flat_map(|&b| vec![b; samples_per_bit]).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let samples_per_bit = (args.frequency / args.baudrate.max(1)).max(1) as usize;
    let waveform = uart_waveform(args.message.as_bytes(), samples_per_bit);
    let total = waveform.len() as u32;

    let analyzer = SimulatedAnalyzer::new(SimulatorConfig::default())
        .with_waveforms(vec![(0, waveform)]);
    let mut driver = LogicAnalyzerDriver::new("sim0");
    driver.connect_with_transport(
        Box::new(analyzer),
        &ConnectionParams::serial("sim"),
        DriverType::Simulated,
    )?;

    let session = CaptureSession::new(args.frequency, 2, total.saturating_sub(2).max(2))
        .with_channels(&[0]);
    let result = driver.start_capture(session)?;
    println!(
        "Captured {} samples at {} Hz",
        result.session.total_samples(),
        result.session.frequency
    );

    let registry = DecoderRegistry::new();
    let data_annotation = registry.create("uart")?.info().annotation_index("rx-data");
    let baud = DecoderOptionValue {
        option_index: 0,
        value: OptionValue::Int(i64::from(args.baudrate)),
    };
    let results = registry.decode_session("uart", &result.session, &[("rx", 0)], &[baud])?;

    let mut decoded = Vec::new();
    for frame in &results {
        println!(
            "{:>8}..{:<8} [{}] {}",
            frame.start_sample,
            frame.end_sample,
            frame.annotation_type,
            frame.values.first().map_or("", String::as_str)
        );
        if Some(frame.annotation_type) == data_annotation {
            decoded.extend(
                frame
                    .values
                    .first()
                    .and_then(|v| u8::from_str_radix(v.trim_start_matches("0x"), 16).ok()),
            );
        }
    }
    println!("\nDecoded text: {}", String::from_utf8_lossy(&decoded));

    driver.disconnect();
    Ok(())
}

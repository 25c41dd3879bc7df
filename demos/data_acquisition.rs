// Data acquisition with triggers and progress monitoring
//
// This example runs a capture, follows it with the progress monitor and
// prints the samples as a DataFrame.

use clap::Parser;
use logic_analyzer_rs::monitor::{DeviceStatus, MonitorConfig};
use logic_analyzer_rs::{
    AnalyzerDriver, BitState, CaptureProgressMonitor, CaptureSession, ConnectionParams,
    DriverType, EdgeTrigger, LogicAnalyzerDriver, PatternTrigger, SimulatedAnalyzer,
    SimulatorConfig, UnifiedCaptureData,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "data_acquisition")]
#[command(about = "Capture samples from a logic analyzer")]
struct Args {
    /// Serial port of the analyzer; the simulator is used when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    frequency: u32,

    /// Samples after the trigger
    #[arg(short, long, default_value_t = 10_000)]
    samples: u32,

    /// Trigger on pattern 0b01 over channels 0..2 instead of a rising edge
    #[arg(long)]
    pattern: bool,

    /// Write the capture as JSON to this file
    #[arg(long)]
    json: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    println!("Logic Analyzer Data Acquisition Example");
    println!("=======================================\n");

    let mut driver = LogicAnalyzerDriver::new("la0");
    let connected = match &args.port {
        Some(port) => driver.connect(
            &ConnectionParams::serial(port).trigger_timeout(Duration::from_secs(10)),
        )?,
        None => driver.connect_with_transport(
            Box::new(SimulatedAnalyzer::new(SimulatorConfig::default())),
            &ConnectionParams::serial("sim"),
            DriverType::Simulated,
        )?,
    };
    println!("Connected to {}\n", connected.device_info.name);

    let monitor = if args.verbose {
        CaptureProgressMonitor::new(MonitorConfig::debug())
    } else {
        CaptureProgressMonitor::default()
    };
    monitor.update_device_status("la0", &connected.device_info, DeviceStatus::Connected);

    let trigger = if args.pattern {
        PatternTrigger::start_capturing_when()
            .bit0(BitState::High)
            .bit1(BitState::Low)
            .matches()?
    } else {
        EdgeTrigger::on_channel(0).rising_edge()
    };
    let session = CaptureSession::new(args.frequency, 100, args.samples)
        .with_channels(&[0, 1, 2, 3])
        .with_trigger(trigger);
    monitor.start_monitoring("capture-1", "la0", &session);

    let (subscription, events) = driver.subscribe();
    let result = std::thread::scope(|scope| {
        scope.spawn(|| {
            for event in events.iter() {
                monitor.handle_driver_event("capture-1", &event);
            }
        });
        let result = driver.start_capture(session);
        driver.unsubscribe(subscription);
        result
    })?;

    println!("Capture finished: {:?} in {:?}", result.status, result.duration);
    if !result.burst_timestamps.is_empty() {
        println!("Burst timestamps: {:?}", result.burst_timestamps);
    }

    let data = UnifiedCaptureData::from_session(connected.device_info.clone(), &result.session);
    let frame = data.to_dataframe()?;
    println!("\n{}", frame.head(Some(10)));

    if let Some(path) = &args.json {
        std::fs::write(path, data.into_run_length().to_json()?)?;
        println!("Wrote capture to {}", path.display());
    }

    let report = monitor.generate_status_report();
    let stats = monitor.get_performance_statistics();
    println!("\nHealth: {:?}", report.health);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    println!(
        "Sessions: {} ({:.0}% successful, average {:?})",
        stats.total_sessions,
        stats.success_rate * 100.0,
        stats.average_duration
    );

    driver.disconnect();
    Ok(())
}

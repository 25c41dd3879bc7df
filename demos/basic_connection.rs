// Basic device discovery and connection example
//
// This example shows how to discover logic analyzers and establish a connection,
// either over USB serial, over the network, or against the built-in simulator.

use clap::Parser;
use logic_analyzer_rs::{
    AnalyzerDriver, ConnectionParams, Connector, DriverType, LogicAnalyzerDriver,
    SimulatedAnalyzer, SimulatorConfig,
};

#[derive(Parser)]
#[command(name = "basic_connection")]
#[command(about = "Discover and connect to a logic analyzer")]
struct Args {
    /// Serial port to use; the first discovered analyzer when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Connect over TCP instead of serial
    #[arg(long)]
    host: Option<String>,

    /// TCP port for --host
    #[arg(long, default_value_t = ConnectionParams::DEFAULT_NETWORK_PORT)]
    tcp_port: u16,

    /// Use the in-memory simulator
    #[arg(short, long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    println!("Logic Analyzer Discovery Example");
    println!("================================\n");

    let mut driver = LogicAnalyzerDriver::new("la0");
    let connected = if args.simulate {
        println!("Using simulated analyzer");
        driver.connect_with_transport(
            Box::new(SimulatedAnalyzer::new(SimulatorConfig::default())),
            &ConnectionParams::serial("sim"),
            DriverType::Simulated,
        )?
    } else if let Some(host) = &args.host {
        println!("Connecting to {}:{}", host, args.tcp_port);
        driver.connect(&ConnectionParams::network(host, args.tcp_port))?
    } else {
        println!("1. Discovering available analyzers...");
        let devices = Connector::available_devices(None)?;
        if devices.is_empty() && args.port.is_none() {
            println!("No analyzers found. Please connect a device and try again.");
            return Ok(());
        }
        for (i, device) in devices.iter().enumerate() {
            println!("  {}. {} at {}", i + 1, device.name, device.port);
        }
        println!();

        let port = args.port.clone().unwrap_or_default();
        println!("2. Connecting...");
        driver.connect(&ConnectionParams::serial(&port))?
    };

    let info = &connected.device_info;
    let caps = &connected.capabilities;
    println!("\nDevice information:");
    println!("  Name:      {}", info.name);
    println!("  Firmware:  {}", info.firmware_version);
    println!("  Path:      {}", info.connection_path);
    println!("  Channels:  {}", caps.channels.digital);
    println!(
        "  Rates:     {} Hz .. {} Hz (blast {} Hz)",
        caps.sampling.min_rate, caps.sampling.max_rate, caps.sampling.blast_rate
    );
    println!("  Buffer:    {} bytes", caps.sampling.buffer_size);
    println!("  Triggers:  {:?}", caps.triggers.types);

    driver.disconnect();
    println!("\nConnection test completed successfully!");
    Ok(())
}

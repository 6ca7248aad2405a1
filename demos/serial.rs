use std::{env, sync::Arc};

use inquire::Select;
use pack_diag::{
    analysis::analyze,
    config::DiagConfig,
    registers::{makita_lxt, milwaukee_m18},
    session::DeviceIdentity,
    transport::{DEFAULT_BAUD_RATE, SerialPortTransport},
    worker::spawn_sweep,
};
use tracing_subscriber::EnvFilter;

// Optional TOML config, see `DiagConfig`.
const CONFIG_ENV: &str = "PACK_DIAG_CONFIG";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");

        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

        Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port")
    });

    let family = Select::new("Select the pack family:", vec!["Milwaukee M18", "Makita LXT"])
        .prompt()
        .expect("Failed to select pack family");
    let map = match family {
        "Makita LXT" => makita_lxt(),
        _ => milwaukee_m18(),
    }
    .expect("Built-in register map is invalid");
    let map = Arc::new(map);

    let config = match env::var(CONFIG_ENV) {
        Ok(path) => DiagConfig::from_file(&path).expect("Failed to load config"),
        Err(_) => DiagConfig::default(),
    };

    println!("Using port: {}", port_name);
    let port = SerialPortTransport::open(&port_name, DEFAULT_BAUD_RATE, config.link.timeout())
        .expect("Failed to open serial port");

    let device = DeviceIdentity {
        manufacturer: map.manufacturer().to_string(),
        model: map.model().to_string(),
        port: port_name.clone(),
        serial: None,
    };

    let handle = spawn_sweep("demo", port, Arc::clone(&map), config.clone(), device).expect("Failed to start worker");
    let session = handle
        .wait()
        .expect("Worker exited early")
        .expect("Failed to configure port");

    println!(
        "\nSession {} ({} of {} registers, {} ms)",
        session.id(),
        session.values().iter().filter(|v| v.is_decoded()).count(),
        session.expected_registers(),
        session.duration_ms()
    );
    if let Some(reason) = session.failure_reason() {
        println!("Sweep stopped early: {reason}");
    }

    println!("\n--- Registers ---");
    for value in session.values() {
        match (&value.value, &value.text) {
            (_, Some(text)) => println!("{:<28} {}", value.name, text),
            (Some(v), None) => println!("{:<28} {:.3} {} ({:?})", value.name, v, value.unit, value.status),
            (None, None) => println!("{:<28} {:?}", value.name, value.status),
        }
    }
    for failure in session.failures() {
        println!("0x{:04X} failed: {:?}", failure.address, failure.failure);
    }

    let report = analyze(&session, &map, &config, None);

    if let Some(cells) = &report.cells {
        println!("\n--- Cells (spread {:.0} mV) ---", cells.spread_mv);
        for cell in &cells.cells {
            println!(
                "Cell {}: {:.0} mV, rank {}, {:+.0} mV from mean",
                cell.index, cell.voltage_mv, cell.rank, cell.deviation_mv
            );
        }
        if cells.imbalanced {
            println!("Pack is imbalanced");
        }
    }

    if let Some(histogram) = &report.histogram {
        println!("\n--- Discharge usage ({}) ---", histogram.stress);
        for bucket in &histogram.buckets {
            let range = match bucket.end_a {
                Some(end) => format!("{:.0}-{:.0}A", bucket.start_a, end),
                None => format!("{:.0}A+", bucket.start_a),
            };
            println!("{:<10} {:>6.1}% {:>8.1} Wh", range, bucket.percentage, bucket.energy_wh);
        }
    }

    println!("\n--- Health ---");
    match &report.health {
        Some(health) => {
            println!("Score: {} ({})", health.score, health.rating);
            println!("Capacity: {}", health.capacity_rating);
            println!("Safety: {}", health.safety_status);
            println!("{:#?}", health.sub_scores);
        }
        None => println!("Pack reported no capacity, unable to score"),
    }
    if let (Some(pack_type), Some(serial)) = (&report.pack_type, &report.serial) {
        println!("Pack: {} (serial {})", pack_type.description, serial);
    }
    if let Some(cycles) = report.estimated_cycles {
        println!("Estimated full cycles: {:.0}", cycles);
    }
}

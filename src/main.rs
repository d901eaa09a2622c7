use std::io::{self, BufRead, Read, Write};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use array_driver::{
    command_channel, load_electrode_map, load_pin_map, Controller, ElectrodeMap, EmptySource,
    MatrixDriver, PinTable, SimulatedBus, READY_BANNER,
};

const ELECTRODE_MAP_PATH: &str = "resources/ElectrodeMap.json";
const PIN_MAP_PATH: &str = "resources/PinMap.json";

// The main entry point for the command-line driver application.
fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("==========================");
    println!("  Electrode Array Driver  ");
    println!("==========================");

    // Without real hardware attached the matrix runs against the simulated
    // pin bus; the protocol and sequence behavior are identical.
    let mut driver = MatrixDriver::new(SimulatedBus::new(), PinTable::stm32_default());
    driver.init();
    let map = load_map();
    let mut controller = Controller::new(driver, map);

    // Main menu loop.
    loop {
        println!("\nSelect mode:");
        println!("  1. Manual Command Input");
        println!("  2. Listen on Serial Port");
        println!("  3. Exit");
        print!("> ");
        io::stdout().flush().unwrap();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice).unwrap();

        match choice.trim() {
            "1" => run_manual_mode(&mut controller),
            "2" => run_serial_mode(&mut controller),
            "3" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, or 3."),
        }
    }
}

// Builds the electrode map from the JSON mapping files, degrading to the
// deterministic default table when a file is missing or unreadable.
fn load_map() -> ElectrodeMap {
    let electrode_source = match load_electrode_map(ELECTRODE_MAP_PATH) {
        Ok(source) => Some(source),
        Err(err) => {
            warn!("could not load {}: {}", ELECTRODE_MAP_PATH, err);
            None
        }
    };
    let pin_source = match load_pin_map(PIN_MAP_PATH) {
        Ok(source) => Some(source),
        Err(err) => {
            warn!("could not load {}: {}", PIN_MAP_PATH, err);
            None
        }
    };

    let mut map = ElectrodeMap::with_default();
    let result = match (&electrode_source, &pin_source) {
        (Some(electrodes), Some(pins)) => map.rebuild(electrodes, pins),
        (Some(electrodes), None) => map.rebuild(electrodes, &EmptySource),
        (None, Some(pins)) => map.rebuild(&EmptySource, pins),
        (None, None) => {
            warn!("no mapping files found, using default 1:1 electrode map");
            Ok(())
        }
    };
    match result {
        Ok(()) => info!("electrode map ready"),
        Err(err) => warn!("electrode map rebuild failed, keeping default table: {}", err),
    }
    map
}

// Handles the manual command input mode.
fn run_manual_mode(controller: &mut Controller<SimulatedBus>) {
    println!("\n--- Manual Mode ---");
    print!("{READY_BANNER}");
    println!("Enter commands, or type 'back' to return to the main menu.");
    print!("> ");
    io::stdout().flush().unwrap();

    let (mut assembler, mut handler) = command_channel();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let input = line.unwrap();
        let command = input.trim();

        if command == "back" {
            break;
        }

        assembler.push_bytes(command.as_bytes());
        assembler.push_byte(b'\n');
        for response in handler.poll(controller) {
            print!("{response}");
        }

        print!("> ");
        io::stdout().flush().unwrap();
    }
}

// Handles the serial port listening mode.
fn run_serial_mode(controller: &mut Controller<SimulatedBus>) {
    println!("\n--- Serial Mode ---");

    // List available serial ports.
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return;
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    // Get user's choice of serial port.
    print!("Select a port (number): ");
    io::stdout().flush().unwrap();
    let mut port_choice = String::new();
    io::stdin().read_line(&mut port_choice).unwrap();
    let port_index: usize = match port_choice.trim().parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return;
        }
    };
    let port_name = &ports[port_index].port_name;

    // Get user's choice of baud rate.
    let baud_rates = [9600, 19200, 38400, 57600, 115200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    print!("Select a baud rate (number): ");
    io::stdout().flush().unwrap();
    let mut baud_choice = String::new();
    io::stdin().read_line(&mut baud_choice).unwrap();
    let baud_index: usize = match baud_choice.trim().parse() {
        Ok(i) if i < baud_rates.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid baud rate selection.");
            return;
        }
    };
    let baud_rate = baud_rates[baud_index];

    // Open the selected serial port.
    let mut port = match serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", port_name, e);
            return;
        }
    };

    println!(
        "\nListening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    if let Err(e) = port.write_all(READY_BANNER.as_bytes()) {
        eprintln!("[ERROR] Failed to write to serial port: {}", e);
    }

    let (mut assembler, mut handler) = command_channel();
    let mut serial_buf: Vec<u8> = vec![0; 128];
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) => assembler.push_bytes(&serial_buf[..bytes_read]),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => eprintln!("[ERROR] Serial port error: {}", e),
        }

        for response in handler.poll(controller) {
            print!("< {response}");
            if let Err(e) = port.write_all(response.as_bytes()) {
                eprintln!("[ERROR] Failed to write to serial port: {}", e);
            }
        }

        // Drive any poll-based sequence forward.
        let Controller { driver, engine, .. } = controller;
        engine.tick(driver, Instant::now());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use colabscan::{
    scanner::{AccessLevel, Scanner, ScannerConfig},
    telegram::{CommandKind, Telegram, DEFAULT_PORT},
};
use log::debug;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host name or IP address of the laser scanner
    #[arg(short, long, env, default_value = "192.168.0.1")]
    target: String,

    /// CoLa-B TCP port
    #[arg(short, long, env, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Command timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout: u64,

    /// Scan data timeout in milliseconds
    #[arg(long, default_value = "5000")]
    scan_timeout: u64,

    /// Log in with the given access level before any other request
    #[arg(short, long, value_enum)]
    login: Option<AccessLevel>,

    /// Print the device name and firmware version
    #[arg(short, long)]
    ident: bool,

    /// Print the device serial number
    #[arg(long)]
    serial: bool,

    /// Print the scan frequency and angular sectors
    #[arg(long)]
    scan_config: bool,

    /// Poll this many scans and print them
    #[arg(short, long, num_args = 0..=1, default_missing_value = "1")]
    scan: Option<usize>,

    /// Start the measurement
    #[arg(long)]
    start: bool,

    /// Stop the measurement
    #[arg(long)]
    stop: bool,

    /// Return the device to measurement after configuration
    #[arg(long)]
    run: bool,

    /// Read the named variable (sRN)
    #[arg(long, value_name = "NAME")]
    read: Option<String>,

    /// Write the named variable (sWN), value taken from --args
    #[arg(long, value_name = "NAME")]
    write: Option<String>,

    /// Invoke the named method (sMN) with --args
    #[arg(long, value_name = "NAME")]
    method: Option<String>,

    /// Subscribe to the named event (sEN)
    #[arg(long, value_name = "NAME")]
    event: Option<String>,

    /// Argument bytes as hex, for example "03 F4724744"
    #[arg(short, long, value_parser = parse_hex, default_value = "")]
    args: HexBytes,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct HexBytes(Vec<u8>);

fn parse_hex(s: &str) -> Result<HexBytes, String> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", s));
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex byte in {:?}", s))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(HexBytes)
}

fn print_ack(ack: &Telegram) {
    println!("{} {}: {:02X?}", ack.prefix(), ack.name(), ack.payload());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ScannerConfig {
        access_level: args.login.unwrap_or(AccessLevel::AuthorizedClient),
        login_timeout: Duration::from_millis(args.timeout),
        scan_timeout: Duration::from_millis(args.scan_timeout),
    };

    debug!("connecting to {}:{}", args.target, args.port);
    let mut scanner = Scanner::new(config);
    scanner.connect((args.target.as_str(), args.port)).await?;

    if let Some(level) = args.login {
        scanner.login().await?;
        println!("Logged in as {}", level);
    }

    if args.ident {
        let ident = scanner.device_ident().await?;
        println!("Device: {}", ident.name);
        println!("Firmware: {}", ident.version);
    }

    if args.serial {
        println!("Serial Number: {}", scanner.serial_number().await?);
    }

    if args.scan_config {
        println!("Scan Config: {}", scanner.scan_config().await?);
    }

    if args.stop {
        scanner.stop_measurement().await?;
        println!("Measurement stopped");
    }

    if let Some(name) = &args.read {
        print_ack(&scanner.command(CommandKind::Read, name, &[]).await?);
    }

    if let Some(name) = &args.write {
        let ack = scanner
            .command(CommandKind::Write, name, &args.args.0)
            .await?;
        print_ack(&ack);
    }

    if let Some(name) = &args.method {
        let ack = scanner
            .command(CommandKind::Method, name, &args.args.0)
            .await?;
        print_ack(&ack);
    }

    if let Some(name) = &args.event {
        print_ack(&scanner.command(CommandKind::Event, name, &[1]).await?);
    }

    if args.start {
        scanner.start_measurement().await?;
        println!("Measurement started");
    }

    if args.run {
        scanner.run().await?;
        println!("Run");
    }

    if let Some(count) = args.scan {
        for _ in 0..count {
            let frame = scanner.poll().await?;
            println!("{}", frame);
            println!("{:.3}", scanner.distances());
        }
    }

    scanner.disconnect();
    Ok(())
}

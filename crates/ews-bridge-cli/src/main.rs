//! # EWS Bridge CLI
//!
//! Command-line utilities for checking point identifiers and device keys.

use anyhow::{bail, Result};
use ews_bridge_core::{device_key_of, sensor_id_of, Signal};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "ids" => {
            if args.len() < 3 {
                eprintln!("Usage: ews-bridge ids <databasePath>");
                std::process::exit(1);
            }
            let signal = Signal::new(args[2].as_str());
            if signal.database_path.is_empty() {
                bail!("Database path must not be empty");
            }
            println!("read:   {}", signal.ews_id());
            println!("write:  {}", signal.ews_id_for_write());
            println!("device: {}", signal.device_id().unwrap_or("-"));
            println!("sensor: {}", signal.sensor_id());
        }
        "device" => {
            if args.len() < 3 {
                eprintln!("Usage: ews-bridge device <pointId>");
                std::process::exit(1);
            }
            let point_id = &args[2];
            let Some(device) = device_key_of(point_id) else {
                bail!("Point id '{point_id}' has no device key");
            };
            println!("device: {device}");
            println!("sensor: {}", sensor_id_of(point_id));
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"EWS Bridge CLI

USAGE:
    ews-bridge <COMMAND> [OPTIONS]

COMMANDS:
    ids <databasePath>  Show the EWS read and write ids and the device of a point
    device <pointId>    Show the device key of an EWS point id
    help                Show this help message

EXAMPLES:
    ews-bridge ids "Server 1/IO Bus/Module 3/Input 1"
    ews-bridge device "01Server 1/Bldg1/AHU1/Temp"
"#
    );
}

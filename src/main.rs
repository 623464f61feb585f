//! pageprog - Page-programmed flash chip programmer
//!
//! Host CLI for a microcontroller-based programmer that speaks the
//! pageprog protocol over USB-CDC serial (or a TCP forward of it).
//! The device handles chip access, bad-block management and its own A/B
//! firmware updates; this binary drives it: configure a chip geometry,
//! then erase, read, write, enumerate bad blocks, or push new programmer
//! firmware.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use pageprog_host::{transport, Programmer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let transport = match transport::open(&cli.connect) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to open {}: {}", cli.connect, e);
            std::process::exit(1);
        }
    };
    let mut client = Programmer::new(transport);

    let result = match cli.command {
        Commands::Probe { chip } => commands::probe::run_probe(&mut client, &chip),
        Commands::Read {
            output,
            chip,
            range,
        } => commands::read::run_read(&mut client, &output, &chip, &range),
        Commands::Write {
            input,
            erase,
            chip,
            range,
        } => commands::write::run_write(&mut client, &input, erase, &chip, &range),
        Commands::Erase { chip, range } => commands::erase::run_erase(&mut client, &chip, &range),
        Commands::BadBlocks { chip } => commands::badblocks::run_badblocks(&mut client, &chip),
        Commands::Version => commands::firmware::run_version(&mut client),
        Commands::ActiveImage => commands::firmware::run_active_image(&mut client),
        Commands::FwUpdate { input } => commands::firmware::run_fw_update(&mut client, &input),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

//! Probe command implementation

use crate::cli::ChipArgs;
use crate::commands::{configure, Client};

/// Run the probe command
pub fn run_probe(client: &mut Client, chip: &ChipArgs) -> Result<(), Box<dyn std::error::Error>> {
    let version = client.version()?;
    let slot = client.active_image()?;

    configure(client, chip)?;
    let id = client.read_id()?;

    let geometry = chip.geometry();
    println!(
        "Chip ID: {}",
        id.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!(
        "Geometry: {} B pages, {} B blocks, {} B total, {} B spare",
        geometry.page_size, geometry.block_size, geometry.total_size, geometry.spare_size
    );
    println!("Programmer firmware: {} (image {})", version, slot);

    Ok(())
}

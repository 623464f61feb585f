//! Programmer firmware commands: version, active image, A/B update

use std::fs;
use std::path::Path;

use crate::commands::{BarSink, Client};

/// Run the version command
pub fn run_version(client: &mut Client) -> Result<(), Box<dyn std::error::Error>> {
    let version = client.version()?;
    println!("Programmer firmware {}", version);
    Ok(())
}

/// Run the active-image command
pub fn run_active_image(client: &mut Client) -> Result<(), Box<dyn std::error::Error>> {
    let slot = client.active_image()?;
    println!("Active image: {}", slot);
    Ok(())
}

/// Run the fw-update command
pub fn run_fw_update(client: &mut Client, input: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let before = client.active_image()?;
    let image = fs::read(input)?;
    println!("Read {} byte firmware image from {:?}", image.len(), input);

    let mut sink = BarSink::new(image.len() as u64)?;
    client.fw_update(&image, &mut sink)?;
    sink.finish("Update complete");

    let after = client.active_image()?;
    println!("Switched active image {} -> {}", before, after);

    Ok(())
}

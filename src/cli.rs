//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a HAL configuration blob given as hex bytes, e.g. "0b10ff"
fn parse_hex_blob(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("hex blob must have an even number of digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("Invalid hex: {}", e)))
        .collect()
}

#[derive(Parser)]
#[command(name = "pageprog")]
#[command(author, version, about = "Page-programmed flash chip programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Connection string: dev=/dev/ttyACM0[:baud] or ip=host:port
    #[arg(short, long, global = true, default_value = "dev=/dev/ttyACM0")]
    pub connect: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Chip geometry options shared by chip-touching commands
#[derive(clap::Args, Debug, Clone)]
pub struct ChipArgs {
    /// Page size in bytes, spare excluded (hex or decimal)
    #[arg(long, value_parser = parse_hex_u32)]
    pub page_size: u32,

    /// Block size in bytes, spare excluded (hex or decimal)
    #[arg(long, value_parser = parse_hex_u32)]
    pub block_size: u32,

    /// Total chip size in bytes, spare excluded (hex or decimal)
    #[arg(long, value_parser = parse_hex_u32)]
    pub total_size: u32,

    /// Out-of-band (spare) bytes per page, 0 for chips without one
    #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
    pub spare_size: u32,

    /// Offset of the bad-block mark byte within the spare area
    #[arg(long, default_value = "0")]
    pub mark_offset: u8,

    /// Opaque HAL configuration blob as hex bytes (timings, command set)
    // qualified so clap treats the blob as one value, not repeated u8s
    #[arg(long, value_parser = parse_hex_blob, default_value = "")]
    pub hal_config: std::vec::Vec<u8>,
}

/// Address range options shared by erase/read/write
#[derive(clap::Args, Debug, Clone)]
pub struct RangeArgs {
    /// Start address in effective bytes (hex or decimal)
    #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
    pub start: u32,

    /// Length in effective bytes; the whole chip if omitted
    #[arg(long, value_parser = parse_hex_u32)]
    pub length: Option<u32>,

    /// Skip blocks marked or discovered bad
    #[arg(long)]
    pub skip_bad: bool,

    /// Address the chip including the per-page spare area
    #[arg(long)]
    pub include_spare: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the chip and the programmer firmware
    Probe {
        #[command(flatten)]
        chip: ChipArgs,
    },

    /// Read flash contents to file
    Read {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        chip: ChipArgs,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Write file to flash
    Write {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Erase the target range first
        #[arg(long)]
        erase: bool,

        #[command(flatten)]
        chip: ChipArgs,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Erase a block range
    Erase {
        #[command(flatten)]
        chip: ChipArgs,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// List bad blocks
    BadBlocks {
        #[command(flatten)]
        chip: ChipArgs,
    },

    /// Show the programmer firmware version
    Version,

    /// Show the active firmware image slot
    ActiveImage,

    /// Flash new programmer firmware into the inactive slot and switch
    FwUpdate {
        /// Firmware image file
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_decimal_values() {
        assert_eq!(parse_hex_u32("0x20000"), Ok(0x20000));
        assert_eq!(parse_hex_u32("2048"), Ok(2048));
        assert!(parse_hex_u32("0xZZ").is_err());
    }

    #[test]
    fn hal_blob_parsing() {
        assert_eq!(parse_hex_blob(""), Ok(vec![]));
        assert_eq!(parse_hex_blob("0b10ff"), Ok(vec![0x0B, 0x10, 0xFF]));
        assert!(parse_hex_blob("abc").is_err());
        assert!(parse_hex_blob("zz").is_err());
    }
}

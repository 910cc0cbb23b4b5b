//! Dumps BAT region offset/length and, optionally, an allocation map.
//! Grounded in `utilities/vhdx_get_bat_info.py`.

use anyhow::Context;
use clap::Parser;
use vhdx_forensics::bat::{BatEntryState, BAT_ENTRY_SIZE};
use vhdx_forensics::metadata::Metadata;
use vhdx_forensics::signatures::REGION_GUID_BAT;
use vhdx_forensics::OpenOptions;

#[derive(Parser)]
#[command(about = "Dumps information about the BAT, optionally printing an allocation map")]
struct Args {
    /// Path to the VHDX file
    file: std::path::PathBuf,

    /// Print an allocation map
    #[arg(short, long)]
    map: bool,
}

const ALLOCATION_MAP_LINE_LENGTH: usize = 128;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let container = OpenOptions::new()
        .tolerant()
        .fallback_metas(Metadata::sensible_fallback())
        .open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    println!("{}", args.file.display());

    let guid = vhdx_forensics::guid::blob_to_guid(&vhdx_forensics::signatures::known_guid_blob(REGION_GUID_BAT))?
        .parse()
        .expect("well-known GUID parses");
    let bat_region = container
        .region_table()
        .get(&guid)
        .context("VHDX file has no BAT region")?;

    println!("BAT offset: {}", bat_region.file_offset);
    println!("BAT region length (bytes): {}", bat_region.length);
    println!("BAT entry count (max): {}", bat_region.length as u64 / BAT_ENTRY_SIZE);

    let entries = container.iter_bat_payload_entries().context("reading BAT payload entries")?;
    let allocation: Vec<bool> = entries
        .iter()
        .map(|entry| matches!(entry.state, BatEntryState::FullyPresent | BatEntryState::PartiallyPresent))
        .collect();
    let allocated_block_count = allocation.iter().filter(|&&allocated| allocated).count();

    println!("Allocated* Payload Block Count: {allocated_block_count}");
    println!();
    println!("*at least partially");
    println!();

    if args.map {
        println!("Allocation Map:");
        for chunk in allocation.chunks(ALLOCATION_MAP_LINE_LENGTH) {
            let line: String = chunk.iter().map(|&allocated| if allocated { '1' } else { '0' }).collect();
            println!("{line}");
        }
        println!();
    }

    for warning in container.warnings() {
        log::warn!("{warning}");
    }

    Ok(())
}

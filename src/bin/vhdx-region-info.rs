//! Prints both region tables and flags a mismatch between the two copies.
//! Grounded in `utilities/vhdx_get_region_info.py`.

use anyhow::Context;
use clap::Parser;
use vhdx_forensics::metadata::Metadata;
use vhdx_forensics::signatures::{REGION_GUID_BAT, REGION_GUID_METADATA};
use vhdx_forensics::OpenOptions;

#[derive(Parser)]
#[command(about = "Prints region information from a VHDX file")]
struct Args {
    /// Path to the VHDX file
    file: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let container = OpenOptions::new()
        .tolerant()
        .fallback_metas(Metadata::sensible_fallback())
        .open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    println!("{}", args.file.display());

    let table = container.region_table();
    for (label, guid) in [("Metadata", REGION_GUID_METADATA), ("BAT", REGION_GUID_BAT)] {
        let key = vhdx_forensics::guid::blob_to_guid(&vhdx_forensics::signatures::known_guid_blob(guid))?;
        let key = key.parse().expect("well-known GUID parses");
        if let Some(entry) = table.get(&key) {
            println!("{label} Region Offset={}; Length={}; Required={}", entry.file_offset, entry.length, entry.required);
        } else {
            println!("{label} Region: not present");
        }
    }

    for warning in container.warnings() {
        log::warn!("{warning}");
    }

    Ok(())
}

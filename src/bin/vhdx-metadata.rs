//! Prints the metadata key/value map from a VHDX file.
//! Grounded in `utilities/vhdx_get_metadata.py`.

use anyhow::Context;
use clap::Parser;
use vhdx_forensics::metadata::{Metadata, MetadataValue};
use vhdx_forensics::OpenOptions;

#[derive(Parser)]
#[command(about = "Prints metadata from a VHDX file")]
struct Args {
    /// Path to the VHDX file
    file: std::path::PathBuf,

    /// Fall back to sensible defaults when the metadata region is missing
    /// or incomplete, instead of failing.
    #[arg(long)]
    fallback: bool,
}

fn print_value(key: &str, value: &MetadataValue) {
    match (key, value) {
        ("Page83Data", MetadataValue::Guid(guid)) => println!("{key}:\t{guid}"),
        ("HasParent", MetadataValue::Bool(b)) => println!("{key} (is differencing):\t{b}"),
        (_, MetadataValue::ParentLocator(locator)) => {
            println!("{key}:");
            for (subkey, subvalue) in locator {
                println!("\t{subkey}:\t{subvalue}");
            }
        }
        (_, MetadataValue::U32(v)) => println!("{key}:\t{v}"),
        (_, MetadataValue::U64(v)) => println!("{key}:\t{v}"),
        (_, MetadataValue::Bool(v)) => println!("{key}:\t{v}"),
        (_, MetadataValue::Guid(v)) => println!("{key}:\t{v}"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut options = OpenOptions::new().tolerant();
    if args.fallback {
        options = options.fallback_metas(Metadata::sensible_fallback());
    }
    let container = options
        .open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    println!("{}", args.file.display());
    if container.used_fallback_metas() {
        println!("(fallback metadata was used)");
    }

    const KEYS: &[&str] = &[
        "BlockSize",
        "LeaveBlocksAllocated",
        "HasParent",
        "VirtualDiskSize",
        "Page83Data",
        "LogicalSectorSize",
        "PhysicalSectorSize",
        "ParentLocator",
    ];
    for key in KEYS {
        if let Some(value) = container.get_meta_entry(key) {
            print_value(key, &value);
        }
    }
    for unknown in &container.metas().unknown {
        println!("(unrecognized item {}, {} bytes)", unknown.item_id, unknown.bytes.len());
    }

    for warning in container.warnings() {
        log::warn!("{warning}");
    }

    Ok(())
}

//! Prints FileIdentifier and header-slot fields from a VHDX file.
//! Grounded in `utilities/vhdx_get_header_fields.py`.

use anyhow::Context;
use clap::Parser;
use vhdx_forensics::OpenOptions;

#[derive(Parser)]
#[command(about = "Prints header fields from a VHDX file")]
struct Args {
    /// Path to the VHDX file
    file: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let container = OpenOptions::new()
        .tolerant()
        .fallback_metas(vhdx_forensics::metadata::Metadata::sensible_fallback())
        .open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    println!("{}", args.file.display());
    println!("Creator: {}", container.file_identifier().creator);

    // We only have the picked-current header at hand through `Container`;
    // report it alongside which slot's sequence number won.
    let header = container.header();
    println!("SequenceNumber: {}", header.sequence_number);
    println!("FileWriteGuid: {}", header.file_write_guid);
    println!("DataWriteGuid: {}", header.data_write_guid);
    if header.has_log() {
        println!("LogGuid: {}", header.log_guid);
        println!("LogVersion: {}", header.log_version);
        println!("LogLength: {}", header.log_length);
        println!("LogOffset: {}", header.log_offset);
    } else {
        println!("LogGuid: {} (no log to replay)", header.log_guid);
    }
    println!("FormatVersion: {}", header.format_version);

    for warning in container.warnings() {
        log::warn!("{warning}");
    }

    Ok(())
}

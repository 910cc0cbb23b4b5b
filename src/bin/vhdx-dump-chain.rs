//! Walks a differencing chain (parent first) and writes the flattened
//! image. Grounded in `utilities/vhdx_dump_chain.py`; refuses to overwrite
//! an existing output file, exactly as the original's `open("xb")`.

use std::fs::OpenOptions as FsOpenOptions;
use std::io::Write;

use anyhow::{bail, Context};
use clap::Parser;
use vhdx_forensics::metadata::Metadata;
use vhdx_forensics::{ChainReader, OpenOptions};

#[derive(Parser)]
#[command(about = "Dumps a chain of differencing VHDX files into a single flat image")]
struct Args {
    /// Output file; must not already exist
    out_file: std::path::PathBuf,

    /// One or more VHDX files, ordered parent (base) first
    #[arg(required = true)]
    vhdx_files: Vec<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.out_file.exists() {
        bail!("{} already exists, refusing to overwrite it", args.out_file.display());
    }

    let chain = ChainReader::open(&args.vhdx_files, || {
        OpenOptions::new().tolerant().fallback_metas(Metadata::sensible_fallback())
    })
    .context("opening the differencing chain")?;

    let mut out = FsOpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&args.out_file)
        .with_context(|| format!("creating {}", args.out_file.display()))?;

    for sector_number in 0..chain.sector_count() {
        let sector = chain
            .get_sector(sector_number)
            .with_context(|| format!("reading sector {sector_number}"))?;
        out.write_all(&sector)?;
    }

    for layer in chain.layers() {
        for warning in layer.warnings() {
            log::warn!("{warning}");
        }
    }

    Ok(())
}

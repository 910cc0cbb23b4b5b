//! Walks a directory tree and prints a CSV report of the fields used to
//! determine relationships between VHDX files (differencing parent/child
//! linkage). Grounded in `utilities/vhdx_relationships.py`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use vhdx_forensics::metadata::Metadata;
use vhdx_forensics::signatures::FILE_IDENTIFIER_MAGIC;
use vhdx_forensics::OpenOptions;

#[derive(Parser)]
#[command(about = "Prints a relationship report for VHDX files found under a directory tree")]
struct Args {
    /// Root of the directory tree to search
    root: PathBuf,

    /// Tolerate invalid/missing data instead of failing on the first fault
    #[arg(short, long)]
    resilient: bool,
}

fn find_vhdx_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut found = Vec::new();
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).with_context(|| format!("reading {}", current.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() && has_vhdx_magic(&path)? {
                found.push(path);
            }
        }
    }
    Ok(found)
}

fn has_vhdx_magic(path: &Path) -> anyhow::Result<bool> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut magic = [0u8; FILE_IDENTIFIER_MAGIC.len()];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == FILE_IDENTIFIER_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let files = find_vhdx_files(&args.root)?;

    let mut rows = Vec::new();
    for path in files {
        let mut options = OpenOptions::new().fallback_metas(Metadata::sensible_fallback());
        if args.resilient {
            options = options.tolerant();
        }
        let container = options
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        if container.header().data_write_guid.is_nil() {
            println!("File \"{}\" does not have a DataWriteGuid set.", path.display());
            println!();
        }

        let metas = if container.used_fallback_metas() {
            println!("File \"{}\" used fallback metadata", path.display());
            println!();
            None
        } else {
            Some(container.metas().clone())
        };

        rows.push((path, container.header().data_write_guid, container.header().sequence_number, metas));
    }

    println!("Report starts:");
    println!("--------------");
    println!("Local Path,Data Write GUID,Sequence Number,Has Parent?,Parent Data Write GUID,Parent Volume Path");

    for (path, data_write_guid, sequence_number, metas) in &rows {
        let (has_parent, parent_linkage, volume_path) = match metas {
            None => ("?".to_string(), "?".to_string(), "?".to_string()),
            Some(metas) => match &metas.parent_locator {
                None => (
                    metas.has_parent.map_or("?".to_string(), |v| v.to_string()),
                    "-".to_string(),
                    "-".to_string(),
                ),
                Some(locator) => (
                    metas.has_parent.map_or("?".to_string(), |v| v.to_string()),
                    locator.get("parent_linkage").cloned().unwrap_or_default(),
                    locator.get("volume_path").cloned().unwrap_or_default(),
                ),
            },
        };

        println!(
            "{},{},{},{},{},{}",
            path.display(),
            data_write_guid.simple(),
            sequence_number,
            has_parent,
            parent_linkage,
            volume_path
        );
    }

    Ok(())
}

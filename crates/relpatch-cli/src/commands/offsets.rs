//! Offsets command implementation.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Subcommand;
use relpatch::{Id, Version, VersionTable};
use tracing::info;

use super::hex_utils::parse_hex_address;

#[derive(Subcommand, Debug)]
pub enum OffsetsAction {
    /// List builds and IDs in a table
    Show {
        /// JSON version table
        table: PathBuf,

        /// Only this build
        #[arg(short, long)]
        build: Option<Version>,
    },

    /// Add or replace one offset, creating the table if needed
    Set {
        /// JSON version table
        table: PathBuf,

        #[arg(short, long)]
        build: Version,

        #[arg(long)]
        id: u64,

        /// Offset from the image base (hex)
        #[arg(long, value_parser = parse_hex_address)]
        offset: usize,
    },

    /// Copy every entry of `from` into `into`, replacing duplicates
    Merge {
        into: PathBuf,
        from: PathBuf,
    },
}

/// Run the offsets command
pub fn run(action: OffsetsAction) -> Result<()> {
    match action {
        OffsetsAction::Show { table, build } => {
            let table = VersionTable::load(&table)?;
            for line in show_lines(&table, build)? {
                println!("{}", line);
            }
            Ok(())
        }
        OffsetsAction::Set {
            table,
            build,
            id,
            offset,
        } => set(&table, build, Id(id), offset),
        OffsetsAction::Merge { into, from } => merge(&into, &from),
    }
}

pub fn show_lines(table: &VersionTable, build: Option<Version>) -> Result<Vec<String>> {
    let versions: Vec<Version> = match build {
        Some(version) if table.get(version).is_none() => {
            bail!("Build {} not in table", version)
        }
        Some(version) => vec![version],
        None => table.versions().collect(),
    };

    let mut lines = Vec::new();
    for version in versions {
        let Some(offsets) = table.get(version) else {
            continue;
        };
        lines.push(format!("[{}] {} IDs", version, offsets.len()));
        for (id, offset) in offsets.iter() {
            lines.push(format!("  {:>10} = 0x{:X}", id.0, offset));
        }
    }
    Ok(lines)
}

fn load_or_new(path: &Path) -> Result<VersionTable> {
    match VersionTable::load(path) {
        Ok(table) => Ok(table),
        Err(e) if e.is_not_found() => Ok(VersionTable::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn set(path: &Path, build: Version, id: Id, offset: usize) -> Result<()> {
    let mut table = load_or_new(path)?;
    table.insert(build, id, offset);
    table.save(path)?;
    info!("Set {} = 0x{:X} for {} in {}", id, offset, build, path.display());
    Ok(())
}

pub fn merge(into: &Path, from: &Path) -> Result<()> {
    let mut table = load_or_new(into)?;
    table.merge(VersionTable::load(from)?);
    table.save(into)?;
    info!("Merged {} into {}", from.display(), into.display());
    Ok(())
}

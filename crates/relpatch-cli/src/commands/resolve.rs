//! Resolve command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use relpatch::{Id, ProcessImage, SelectedTable, Version, VersionTable};

use crate::image_file::MappedFile;

/// Run the resolve command
pub fn run(
    exe: &Path,
    table: &Path,
    build: Option<Version>,
    ids: &[u64],
    base: usize,
) -> Result<()> {
    let file = MappedFile::open(exe)?;
    let versions = VersionTable::load(table)?;
    let version = pick_version(&versions, build)?;
    let image = file.image(base, version);
    let selected = versions.select(version)?;

    println!("Build {} at base 0x{:X}", version, base);
    println!();
    for line in resolve_lines(&image, &selected, ids)? {
        println!("{}", line);
    }

    Ok(())
}

/// The requested build, or the table's only build when none was given.
pub fn pick_version(table: &VersionTable, build: Option<Version>) -> Result<Version> {
    if let Some(version) = build {
        return Ok(version);
    }
    let versions: Vec<Version> = table.versions().collect();
    match versions.as_slice() {
        [only] => Ok(*only),
        [] => bail!("Version table is empty"),
        many => bail!(
            "Table covers {} builds ({}); pick one with --build",
            many.len(),
            many.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// `id -> address [segment]` for each requested ID, or every ID when `ids` is empty.
pub fn resolve_lines(
    image: &ProcessImage,
    table: &SelectedTable<'_>,
    ids: &[u64],
) -> Result<Vec<String>> {
    let ids: Vec<Id> = if ids.is_empty() {
        table.table().iter().map(|(id, _)| id).collect()
    } else {
        ids.iter().copied().map(Id).collect()
    };

    ids.into_iter()
        .map(|id| -> Result<String> {
            let offset = table.offset(id)?;
            let address = offset.address(image);
            let segment = image
                .segment_of(address)
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| "-".to_string());
            Ok(format!(
                "{:>10}  +0x{:08X}  0x{:X}  {}",
                id.0,
                offset.raw(),
                address,
                segment
            ))
        })
        .collect()
}

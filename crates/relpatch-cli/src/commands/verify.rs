//! Verify command implementation.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Args;
use owo_colors::OwoColorize;
use relpatch::offset::{format_bytes, format_pattern};
use relpatch::{Id, Pattern, Version, VersionTable};

use super::hex_utils::parse_hex_address;
use super::hexdump::format_lines;
use super::resolve::pick_version;
use crate::image_file::MappedFile;

/// Where the patch site is: a raw offset, or an ID looked up in a version table.
#[derive(Args, Debug)]
pub struct SiteArgs {
    /// Offset from the image base (hex)
    #[arg(long, value_parser = parse_hex_address, conflicts_with = "id", required_unless_present = "id")]
    pub rva: Option<usize>,

    /// ID to look up in the table
    #[arg(long, requires = "table")]
    pub id: Option<u64>,

    /// JSON version table
    #[arg(short, long)]
    pub table: Option<PathBuf>,

    /// Host build to select (defaults to the only build in the table)
    #[arg(short, long)]
    pub build: Option<Version>,

    /// Distance from the resolved address to the site (hex)
    #[arg(long, default_value = "0", value_parser = parse_hex_address)]
    pub disp: usize,
}

impl SiteArgs {
    /// Offset of the site from the image base.
    pub fn rva(&self) -> Result<usize> {
        let start = match (self.rva, self.id, &self.table) {
            (Some(rva), _, _) => rva,
            (None, Some(id), Some(table)) => {
                let versions = VersionTable::load(table)?;
                let version = pick_version(&versions, self.build)?;
                versions.select(version)?.offset(Id(id))?.raw()
            }
            _ => bail!("Give either --rva or --id with --table"),
        };
        Ok(start + self.disp)
    }
}

/// Run the verify command
pub fn run(exe: &Path, pattern: &Pattern, site: &SiteArgs) -> Result<()> {
    let file = MappedFile::open(exe)?;
    let rva = site.rva()?;
    let found = file.bytes_at(rva, pattern.len())?;

    let bad = mismatches(pattern, found);
    if bad.is_empty() {
        println!("{} +0x{:X}: {}", "OK".green().bold(), rva, format_bytes(found));
        return Ok(());
    }

    println!("{} +0x{:X}", "MISMATCH".red().bold(), rva);
    println!("  expected: {}", format_pattern(pattern.bytes()));
    println!("  found:    {}", format_bytes(found));
    println!();
    for line in format_lines(found, rva, false, |i| bad.contains(&i)) {
        println!("{}", line);
    }

    bail!("{} of {} bytes differ at +0x{:X}", bad.len(), pattern.len(), rva)
}

/// Indices where a concrete pattern byte disagrees with `found`.
pub fn mismatches(pattern: &Pattern, found: &[u8]) -> Vec<usize> {
    pattern
        .bytes()
        .iter()
        .zip(found)
        .enumerate()
        .filter(|(_, (expected, actual))| expected.is_some_and(|e| e != **actual))
        .map(|(i, _)| i)
        .collect()
}

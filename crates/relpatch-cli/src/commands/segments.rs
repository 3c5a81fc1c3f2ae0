//! Segments command implementation.

use std::path::Path;

use anyhow::Result;
use relpatch::{SegmentName, Version};
use strum::IntoEnumIterator;

use crate::image_file::MappedFile;

/// Run the segments command
pub fn run(exe: &Path, base: usize) -> Result<()> {
    let file = MappedFile::open(exe)?;
    let image = file.image(base, Version::default());

    println!("=== {} ===", file.path().display());
    println!("Base: 0x{:X}  Size: 0x{:X}", image.base(), image.size());
    println!();

    for line in describe(&image) {
        println!("{}", line);
    }

    println!();
    println!("Sections:");
    for section in &file.headers().sections {
        println!(
            "  {:<8} rva 0x{:08X}  size 0x{:08X}  flags 0x{:08X}",
            section.name_str(),
            section.virtual_address,
            section.virtual_size,
            section.characteristics
        );
    }

    Ok(())
}

/// One line per segment name, present or not.
pub fn describe(image: &relpatch::ProcessImage) -> Vec<String> {
    SegmentName::iter()
        .map(|name| {
            let segment = image.segment(name);
            if segment.is_present() {
                format!(
                    "  {:<6} 0x{:X}..0x{:X}  (+0x{:X}, 0x{:X} bytes)",
                    name,
                    segment.address(),
                    segment.end(),
                    segment.offset(),
                    segment.size()
                )
            } else {
                format!("  {:<6} -", name)
            }
        })
        .collect()
}

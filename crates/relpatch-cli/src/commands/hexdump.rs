//! Hexdump command implementation.
//!
//! Displays bytes of the mapped executable in traditional hexdump format.
//!
//! # Output Format
//!
//! ```text
//! 0x1000: E8 11 22 33 44 90 90 90  CC CC CC CC CC CC CC CC  |."3D............|
//! ```

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::image_file::MappedFile;

/// Run the hexdump command
pub fn run(exe: &Path, rva: usize, size: usize, ascii: bool) -> Result<()> {
    let file = MappedFile::open(exe)?;
    let bytes = file.bytes_at(rva, size)?;

    println!("Hexdump at +0x{:X} ({} bytes):", rva, bytes.len());
    println!();
    for line in format_lines(bytes, rva, ascii, |_| false) {
        println!("{}", line);
    }

    Ok(())
}

/// Render `bytes` 16 per line, labelling each line with its offset from `start`.
///
/// Bytes for which `highlight` returns true (by index into `bytes`) are shown in red.
pub fn format_lines(
    bytes: &[u8],
    start: usize,
    ascii: bool,
    highlight: impl Fn(usize) -> bool,
) -> Vec<String> {
    let mut lines = Vec::new();

    for (i, chunk) in bytes.chunks(16).enumerate() {
        let mut line = format!("0x{:04X}: ", start + i * 16);

        // Hex bytes
        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                line.push(' ');
            }
            let hex = format!("{:02X}", byte);
            if highlight(i * 16 + j) {
                line.push_str(&hex.red().bold().to_string());
            } else {
                line.push_str(&hex);
            }
            line.push(' ');
        }

        // Padding for incomplete lines
        for j in chunk.len()..16 {
            if j == 8 {
                line.push(' ');
            }
            line.push_str("   ");
        }

        // ASCII representation
        if ascii {
            line.push_str(" |");
            for byte in chunk {
                if (0x20..0x7F).contains(byte) {
                    line.push(*byte as char);
                } else {
                    line.push('.');
                }
            }
            for _ in chunk.len()..16 {
                line.push(' ');
            }
            line.push('|');
        }

        lines.push(line.trim_end().to_string());
    }

    lines
}

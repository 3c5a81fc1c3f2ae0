//! relpatch CLI - offline inspection of host executables and offset tables.
//!
//! Works on the executable file rather than a running process: sections are laid out the
//! way the loader maps them, so segments, resolved addresses and patch-site bytes match
//! what a plugin sees at runtime.

mod commands;
mod image_file;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::hex_utils::parse_hex_address;

/// Default base used when printing absolute addresses for 64-bit executables.
const DEFAULT_BASE: &str = "0x140000000";

#[derive(Parser)]
#[command(name = "relpatch")]
#[command(author, version, about = "Inspect host executables and offset tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the named segments of an executable
    Segments {
        /// Path to the executable
        exe: PathBuf,

        /// Base address used for absolute addresses
        #[arg(long, default_value = DEFAULT_BASE, value_parser = parse_hex_address)]
        base: usize,
    },

    /// Resolve offset IDs to addresses
    Resolve {
        /// Path to the executable
        exe: PathBuf,

        /// JSON version table
        #[arg(short, long)]
        table: PathBuf,

        /// Host build to select (defaults to the only build in the table)
        #[arg(short, long)]
        build: Option<relpatch::Version>,

        /// IDs to resolve (all IDs when omitted)
        #[arg(short, long, value_delimiter = ',')]
        id: Vec<u64>,

        /// Base address used for absolute addresses
        #[arg(long, default_value = DEFAULT_BASE, value_parser = parse_hex_address)]
        base: usize,
    },

    /// Check the bytes at a patch site against a pattern
    Verify {
        /// Path to the executable
        exe: PathBuf,

        /// Pattern such as "E8 ?? ?? ?? ??"
        #[arg(short, long)]
        pattern: relpatch::Pattern,

        #[command(flatten)]
        site: commands::verify::SiteArgs,
    },

    /// Show raw bytes of the mapped executable
    Hexdump {
        /// Path to the executable
        exe: PathBuf,

        /// Offset from the image base (hex)
        #[arg(short, long, value_parser = parse_hex_address)]
        rva: usize,

        /// Number of bytes
        #[arg(short, long, default_value = "64")]
        size: usize,

        /// Show ASCII column
        #[arg(long)]
        ascii: bool,
    },

    /// Inspect or edit a JSON version table
    Offsets {
        #[command(subcommand)]
        action: commands::offsets::OffsetsAction,
    },

    /// Write a configuration file with every default spelled out
    InitConfig {
        /// Output path
        #[arg(default_value = "relpatch.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relpatch=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Segments { exe, base } => commands::segments::run(&exe, base),
        Commands::Resolve {
            exe,
            table,
            build,
            id,
            base,
        } => commands::resolve::run(&exe, &table, build, &id, base),
        Commands::Verify { exe, pattern, site } => commands::verify::run(&exe, &pattern, &site),
        Commands::Hexdump {
            exe,
            rva,
            size,
            ascii,
        } => commands::hexdump::run(&exe, rva, size, ascii),
        Commands::Offsets { action } => commands::offsets::run(action),
        Commands::InitConfig { output, force } => commands::init_config::run(&output, force),
    }
}

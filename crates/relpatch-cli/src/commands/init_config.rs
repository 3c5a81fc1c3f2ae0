//! Init-config command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use relpatch::Config;
use tracing::info;

/// Run the init-config command
pub fn run(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let content = Config::default().to_toml()?;
    std::fs::write(output, content)?;
    info!("Wrote default configuration to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relpatch.toml");

        run(&path, false).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        assert!(run(&path, false).is_err());
        assert!(run(&path, true).is_ok());
    }
}

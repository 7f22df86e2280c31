// src/utils/env.rs
use anyhow::Result;
use log::{info, warn};

/// Loads variables from `.env` (or the given file) without overriding ones
/// already set in the process environment. A missing file is not an error.
pub fn load_env(file_path: Option<&str>) -> Result<()> {
    let loaded = match file_path {
        Some(path) => dotenv::from_filename(path).map(|_| path.to_string()),
        None => dotenv::dotenv().map(|p| p.display().to_string()),
    };
    match loaded {
        Ok(path) => info!("Loaded environment variables from {}", path),
        Err(dotenv::Error::Io(e)) => warn!(
            "Could not open env file ({}). Proceeding with system environment variables.",
            e
        ),
        Err(e) => return Err(anyhow::anyhow!("Failed to parse env file: {}", e)),
    }
    Ok(())
}

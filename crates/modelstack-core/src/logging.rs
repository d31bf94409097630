//! Run logging bootstrap
//!
//! Every run writes a timestamped log file under `logs/` next to the
//! console output, and refreshes a fixed pointer file naming the most
//! recent log so support requests can always find it.

use crate::error::{InstallError, Result};
use crate::settings::Settings;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the console and run-file subscribers and write the
/// `latest-log.txt` pointer. Call once, before the first step runs.
pub fn init(settings: &Settings, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(settings.logs_dir())?;
    let file = std::fs::File::create(settings.run_log_path())?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| InstallError::Other(format!("failed to initialize logging: {e}")))?;

    std::fs::write(
        settings.latest_log_pointer(),
        format!("{}\n", settings.run_log_path().display()),
    )?;
    tracing::info!("logging to {}", settings.run_log_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn pointer_file_names_the_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("stack"));
        init(&settings, false).unwrap();
        let pointer = std::fs::read_to_string(settings.latest_log_pointer()).unwrap();
        assert_eq!(
            PathBuf::from(pointer.trim()),
            settings.run_log_path().to_path_buf()
        );
        assert!(settings.run_log_path().exists());
    }
}

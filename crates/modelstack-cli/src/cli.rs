//! CLI flag definitions using clap

use clap::{Parser, ValueEnum};
use modelstack_core::BackendKind;
use std::path::PathBuf;

/// Unattended installer for a local model runtime + web UI stack
#[derive(Parser)]
#[command(name = "modelstack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Execution backend for the web UI (auto-detected when omitted)
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Compat-layer distribution hosting the web UI (implies the
    /// compat-layer backend)
    #[arg(long)]
    pub distro: Option<String>,

    /// Base installation directory (defaults to the per-user data dir)
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Remove the installed stack instead of installing it
    #[arg(long)]
    pub uninstall: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Backend choices exposed on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BackendArg {
    /// Web UI executable already installed on the host PATH
    Native,
    /// Web UI in a container with a fixed port mapping
    Container,
    /// Web UI inside a Linux compatibility-layer distribution
    CompatLayer,
    /// Web UI inside a dedicated Python environment
    IsolatedRuntime,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Native => BackendKind::NativeHost,
            BackendArg::Container => BackendKind::Container,
            BackendArg::CompatLayer => BackendKind::CompatLayer,
            BackendArg::IsolatedRuntime => BackendKind::IsolatedRuntime,
        }
    }
}

impl std::fmt::Display for BackendArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BackendKind::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_values_round_trip_to_kinds() {
        assert_eq!(
            BackendKind::from(BackendArg::CompatLayer),
            BackendKind::CompatLayer
        );
        assert_eq!(BackendArg::Container.to_string(), "container");
        assert_eq!(BackendArg::IsolatedRuntime.to_string(), "isolated-runtime");
    }

    #[test]
    fn verify_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

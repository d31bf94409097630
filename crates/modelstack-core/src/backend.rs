//! Backend capability probing and selection
//!
//! Capabilities are probed once per run and cached in `Probes`; selection
//! itself is a pure function over those flags, so precedence rules are
//! testable without touching the host.

use crate::error::{InstallError, Result};
use crate::runner::ProcessRunner;
use crate::settings::Settings;
use std::path::PathBuf;
use tracing::{debug, info};

/// Requested backend, before capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NativeHost,
    Container,
    CompatLayer,
    IsolatedRuntime,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::NativeHost => "native",
            Self::Container => "container",
            Self::CompatLayer => "compat-layer",
            Self::IsolatedRuntime => "isolated-runtime",
        };
        write!(f, "{value}")
    }
}

/// The execution backend chosen for this run.
///
/// Selected exactly once; every other component receives it by reference
/// and never re-selects mid-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendProfile {
    /// Web UI executable already on the host PATH.
    NativeHost,
    /// Web UI in a named container with a fixed port mapping.
    Container {
        container_name: String,
        image: String,
    },
    /// Web UI inside a Linux compatibility-layer distribution.
    CompatLayer { distro: String },
    /// Web UI inside a dedicated Python virtual environment.
    IsolatedRuntime { venv_dir: PathBuf },
}

impl BackendProfile {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::NativeHost => BackendKind::NativeHost,
            Self::Container { .. } => BackendKind::Container,
            Self::CompatLayer { .. } => BackendKind::CompatLayer,
            Self::IsolatedRuntime { .. } => BackendKind::IsolatedRuntime,
        }
    }
}

impl std::fmt::Display for BackendProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CompatLayer { distro } => write!(f, "compat-layer ({distro})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Host capabilities, probed once per run.
#[derive(Debug, Clone, Default)]
pub struct Probes {
    /// The container engine daemon answered.
    pub container_engine: bool,
    /// Installed compatibility-layer distributions, default first.
    pub compat_distros: Vec<String>,
    /// Python launcher preference, e.g. `["py", "-3.11"]` or `["python3"]`.
    pub python: Option<Vec<String>>,
    /// The web UI executable is already on PATH.
    pub webui_on_path: bool,
}

impl Probes {
    /// Probe the host once. Callers cache the result for the whole run;
    /// nothing re-probes behind their back.
    pub async fn detect(runner: &ProcessRunner) -> Self {
        let container_engine = match runner.run("docker", &["info", "--format", "{{.ServerVersion}}"]).await {
            Ok(output) => output.success(),
            Err(_) => false,
        };

        let compat_distros = Self::detect_compat_distros(runner).await;
        let python = Self::detect_python(runner).await;
        let webui_on_path = runner.which("open-webui").is_some();

        let probes = Self {
            container_engine,
            compat_distros,
            python,
            webui_on_path,
        };
        debug!("capability probes: {probes:?}");
        probes
    }

    /// List compatibility-layer distributions; empty when the layer is
    /// absent. The launcher lists the default distribution first.
    async fn detect_compat_distros(runner: &ProcessRunner) -> Vec<String> {
        if !cfg!(windows) {
            return Vec::new();
        }
        match runner.run("wsl", &["-l", "-q"]).await {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First Python launcher that answers `--version`.
    async fn detect_python(runner: &ProcessRunner) -> Option<Vec<String>> {
        let candidates: &[&[&str]] = if cfg!(windows) {
            &[&["py", "-3.11"], &["py", "-3.12"], &["python"]]
        } else {
            &[&["python3"], &["python"]]
        };
        for candidate in candidates {
            let program = candidate[0];
            let mut args: Vec<&str> = candidate[1..].to_vec();
            args.push("--version");
            if let Ok(output) = runner.run(program, &args).await {
                if output.success() {
                    return Some(candidate.iter().map(|s| s.to_string()).collect());
                }
            }
        }
        None
    }

    /// Default compatibility-layer distribution, when any is installed.
    pub fn default_compat_distro(&self) -> Option<&str> {
        self.compat_distros.first().map(String::as_str)
    }
}

/// Chooses the backend profile from the cached probes.
pub struct BackendSelector;

impl BackendSelector {
    /// Resolve the profile for this run.
    ///
    /// Automatic precedence: container engine, then compatibility layer
    /// (only when a distribution resolves), then the isolated runtime as
    /// the unconditional last resort. An explicit request whose
    /// prerequisite is missing fails fast; it is never silently
    /// substituted.
    pub fn select(
        requested: Option<BackendKind>,
        distro: Option<&str>,
        probes: &Probes,
        settings: &Settings,
    ) -> Result<BackendProfile> {
        // A bare --distro is an explicit compat-layer request.
        let requested = match (requested, distro) {
            (None, Some(_)) => Some(BackendKind::CompatLayer),
            (req, _) => req,
        };

        let profile = match requested {
            Some(BackendKind::Container) => {
                if !probes.container_engine {
                    return Err(InstallError::BackendUnavailable(
                        "container engine is not reachable; start the Docker daemon or choose another backend".into(),
                    ));
                }
                Self::container_profile(settings)
            }
            Some(BackendKind::CompatLayer) => {
                let distro = Self::resolve_distro(distro, probes)?;
                BackendProfile::CompatLayer { distro }
            }
            Some(BackendKind::IsolatedRuntime) => {
                if probes.python.is_none() {
                    return Err(InstallError::BackendUnavailable(
                        "no Python launcher found on PATH; install Python 3 to use the isolated runtime".into(),
                    ));
                }
                BackendProfile::IsolatedRuntime {
                    venv_dir: settings.venv_dir(),
                }
            }
            Some(BackendKind::NativeHost) => {
                if !probes.webui_on_path {
                    return Err(InstallError::BackendUnavailable(
                        "open-webui was not found on PATH; install it on the host or choose another backend".into(),
                    ));
                }
                BackendProfile::NativeHost
            }
            None => {
                if probes.container_engine {
                    Self::container_profile(settings)
                } else if let Some(distro) = probes.default_compat_distro() {
                    BackendProfile::CompatLayer {
                        distro: distro.to_string(),
                    }
                } else {
                    // Last resort: depends only on the language runtime.
                    BackendProfile::IsolatedRuntime {
                        venv_dir: settings.venv_dir(),
                    }
                }
            }
        };

        info!("selected backend: {profile}");
        Ok(profile)
    }

    fn container_profile(settings: &Settings) -> BackendProfile {
        BackendProfile::Container {
            container_name: settings.container_name.clone(),
            image: settings.container_image.clone(),
        }
    }

    fn resolve_distro(requested: Option<&str>, probes: &Probes) -> Result<String> {
        match requested {
            Some(name) => {
                if probes.compat_distros.iter().any(|d| d == name) {
                    Ok(name.to_string())
                } else {
                    Err(InstallError::Config(format!(
                        "compat-layer distribution '{name}' is not installed (available: {:?})",
                        probes.compat_distros
                    )))
                }
            }
            None => probes
                .default_compat_distro()
                .map(str::to_string)
                .ok_or_else(|| {
                    InstallError::BackendUnavailable(
                        "no compat-layer distribution is installed; install one or pass --distro".into(),
                    )
                }),
        }
    }
}

//! Immutable run configuration
//!
//! One `Settings` value is constructed at startup and passed by reference
//! to every component. Nothing mutates it afterwards; a second run builds
//! a fresh value.

use crate::error::{InstallError, Result};
use crate::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Model artifact and registration parameters.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Hugging Face repository holding the GGUF artifact.
    pub repo: String,
    /// Artifact file name inside the repository.
    pub file: String,
    /// Name the model is registered under in the runtime catalog.
    pub name: String,
    pub num_ctx: u32,
    pub num_thread: u32,
    pub num_gpu: u32,
    pub temperature: f32,
    /// Optional expected SHA-256 of the artifact, hex encoded.
    pub sha256: Option<String>,
}

impl ModelSpec {
    /// Direct-download URL for the artifact (supports byte ranges).
    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/resolve/main/{}?download=true",
            self.repo, self.file
        )
    }

    /// Desired Modelfile contents used to register the model.
    pub fn modelfile_contents(&self) -> String {
        let from = if cfg!(windows) {
            format!("FROM .\\{}", self.file)
        } else {
            format!("FROM ./{}", self.file)
        };
        format!(
            "{from}\nPARAMETER num_ctx {}\nPARAMETER num_thread {}\nPARAMETER num_gpu {}\nPARAMETER temperature {}\n",
            self.num_ctx, self.num_thread, self.num_gpu, self.temperature
        )
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(8)
            .max(4);
        Self {
            repo: "ggml-org/SmolLM3-3B-GGUF".to_string(),
            file: "SmolLM3-Q4_K_M.gguf".to_string(),
            name: "smollm3-local".to_string(),
            num_ctx: 8192,
            num_thread: threads,
            num_gpu: 8,
            temperature: 0.3,
            sha256: None,
        }
    }
}

/// Immutable configuration for one installer run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per-user base directory everything is installed under.
    pub base_dir: PathBuf,
    /// Port the model runtime server listens on.
    pub runtime_port: u16,
    /// Port the web UI listens on.
    pub webui_port: u16,
    pub model: ModelSpec,
    /// Release archive for the runtime server binary.
    pub runtime_release_url: String,
    /// Container image used when the web UI runs on the container backend.
    pub container_image: String,
    /// Name of the web UI container.
    pub container_name: String,
    /// Shared retry schedule for downloads and liveness polling.
    pub retry: RetryPolicy,
    /// Upper bound for a started service to report live.
    pub start_timeout: Duration,
    /// Connect timeout for a single port probe.
    pub probe_timeout: Duration,
    /// Timestamped log file for this run, under `logs/`.
    run_log: PathBuf,
}

impl Settings {
    /// Build settings rooted at `base_dir`, stamping the run log name.
    pub fn new(base_dir: PathBuf) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let run_log = base_dir.join("logs").join(format!("install-{stamp}.log"));
        Self {
            base_dir,
            runtime_port: 11434,
            webui_port: 3000,
            model: ModelSpec::default(),
            runtime_release_url: default_runtime_release_url().to_string(),
            container_image: "open-webui/open-webui:latest".to_string(),
            container_name: "open-webui".to_string(),
            retry: RetryPolicy::default(),
            start_timeout: Duration::from_secs(180),
            probe_timeout: Duration::from_millis(1500),
            run_log,
        }
    }

    /// Settings under the platform per-user data directory.
    pub fn with_default_base() -> Result<Self> {
        let data_dir = dirs_next::data_local_dir()
            .ok_or_else(|| InstallError::Config("cannot determine the per-user data directory".into()))?;
        Ok(Self::new(data_dir.join("modelstack")))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base_dir.join("runtime")
    }

    /// Installed runtime server executable.
    pub fn runtime_bin(&self) -> PathBuf {
        self.runtime_dir().join(exe_name("ollama"))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_dir.join("models")
    }

    pub fn model_artifact_path(&self) -> PathBuf {
        self.models_dir().join(&self.model.file)
    }

    pub fn modelfile_path(&self) -> PathBuf {
        self.models_dir().join("Modelfile")
    }

    pub fn webui_dir(&self) -> PathBuf {
        self.base_dir.join("webui")
    }

    /// Virtual environment used by the isolated-runtime backend.
    pub fn venv_dir(&self) -> PathBuf {
        self.base_dir.join("webui-venv")
    }

    /// Web UI executable inside the isolated-runtime environment.
    pub fn venv_webui_bin(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts").join("open-webui.exe")
        } else {
            self.venv_dir().join("bin").join("open-webui")
        }
    }

    /// Python interpreter inside the isolated-runtime environment.
    pub fn venv_python(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts").join("python.exe")
        } else {
            self.venv_dir().join("bin").join("python")
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// The timestamped log file for this run.
    pub fn run_log_path(&self) -> &Path {
        &self.run_log
    }

    /// Pointer file naming the most recent run log.
    pub fn latest_log_pointer(&self) -> PathBuf {
        self.logs_dir().join("latest-log.txt")
    }

    /// Pid file recording a detached service process.
    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.base_dir.join(format!("{service}.pid"))
    }

    pub fn runtime_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.runtime_port)
    }

    /// Model catalog endpoint, also used as the runtime readiness check.
    pub fn tags_url(&self) -> String {
        format!("{}/api/tags", self.runtime_base_url())
    }

    pub fn webui_url(&self) -> String {
        format!("http://localhost:{}", self.webui_port)
    }

    pub fn start_script_path(&self) -> PathBuf {
        self.base_dir.join(script_name("start-stack"))
    }

    pub fn stop_script_path(&self) -> PathBuf {
        self.base_dir.join(script_name("stop-stack"))
    }

    /// Directories that must exist before any step runs.
    pub fn managed_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.base_dir.clone(),
            self.downloads_dir(),
            self.runtime_dir(),
            self.models_dir(),
            self.webui_dir(),
            self.logs_dir(),
        ]
    }
}

/// Append the platform executable suffix.
pub fn exe_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn script_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.cmd")
    } else {
        format!("{name}.sh")
    }
}

fn default_runtime_release_url() -> &'static str {
    if cfg!(windows) {
        "https://github.com/ollama/ollama/releases/download/v0.11.4/ollama-windows-amd64.zip"
    } else if cfg!(target_os = "macos") {
        "https://github.com/ollama/ollama/releases/download/v0.11.4/ollama-darwin.tgz"
    } else {
        "https://github.com/ollama/ollama/releases/download/v0.11.4/ollama-linux-amd64.tgz"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_base_dir() {
        let settings = Settings::new(PathBuf::from("/tmp/stack"));
        assert!(settings.downloads_dir().starts_with("/tmp/stack"));
        assert!(settings.model_artifact_path().ends_with("SmolLM3-Q4_K_M.gguf"));
        assert!(settings.run_log_path().starts_with("/tmp/stack/logs"));
        assert!(settings
            .run_log_path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("install-"));
    }

    #[test]
    fn modelfile_pins_registration_parameters() {
        let spec = ModelSpec::default();
        let contents = spec.modelfile_contents();
        assert!(contents.contains("SmolLM3-Q4_K_M.gguf"));
        assert!(contents.contains("PARAMETER num_ctx 8192"));
        assert!(contents.contains("PARAMETER temperature 0.3"));
    }

    #[test]
    fn download_url_targets_the_artifact() {
        let spec = ModelSpec::default();
        assert_eq!(
            spec.download_url(),
            "https://huggingface.co/ggml-org/SmolLM3-3B-GGUF/resolve/main/SmolLM3-Q4_K_M.gguf?download=true"
        );
    }

    #[test]
    fn thread_count_has_a_floor() {
        assert!(ModelSpec::default().num_thread >= 4);
    }
}

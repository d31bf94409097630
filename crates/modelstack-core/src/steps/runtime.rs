//! Model runtime server steps: install, start, autostart
//!
//! The runtime server always runs on the host regardless of the selected
//! backend; the backend choice only governs where the web UI lives.

use crate::autostart::AutostartEntry;
use crate::download::DownloadTask;
use crate::error::{InstallError, Result};
use crate::plan::{InstallStep, Stack};
use crate::runner::ProcessRunner;
use crate::service::{LaunchSpec, ServiceDescriptor};
use crate::settings::Settings;
use crate::steps::RUNTIME_AUTOSTART_NAME;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Resolve the runtime binary: the managed install wins, PATH is the
/// fallback for a pre-existing host install.
pub fn runtime_binary(settings: &Settings, runner: &ProcessRunner) -> PathBuf {
    let managed = settings.runtime_bin();
    if managed.exists() {
        return managed;
    }
    runner.which("ollama").unwrap_or(managed)
}

/// Descriptor for the host-side runtime server process.
pub fn runtime_descriptor(settings: &Settings, runner: &ProcessRunner) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "runtime".to_string(),
        port: settings.runtime_port,
        launch: LaunchSpec::Detached {
            program: runtime_binary(settings, runner),
            args: vec!["serve".to_string()],
            env: vec![(
                "OLLAMA_MODELS".to_string(),
                settings.models_dir().display().to_string(),
            )],
            cwd: Some(settings.runtime_dir()),
        },
        process_hint: Some("ollama".to_string()),
    }
}

/// Autostart entry launching the runtime server at logon.
pub fn runtime_autostart_entry(settings: &Settings, runner: &ProcessRunner) -> AutostartEntry {
    let binary = runtime_binary(settings, runner);
    let models = settings.models_dir();
    let command = if cfg!(windows) {
        format!(
            "set \"OLLAMA_MODELS={}\"\n\"{}\" serve",
            models.display(),
            binary.display()
        )
    } else {
        format!(
            "env OLLAMA_MODELS=\"{}\" \"{}\" serve",
            models.display(),
            binary.display()
        )
    };
    AutostartEntry::new(RUNTIME_AUTOSTART_NAME, command).with_workdir(settings.runtime_dir())
}

/// Downloads and unpacks the runtime server release archive.
pub struct InstallRuntime;

#[async_trait]
impl InstallStep for InstallRuntime {
    fn id(&self) -> &'static str {
        "install-runtime"
    }

    fn label(&self) -> String {
        "Install the model runtime server".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        Ok(stack.settings.runtime_bin().exists() || stack.runner.which("ollama").is_some())
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let url = &stack.settings.runtime_release_url;
        let archive_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                InstallError::Config(format!("runtime release URL has no file name: {url}"))
            })?;
        let archive_path = stack.settings.downloads_dir().join(archive_name);
        let task = DownloadTask::new(url.clone(), archive_path.clone(), "runtime server archive");
        stack.downloader.fetch(&task).await?;

        let target = stack.settings.runtime_dir();
        info!("extracting {} into {}", archive_path.display(), target.display());
        extract_archive(&archive_path, &target)?;
        if !stack.settings.runtime_bin().exists() && stack.runner.which("ollama").is_none() {
            return Err(InstallError::Other(format!(
                "runtime archive did not contain the expected binary at {}",
                stack.settings.runtime_bin().display()
            )));
        }
        Ok(())
    }
}

/// Unpack a release archive, dispatching on its extension.
fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    let name = archive.to_string_lossy();
    if name.ends_with(".zip") {
        extract_zip(archive, target)
    } else if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        let file = std::fs::File::open(archive)?;
        let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tarball.unpack(target)?;
        Ok(())
    } else {
        Err(InstallError::Config(format!(
            "unsupported archive format: {name}"
        )))
    }
}

fn extract_zip(archive: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| InstallError::Other(format!("failed to read zip archive: {e}")))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| InstallError::Other(format!("failed to read zip entry {index}: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let outpath = target.join(relative);
        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

/// Starts the runtime server and waits until its API answers.
pub struct StartRuntime;

#[async_trait]
impl InstallStep for StartRuntime {
    fn id(&self) -> &'static str {
        "start-runtime"
    }

    fn label(&self) -> String {
        "Start the model runtime server".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let descriptor = runtime_descriptor(&stack.settings, &stack.runner);
        Ok(stack.supervisor().is_running(&descriptor).await)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let descriptor = runtime_descriptor(&stack.settings, &stack.runner);
        let supervisor = stack.supervisor();
        supervisor.start(&descriptor).await?;
        supervisor.wait_until_running(&descriptor).await?;
        supervisor
            .wait_for_http(&descriptor, &stack.settings.tags_url())
            .await
    }
}

/// Registers the runtime server for launch at logon.
pub struct RuntimeAutostart;

#[async_trait]
impl InstallStep for RuntimeAutostart {
    fn id(&self) -> &'static str {
        "runtime-autostart"
    }

    fn label(&self) -> String {
        "Register runtime autostart".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let entry = runtime_autostart_entry(&stack.settings, &stack.runner);
        Ok(stack.registrar().active_mechanism(&entry).await.is_some())
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let entry = runtime_autostart_entry(&stack.settings, &stack.runner);
        stack.registrar().register(&entry).await?;
        Ok(())
    }
}

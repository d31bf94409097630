//! Teardown steps
//!
//! Each step treats "resource already absent" as success so a partial
//! prior install still gets cleaned completely. All teardown steps are
//! non-fatal; warnings are aggregated in the run report instead of
//! stopping the sequence.

use crate::autostart::AutostartEntry;
use crate::error::{InstallError, Result};
use crate::plan::{InstallStep, Stack};
use crate::service::{LaunchSpec, ServiceDescriptor, port_open};
use crate::steps::extras::default_menu_dir;
use crate::steps::runtime::runtime_descriptor;
use crate::steps::{RUNTIME_AUTOSTART_NAME, WEBUI_AUTOSTART_NAME};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Entries to remove; the command is irrelevant for removal, which only
/// needs the logical name to detect the active mechanism.
fn teardown_entries() -> Vec<AutostartEntry> {
    vec![
        AutostartEntry::new(RUNTIME_AUTOSTART_NAME, ""),
        AutostartEntry::new(WEBUI_AUTOSTART_NAME, ""),
    ]
}

/// Web UI descriptor that works without a selected backend: the pid file
/// and the process-name fallback cover every non-container case, and the
/// container is removed by its own teardown step.
fn webui_teardown_descriptor(stack: &Stack) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "webui".to_string(),
        port: stack.settings.webui_port,
        launch: LaunchSpec::Detached {
            program: PathBuf::from("open-webui"),
            args: vec![],
            env: vec![],
            cwd: None,
        },
        process_hint: Some("open-webui".to_string()),
    }
}

/// Removes both logon autostart entries, whichever mechanism holds them.
pub struct RemoveAutostartEntries;

#[async_trait]
impl InstallStep for RemoveAutostartEntries {
    fn id(&self) -> &'static str {
        "remove-autostart"
    }

    fn label(&self) -> String {
        "Remove autostart entries".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let registrar = stack.registrar();
        for entry in teardown_entries() {
            if registrar.active_mechanism(&entry).await.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let registrar = stack.registrar();
        let mut failures = Vec::new();
        for entry in teardown_entries() {
            match registrar.unregister(&entry).await {
                Ok(Some(mechanism)) => {
                    info!("removed '{}' ({mechanism:?})", entry.name);
                }
                Ok(None) => {}
                Err(err) => failures.push(format!("{}: {err}", entry.name)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstallError::Other(failures.join("; ")))
        }
    }
}

/// Stops the runtime server and any non-container web UI process.
pub struct StopServices;

#[async_trait]
impl InstallStep for StopServices {
    fn id(&self) -> &'static str {
        "stop-services"
    }

    fn label(&self) -> String {
        "Stop running services".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let timeout = stack.settings.probe_timeout;
        Ok(!port_open(stack.settings.webui_port, timeout).await
            && !port_open(stack.settings.runtime_port, timeout).await)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let supervisor = stack.supervisor();
        supervisor.stop(&webui_teardown_descriptor(stack)).await?;
        supervisor
            .stop(&runtime_descriptor(&stack.settings, &stack.runner))
            .await?;
        Ok(())
    }
}

/// Removes the web UI container when a container engine is present.
pub struct RemoveContainer;

#[async_trait]
impl InstallStep for RemoveContainer {
    fn id(&self) -> &'static str {
        "remove-container"
    }

    fn label(&self) -> String {
        "Remove the web UI container".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        if !stack.probes.container_engine {
            // No engine, no container to clean up.
            return Ok(true);
        }
        Ok(!stack
            .supervisor()
            .container_exists(&stack.settings.container_name)
            .await?)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let name = stack.settings.container_name.as_str();
        let output = stack.runner.run("docker", &["rm", "-f", name]).await?;
        if output.success() {
            info!("removed container '{name}'");
            Ok(())
        } else {
            Err(InstallError::Other(format!(
                "docker rm -f {name} failed: {}",
                output.tail(5)
            )))
        }
    }
}

/// Removes the generated menu shortcuts.
pub struct RemoveShortcuts {
    menu_dir: PathBuf,
}

impl RemoveShortcuts {
    pub fn with_menu_dir(dir: PathBuf) -> Self {
        Self { menu_dir: dir }
    }
}

impl Default for RemoveShortcuts {
    fn default() -> Self {
        Self {
            menu_dir: default_menu_dir(),
        }
    }
}

#[async_trait]
impl InstallStep for RemoveShortcuts {
    fn id(&self) -> &'static str {
        "remove-shortcuts"
    }

    fn label(&self) -> String {
        "Remove menu shortcuts".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, _stack: &Stack) -> Result<bool> {
        if cfg!(windows) {
            // The whole menu folder belongs to us on Windows.
            Ok(!self.menu_dir.exists())
        } else {
            Ok(!self.menu_dir.join("modelstack-webui.desktop").exists())
        }
    }

    async fn apply(&self, _stack: &Stack) -> Result<()> {
        if cfg!(windows) {
            std::fs::remove_dir_all(&self.menu_dir)?;
        } else {
            std::fs::remove_file(self.menu_dir.join("modelstack-webui.desktop"))?;
        }
        info!("removed shortcuts under {}", self.menu_dir.display());
        Ok(())
    }
}

/// Removes the base installation directory and everything under it.
pub struct RemoveBaseDirectory;

#[async_trait]
impl InstallStep for RemoveBaseDirectory {
    fn id(&self) -> &'static str {
        "remove-base-dir"
    }

    fn label(&self) -> String {
        "Remove the installation directory".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        Ok(!stack.settings.base_dir.exists())
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        std::fs::remove_dir_all(&stack.settings.base_dir)?;
        info!("removed {}", stack.settings.base_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Probes;
    use crate::settings::Settings;

    fn stack(dir: &std::path::Path) -> Stack {
        Stack::new(Settings::new(dir.join("stack")), Probes::default(), None).unwrap()
    }

    #[tokio::test]
    async fn base_directory_removal_is_a_noop_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let step = RemoveBaseDirectory;
        assert!(step.is_satisfied(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn base_directory_removal_deletes_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        std::fs::create_dir_all(stack.settings.downloads_dir()).unwrap();
        std::fs::write(stack.settings.base_dir.join("stray.txt"), b"x").unwrap();
        let step = RemoveBaseDirectory;
        assert!(!step.is_satisfied(&stack).await.unwrap());
        step.apply(&stack).await.unwrap();
        assert!(step.is_satisfied(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn container_removal_is_satisfied_without_an_engine() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let step = RemoveContainer;
        assert!(step.is_satisfied(&stack).await.unwrap());
    }

    #[tokio::test]
    async fn shortcut_removal_is_a_noop_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack(dir.path());
        let step = RemoveShortcuts::with_menu_dir(dir.path().join("menu"));
        assert!(step.is_satisfied(&stack).await.unwrap());
    }
}

//! Logon autostart registration with a deterministic fallback chain
//!
//! The primary mechanism is the OS logon scheduler (`schtasks` on Windows,
//! a `systemd --user` unit elsewhere). When the scheduler denies the
//! request, a launcher script in the user's startup folder takes over.
//! Exactly one mechanism is ever active per logical entry; re-registering
//! overwrites in place under whichever mechanism currently holds the entry.

use crate::error::{InstallError, Result};
use crate::runner::ProcessRunner;
use crate::settings::Settings;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which mechanism currently carries (or was used for) an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutostartMechanism {
    SchedulerTask,
    StartupScript,
}

/// One logon-triggered launch registration.
#[derive(Debug, Clone)]
pub struct AutostartEntry {
    /// Logical name, also the scheduler task name.
    pub name: String,
    /// Command line executed at logon.
    pub command: String,
    pub workdir: Option<PathBuf>,
}

impl AutostartEntry {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }

    /// Filesystem-safe identifier derived from the logical name.
    pub fn slug(&self) -> String {
        self.name.to_lowercase().replace(' ', "-")
    }
}

/// Registers and removes logon autostart entries.
pub struct AutostartRegistrar<'a> {
    runner: &'a ProcessRunner,
    base_dir: PathBuf,
    startup_dir: PathBuf,
    unit_dir: PathBuf,
    scheduler_program: String,
}

impl<'a> AutostartRegistrar<'a> {
    pub fn new(runner: &'a ProcessRunner, settings: &Settings) -> Self {
        Self {
            runner,
            base_dir: settings.base_dir.clone(),
            startup_dir: default_startup_dir(),
            unit_dir: default_unit_dir(),
            scheduler_program: default_scheduler_program().to_string(),
        }
    }

    /// Override the scheduler CLI (used to exercise the fallback path).
    pub fn with_scheduler_program(mut self, program: impl Into<String>) -> Self {
        self.scheduler_program = program.into();
        self
    }

    /// Override the startup folder location.
    pub fn with_startup_dir(mut self, dir: PathBuf) -> Self {
        self.startup_dir = dir;
        self
    }

    /// Override the scheduler unit directory.
    pub fn with_unit_dir(mut self, dir: PathBuf) -> Self {
        self.unit_dir = dir;
        self
    }

    /// Which mechanism currently holds this entry, if any.
    pub async fn active_mechanism(&self, entry: &AutostartEntry) -> Option<AutostartMechanism> {
        if self.task_exists(entry).await {
            Some(AutostartMechanism::SchedulerTask)
        } else if self.startup_script_path(entry).exists() {
            Some(AutostartMechanism::StartupScript)
        } else {
            None
        }
    }

    /// Register (or re-register) the entry, returning the mechanism used.
    ///
    /// The scheduler is tried first; any privilege or API failure falls
    /// back to the startup folder. Both failing is fatal: silent success
    /// would leave the stack without autostart and nobody watching.
    pub async fn register(&self, entry: &AutostartEntry) -> Result<AutostartMechanism> {
        let wrapper = self.write_wrapper(entry)?;
        let current = self.active_mechanism(entry).await;

        if current == Some(AutostartMechanism::StartupScript) {
            // The fallback already owns this entry; overwrite it in place
            // rather than introducing a second mechanism.
            self.write_startup_script(entry, &wrapper)?;
            info!("updated startup-folder entry '{}'", entry.name);
            return Ok(AutostartMechanism::StartupScript);
        }

        match self.scheduler_register(entry, &wrapper).await {
            Ok(()) => {
                info!("created/updated scheduler task '{}'", entry.name);
                Ok(AutostartMechanism::SchedulerTask)
            }
            Err(scheduler_err) if current == Some(AutostartMechanism::SchedulerTask) => {
                Err(InstallError::Privilege(format!(
                    "cannot update existing scheduler task '{}': {scheduler_err}",
                    entry.name
                )))
            }
            Err(scheduler_err) => {
                warn!(
                    "scheduler registration for '{}' failed ({scheduler_err}); falling back to the startup folder",
                    entry.name
                );
                match self.write_startup_script(entry, &wrapper) {
                    Ok(path) => {
                        info!("created startup-folder entry: {}", path.display());
                        Ok(AutostartMechanism::StartupScript)
                    }
                    Err(script_err) => Err(InstallError::Privilege(format!(
                        "autostart registration for '{}' failed under both mechanisms \
                         (scheduler: {scheduler_err}; startup folder: {script_err})",
                        entry.name
                    ))),
                }
            }
        }
    }

    /// Remove whichever mechanism currently holds the entry. An absent
    /// entry is a successful no-op, not an error.
    pub async fn unregister(&self, entry: &AutostartEntry) -> Result<Option<AutostartMechanism>> {
        match self.active_mechanism(entry).await {
            Some(AutostartMechanism::SchedulerTask) => {
                self.scheduler_delete(entry).await?;
                info!("removed scheduler task '{}'", entry.name);
                Ok(Some(AutostartMechanism::SchedulerTask))
            }
            Some(AutostartMechanism::StartupScript) => {
                std::fs::remove_file(self.startup_script_path(entry))?;
                info!("removed startup-folder entry '{}'", entry.name);
                Ok(Some(AutostartMechanism::StartupScript))
            }
            None => {
                debug!("autostart entry '{}' is not registered", entry.name);
                Ok(None)
            }
        }
    }

    /// Path of the startup-folder launcher for this entry.
    pub fn startup_script_path(&self, entry: &AutostartEntry) -> PathBuf {
        let ext = if cfg!(windows) { "cmd" } else { "desktop" };
        self.startup_dir.join(format!("{}.{ext}", entry.slug()))
    }

    /// Wrapper script under the base directory that both mechanisms invoke.
    fn write_wrapper(&self, entry: &AutostartEntry) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.base_dir)?;
        let ext = if cfg!(windows) { "cmd" } else { "sh" };
        let path = self.base_dir.join(format!("{}.{ext}", entry.slug()));
        std::fs::write(&path, launcher_body(entry))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(path)
    }

    fn write_startup_script(&self, entry: &AutostartEntry, wrapper: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.startup_dir)?;
        let path = self.startup_script_path(entry);
        let contents = if cfg!(windows) {
            launcher_body(entry)
        } else {
            format!(
                "[Desktop Entry]\nType=Application\nName={}\nExec={}\nX-GNOME-Autostart-enabled=true\n",
                entry.name,
                wrapper.display()
            )
        };
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    async fn task_exists(&self, entry: &AutostartEntry) -> bool {
        let result = if cfg!(windows) {
            self.runner
                .run(&self.scheduler_program, &["/Query", "/TN", entry.name.as_str()])
                .await
        } else {
            let unit = format!("{}.service", entry.slug());
            self.runner
                .run(&self.scheduler_program, &["--user", "is-enabled", unit.as_str()])
                .await
        };
        matches!(result, Ok(output) if output.success())
    }

    async fn scheduler_register(&self, entry: &AutostartEntry, wrapper: &Path) -> Result<()> {
        if cfg!(windows) {
            let target = format!("\"{}\"", wrapper.display());
            self.runner
                .run_checked(
                    &self.scheduler_program,
                    &[
                        "/Create",
                        "/TN",
                        entry.name.as_str(),
                        "/TR",
                        target.as_str(),
                        "/SC",
                        "ONLOGON",
                        "/F",
                    ],
                )
                .await?;
            Ok(())
        } else {
            std::fs::create_dir_all(&self.unit_dir)?;
            let unit_name = format!("{}.service", entry.slug());
            let unit_path = self.unit_dir.join(&unit_name);
            std::fs::write(
                &unit_path,
                format!(
                    "[Unit]\nDescription={}\n\n[Service]\nExecStart={}\nRestart=no\n\n[Install]\nWantedBy=default.target\n",
                    entry.name,
                    wrapper.display()
                ),
            )?;
            let enabled = async {
                self.runner
                    .run_checked(&self.scheduler_program, &["--user", "daemon-reload"])
                    .await?;
                self.runner
                    .run_checked(&self.scheduler_program, &["--user", "enable", unit_name.as_str()])
                    .await
            }
            .await;
            if let Err(err) = enabled {
                // Do not leave a unit file the scheduler never accepted.
                let _ = std::fs::remove_file(&unit_path);
                return Err(err);
            }
            Ok(())
        }
    }

    async fn scheduler_delete(&self, entry: &AutostartEntry) -> Result<()> {
        if cfg!(windows) {
            self.runner
                .run_checked(
                    &self.scheduler_program,
                    &["/Delete", "/TN", entry.name.as_str(), "/F"],
                )
                .await?;
        } else {
            let unit_name = format!("{}.service", entry.slug());
            self.runner
                .run_checked(
                    &self.scheduler_program,
                    &["--user", "disable", unit_name.as_str()],
                )
                .await?;
            let _ = std::fs::remove_file(self.unit_dir.join(&unit_name));
        }
        Ok(())
    }
}

fn launcher_body(entry: &AutostartEntry) -> String {
    if cfg!(windows) {
        let mut body = String::from("@echo off\n");
        if let Some(dir) = &entry.workdir {
            body.push_str(&format!("cd /d \"{}\"\n", dir.display()));
        }
        body.push_str(&entry.command);
        body.push('\n');
        body
    } else {
        let mut body = String::from("#!/bin/sh\n");
        if let Some(dir) = &entry.workdir {
            body.push_str(&format!("cd \"{}\"\n", dir.display()));
        }
        body.push_str("exec ");
        body.push_str(&entry.command);
        body.push('\n');
        body
    }
}

fn default_scheduler_program() -> &'static str {
    if cfg!(windows) { "schtasks" } else { "systemctl" }
}

fn default_startup_dir() -> PathBuf {
    if cfg!(windows) {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join("Microsoft")
            .join("Windows")
            .join("Start Menu")
            .join("Programs")
            .join("Startup")
    } else {
        dirs_next::config_dir().unwrap_or_default().join("autostart")
    }
}

fn default_unit_dir() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_default()
        .join("systemd")
        .join("user")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_filesystem_safe() {
        let entry = AutostartEntry::new("Ollama Serve", "ollama serve");
        assert_eq!(entry.slug(), "ollama-serve");
    }

    #[test]
    fn launcher_body_includes_workdir_and_command() {
        let entry = AutostartEntry::new("Web UI", "open-webui serve --port 3000")
            .with_workdir(PathBuf::from("/opt/stack"));
        let body = launcher_body(&entry);
        assert!(body.contains("open-webui serve --port 3000"));
        assert!(body.contains("/opt/stack"));
    }

    #[cfg(unix)]
    #[test]
    fn startup_script_uses_desktop_entries_on_unix() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().to_path_buf());
        let runner = ProcessRunner::new();
        let registrar = AutostartRegistrar::new(&runner, &settings)
            .with_startup_dir(dir.path().join("startup"));
        let entry = AutostartEntry::new("Web UI", "open-webui serve");
        assert!(
            registrar
                .startup_script_path(&entry)
                .to_string_lossy()
                .ends_with("web-ui.desktop")
        );
    }
}

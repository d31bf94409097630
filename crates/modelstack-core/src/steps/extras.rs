//! Supplementary steps: PATH registration, the media codec tool,
//! launcher scripts and menu shortcuts
//!
//! None of these is load-bearing for the stack itself; they all run as
//! non-fatal steps whose failures surface as warnings.

use crate::backend::BackendProfile;
use crate::error::{InstallError, Result};
use crate::plan::{InstallStep, Stack};
use crate::settings::Settings;
use crate::steps::MENU_DIR_NAME;
use crate::steps::webui::{compat_serve_command, compat_sh};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Package-manager chain that installs ffmpeg inside a container or a
/// compat-layer distribution, whatever its base image uses.
const FFMPEG_INSTALL_CHAIN: &str =
    "command -v ffmpeg >/dev/null 2>&1 && ffmpeg -version | head -n1 || \
     ( (command -v apt-get >/dev/null 2>&1 && apt-get update && apt-get install -y ffmpeg) || \
       (command -v apk >/dev/null 2>&1 && apk add --no-cache ffmpeg) || \
       (command -v dnf >/dev/null 2>&1 && dnf install -y ffmpeg) || \
       echo 'No known package manager found; ffmpeg not installed.' )";

/// Adds the runtime directory to the user PATH (Windows hosts only).
pub struct RegisterRuntimePath;

#[async_trait]
impl InstallStep for RegisterRuntimePath {
    fn id(&self) -> &'static str {
        "runtime-path"
    }

    fn label(&self) -> String {
        "Add the runtime directory to the user PATH".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let dir = stack.settings.runtime_dir().display().to_string();
        let current = std::env::var("PATH").unwrap_or_default();
        Ok(current.split(';').any(|part| part.trim() == dir)
            || stack.runner.which("ollama").is_some())
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let current = std::env::var("PATH").unwrap_or_default();
        let extended = format!("{current};{}", stack.settings.runtime_dir().display());
        stack
            .runner
            .run_checked("setx", &["PATH", extended.as_str()])
            .await?;
        info!("added {} to the user PATH", stack.settings.runtime_dir().display());
        Ok(())
    }
}

/// Makes ffmpeg available wherever the web UI runs, since its speech
/// features shell out to it.
pub struct EnsureCodecTool;

#[async_trait]
impl InstallStep for EnsureCodecTool {
    fn id(&self) -> &'static str {
        "codec-tool"
    }

    fn label(&self) -> String {
        "Ensure the media codec tool (ffmpeg)".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        match stack.profile()? {
            BackendProfile::Container { container_name, .. } => {
                let output = stack
                    .runner
                    .run(
                        "docker",
                        &[
                            "exec",
                            container_name.as_str(),
                            "sh",
                            "-lc",
                            "command -v ffmpeg >/dev/null 2>&1",
                        ],
                    )
                    .await?;
                Ok(output.success())
            }
            BackendProfile::CompatLayer { distro } => {
                let result =
                    compat_sh(&stack.runner, distro, "command -v ffmpeg >/dev/null 2>&1", false)
                        .await;
                Ok(matches!(result, Ok(output) if output.success()))
            }
            _ => Ok(stack.runner.which("ffmpeg").is_some()),
        }
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        match stack.profile()? {
            BackendProfile::Container { container_name, .. } => {
                let output = stack
                    .runner
                    .run(
                        "docker",
                        &[
                            "exec",
                            container_name.as_str(),
                            "sh",
                            "-lc",
                            FFMPEG_INSTALL_CHAIN,
                        ],
                    )
                    .await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(InstallError::Other(format!(
                        "could not install ffmpeg inside container '{container_name}': {}",
                        output.tail(5)
                    )))
                }
            }
            BackendProfile::CompatLayer { distro } => {
                let output = compat_sh(&stack.runner, distro, FFMPEG_INSTALL_CHAIN, true).await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(InstallError::Other(format!(
                        "could not install ffmpeg inside distribution '{distro}': {}",
                        output.tail(5)
                    )))
                }
            }
            _ => self.ensure_on_host(stack).await,
        }
    }
}

impl EnsureCodecTool {
    async fn ensure_on_host(&self, stack: &Stack) -> Result<()> {
        if !cfg!(windows) {
            return Err(InstallError::Other(
                "ffmpeg was not found on PATH; install it with your package manager".into(),
            ));
        }
        if stack.runner.which("winget").is_none() {
            return Err(InstallError::Other(
                "ffmpeg was not found and winget is unavailable; install ffmpeg manually".into(),
            ));
        }
        // Accept agreements and stay in user scope to keep this unattended.
        let _ = stack
            .runner
            .run(
                "winget",
                &[
                    "install",
                    "--id=Gyan.FFmpeg",
                    "-e",
                    "--accept-package-agreements",
                    "--accept-source-agreements",
                    "--scope",
                    "user",
                    "--silent",
                ],
            )
            .await?;
        if stack.runner.which("ffmpeg").is_some() {
            return Ok(());
        }
        // Common landing spot for the winget package; new shells will see
        // it once the directory is on PATH.
        let candidate = PathBuf::from("C:/ffmpeg/bin/ffmpeg.exe");
        if candidate.exists() {
            let current = std::env::var("PATH").unwrap_or_default();
            let extended = format!("{current};C:/ffmpeg/bin");
            stack
                .runner
                .run_checked("setx", &["PATH", extended.as_str()])
                .await?;
            return Ok(());
        }
        Err(InstallError::Other(
            "ffmpeg is still not on PATH after the winget install".into(),
        ))
    }
}

/// Backend-specific start script contents.
pub fn start_script_body(settings: &Settings, profile: &BackendProfile) -> String {
    let runtime_bin = settings.runtime_bin().display().to_string();
    let models = settings.models_dir().display().to_string();
    if cfg!(windows) {
        let mut body = format!(
            "@echo off\nset \"OLLAMA_MODELS={models}\"\nstart \"\" \"{runtime_bin}\" serve\n"
        );
        match profile {
            BackendProfile::Container { container_name, .. } => {
                body.push_str(&format!("docker start {container_name}\n"));
            }
            BackendProfile::CompatLayer { distro } => {
                body.push_str(&format!(
                    "wsl -d {distro} sh -lc \"{}\"\n",
                    compat_serve_command(settings).replace('"', "\\\"")
                ));
            }
            BackendProfile::IsolatedRuntime { .. } => {
                body.push_str(&format!(
                    "\"{}\" serve --host 127.0.0.1 --port {}\n",
                    settings.venv_webui_bin().display(),
                    settings.webui_port
                ));
            }
            BackendProfile::NativeHost => {
                body.push_str(&format!(
                    "open-webui serve --host 127.0.0.1 --port {}\n",
                    settings.webui_port
                ));
            }
        }
        body
    } else {
        let mut body = format!(
            "#!/bin/sh\nOLLAMA_MODELS=\"{models}\" nohup \"{runtime_bin}\" serve >/dev/null 2>&1 &\n"
        );
        match profile {
            BackendProfile::Container { container_name, .. } => {
                body.push_str(&format!("docker start {container_name}\n"));
            }
            BackendProfile::CompatLayer { distro } => {
                body.push_str(&format!(
                    "wsl -d {distro} sh -lc \"{}\"\n",
                    compat_serve_command(settings).replace('"', "\\\"")
                ));
            }
            BackendProfile::IsolatedRuntime { .. } => {
                body.push_str(&format!(
                    "OLLAMA_BASE_URL=\"{}\" nohup \"{}\" serve --host 127.0.0.1 --port {} >/dev/null 2>&1 &\n",
                    settings.runtime_base_url(),
                    settings.venv_webui_bin().display(),
                    settings.webui_port
                ));
            }
            BackendProfile::NativeHost => {
                body.push_str(&format!(
                    "OLLAMA_BASE_URL=\"{}\" nohup open-webui serve --host 127.0.0.1 --port {} >/dev/null 2>&1 &\n",
                    settings.runtime_base_url(),
                    settings.webui_port
                ));
            }
        }
        body
    }
}

/// Backend-specific stop script contents, the reverse of the start script.
pub fn stop_script_body(settings: &Settings, profile: &BackendProfile) -> String {
    if cfg!(windows) {
        let mut body = String::from("@echo off\n");
        match profile {
            BackendProfile::Container { container_name, .. } => {
                body.push_str(&format!("docker stop {container_name} >nul 2>&1\n"));
            }
            BackendProfile::CompatLayer { distro } => {
                body.push_str(&format!("wsl -d {distro} sh -lc \"pkill -f open-webui\"\n"));
            }
            _ => {
                body.push_str("taskkill /IM open-webui.exe /F >nul 2>&1\n");
            }
        }
        body.push_str("taskkill /IM ollama.exe /F >nul 2>&1\n");
        body
    } else {
        let mut body = String::from("#!/bin/sh\n");
        match profile {
            BackendProfile::Container { container_name, .. } => {
                body.push_str(&format!("docker stop {container_name} >/dev/null 2>&1\n"));
            }
            BackendProfile::CompatLayer { distro } => {
                body.push_str(&format!("wsl -d {distro} sh -lc \"pkill -f open-webui\"\n"));
            }
            _ => {
                body.push_str("pkill -f open-webui >/dev/null 2>&1\n");
            }
        }
        body.push_str(&format!(
            "pkill -f \"{} serve\" >/dev/null 2>&1\ntrue\n",
            settings.runtime_bin().display()
        ));
        body
    }
}

/// Writes the start/stop launcher scripts into the base directory.
pub struct WriteLauncherScripts;

#[async_trait]
impl InstallStep for WriteLauncherScripts {
    fn id(&self) -> &'static str {
        "launcher-scripts"
    }

    fn label(&self) -> String {
        "Write start/stop launcher scripts".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let profile = stack.profile()?;
        let start = stack.settings.start_script_path();
        let stop = stack.settings.stop_script_path();
        let start_matches = std::fs::read_to_string(&start)
            .map(|existing| existing == start_script_body(&stack.settings, profile))
            .unwrap_or(false);
        let stop_matches = std::fs::read_to_string(&stop)
            .map(|existing| existing == stop_script_body(&stack.settings, profile))
            .unwrap_or(false);
        Ok(start_matches && stop_matches)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let profile = stack.profile()?;
        write_script(
            &stack.settings.start_script_path(),
            &start_script_body(&stack.settings, profile),
        )?;
        write_script(
            &stack.settings.stop_script_path(),
            &stop_script_body(&stack.settings, profile),
        )?;
        info!("launcher scripts written to {}", stack.settings.base_dir.display());
        Ok(())
    }
}

fn write_script(path: &std::path::Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Menu shortcuts: a browser link to the web UI plus start/stop/uninstall
/// wrappers (Start Menu on Windows, an application entry elsewhere).
pub struct CreateShortcuts {
    menu_dir: PathBuf,
}

impl CreateShortcuts {
    pub fn with_menu_dir(dir: PathBuf) -> Self {
        Self { menu_dir: dir }
    }

    fn desired_files(&self, settings: &Settings) -> Vec<(PathBuf, String)> {
        if cfg!(windows) {
            let uninstall_cmd = std::env::current_exe()
                .map(|exe| format!("@echo off\n\"{}\" --uninstall\n", exe.display()))
                .unwrap_or_else(|_| "@echo off\nmodelstack --uninstall\n".to_string());
            vec![
                (
                    self.menu_dir.join("Open WebUI.url"),
                    format!("[InternetShortcut]\nURL={}\n", settings.webui_url()),
                ),
                (
                    self.menu_dir.join(format!("Start {MENU_DIR_NAME}.cmd")),
                    format!("@echo off\n\"{}\"\n", settings.start_script_path().display()),
                ),
                (
                    self.menu_dir.join(format!("Stop {MENU_DIR_NAME}.cmd")),
                    format!("@echo off\n\"{}\"\n", settings.stop_script_path().display()),
                ),
                (
                    self.menu_dir.join(format!("Uninstall {MENU_DIR_NAME}.cmd")),
                    uninstall_cmd,
                ),
            ]
        } else {
            vec![(
                self.menu_dir.join("modelstack-webui.desktop"),
                format!(
                    "[Desktop Entry]\nType=Application\nName={MENU_DIR_NAME} Web UI\nExec=xdg-open {}\nTerminal=false\n",
                    settings.webui_url()
                ),
            )]
        }
    }
}

impl Default for CreateShortcuts {
    fn default() -> Self {
        Self {
            menu_dir: default_menu_dir(),
        }
    }
}

/// Platform location for the generated shortcuts.
pub fn default_menu_dir() -> PathBuf {
    if cfg!(windows) {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join("Microsoft")
            .join("Windows")
            .join("Start Menu")
            .join("Programs")
            .join(MENU_DIR_NAME)
    } else {
        dirs_next::data_dir().unwrap_or_default().join("applications")
    }
}

#[async_trait]
impl InstallStep for CreateShortcuts {
    fn id(&self) -> &'static str {
        "shortcuts"
    }

    fn label(&self) -> String {
        "Create menu shortcuts".to_string()
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        Ok(self
            .desired_files(&stack.settings)
            .iter()
            .all(|(path, _)| path.exists()))
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        std::fs::create_dir_all(&self.menu_dir)?;
        for (path, contents) in self.desired_files(&stack.settings) {
            std::fs::write(&path, contents)?;
            info!("created shortcut: {}", path.display());
        }
        Ok(())
    }
}

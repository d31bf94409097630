//! Web UI steps: provisioning, start, autostart
//!
//! The web UI is the backend-dependent half of the stack: it lives in a
//! container, inside a compat-layer distribution, in a dedicated virtual
//! environment, or directly on the host PATH.

use crate::autostart::AutostartEntry;
use crate::backend::BackendProfile;
use crate::error::{InstallError, Result};
use crate::plan::{InstallStep, Stack};
use crate::runner::{CommandOutput, ProcessRunner};
use crate::service::{LaunchSpec, ServiceDescriptor};
use crate::settings::Settings;
use crate::steps::WEBUI_AUTOSTART_NAME;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Virtual environment path used inside a compat-layer distribution.
const COMPAT_VENV: &str = "$HOME/.open-webui-venv";

/// Serve command executed inside the compat-layer distribution.
pub fn compat_serve_command(settings: &Settings) -> String {
    format!(
        "env OLLAMA_BASE_URL=\"http://localhost:{}\" {COMPAT_VENV}/bin/open-webui serve --host 0.0.0.0 --port {}",
        settings.runtime_port, settings.webui_port
    )
}

fn serve_args(settings: &Settings) -> Vec<String> {
    vec![
        "serve".to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        settings.webui_port.to_string(),
    ]
}

/// Descriptor for the web UI on the selected backend.
pub fn webui_descriptor(settings: &Settings, profile: &BackendProfile) -> ServiceDescriptor {
    let launch = match profile {
        BackendProfile::Container {
            container_name,
            image,
        } => LaunchSpec::Container {
            name: container_name.clone(),
            image: image.clone(),
            host_port: settings.webui_port,
            container_port: 8080,
            env: vec![(
                "OLLAMA_BASE_URL".to_string(),
                format!("http://host.docker.internal:{}", settings.runtime_port),
            )],
        },
        BackendProfile::CompatLayer { distro } => LaunchSpec::Detached {
            program: PathBuf::from("wsl"),
            args: vec![
                "-d".to_string(),
                distro.clone(),
                "sh".to_string(),
                "-lc".to_string(),
                compat_serve_command(settings),
            ],
            env: vec![],
            cwd: None,
        },
        BackendProfile::IsolatedRuntime { .. } => LaunchSpec::Detached {
            program: settings.venv_webui_bin(),
            args: serve_args(settings),
            env: vec![("OLLAMA_BASE_URL".to_string(), settings.runtime_base_url())],
            cwd: Some(settings.webui_dir()),
        },
        BackendProfile::NativeHost => LaunchSpec::Detached {
            program: PathBuf::from("open-webui"),
            args: serve_args(settings),
            env: vec![("OLLAMA_BASE_URL".to_string(), settings.runtime_base_url())],
            cwd: Some(settings.webui_dir()),
        },
    };
    ServiceDescriptor {
        name: "webui".to_string(),
        port: settings.webui_port,
        launch,
        process_hint: Some("open-webui".to_string()),
    }
}

/// Autostart entry re-launching the web UI at logon.
pub fn webui_autostart_entry(settings: &Settings, profile: &BackendProfile) -> AutostartEntry {
    let command = match profile {
        BackendProfile::Container { container_name, .. } => {
            format!("docker start {container_name}")
        }
        BackendProfile::CompatLayer { distro } => format!(
            "wsl -d {distro} sh -lc \"{}\"",
            compat_serve_command(settings).replace('"', "\\\"")
        ),
        BackendProfile::IsolatedRuntime { .. } => format!(
            "\"{}\" serve --host 127.0.0.1 --port {}",
            settings.venv_webui_bin().display(),
            settings.webui_port
        ),
        BackendProfile::NativeHost => format!(
            "open-webui serve --host 127.0.0.1 --port {}",
            settings.webui_port
        ),
    };
    AutostartEntry::new(WEBUI_AUTOSTART_NAME, command)
}

/// Run a shell command inside the compat-layer distribution.
pub(crate) async fn compat_sh(
    runner: &ProcessRunner,
    distro: &str,
    command: &str,
    as_root: bool,
) -> Result<CommandOutput> {
    let mut args: Vec<&str> = vec!["-d", distro];
    if as_root {
        args.extend(["-u", "root"]);
    }
    args.extend(["sh", "-lc", command]);
    runner.run("wsl", &args).await
}

fn succeeded(result: Result<CommandOutput>) -> bool {
    matches!(result, Ok(output) if output.success())
}

/// Installs the web UI where the backend needs it: a Python virtual
/// environment on the host, or one inside the compat-layer distribution.
/// Container and native backends have nothing to provision.
pub struct ProvisionWebUi;

#[async_trait]
impl InstallStep for ProvisionWebUi {
    fn id(&self) -> &'static str {
        "provision-webui"
    }

    fn label(&self) -> String {
        "Provision the web UI".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        match stack.profile()? {
            BackendProfile::IsolatedRuntime { .. } => Ok(stack.settings.venv_webui_bin().exists()),
            BackendProfile::CompatLayer { distro } => Ok(succeeded(
                compat_sh(
                    &stack.runner,
                    distro,
                    &format!("[ -x {COMPAT_VENV}/bin/open-webui ]"),
                    false,
                )
                .await,
            )),
            _ => Ok(true),
        }
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        match stack.profile()?.clone() {
            BackendProfile::IsolatedRuntime { venv_dir } => {
                self.provision_host_venv(stack, &venv_dir).await
            }
            BackendProfile::CompatLayer { distro } => {
                self.provision_compat_venv(stack, &distro).await
            }
            _ => Ok(()),
        }
    }
}

impl ProvisionWebUi {
    async fn provision_host_venv(&self, stack: &Stack, venv_dir: &std::path::Path) -> Result<()> {
        let Some(python) = stack.probes.python.clone() else {
            return Err(InstallError::Config(
                "no Python launcher found on PATH; install Python 3 to provision the web UI".into(),
            ));
        };
        info!("creating web UI virtual environment at {}", venv_dir.display());
        let mut args: Vec<String> = python[1..].to_vec();
        args.extend(["-m".to_string(), "venv".to_string(), venv_dir.display().to_string()]);
        stack.runner.run_checked(&python[0], &args).await?;

        let venv_python = stack.settings.venv_python().display().to_string();
        stack
            .runner
            .run_checked(
                &venv_python,
                &["-m", "pip", "install", "--upgrade", "pip", "wheel"],
            )
            .await?;
        stack
            .runner
            .run_checked(&venv_python, &["-m", "pip", "install", "open-webui"])
            .await?;
        Ok(())
    }

    async fn provision_compat_venv(&self, stack: &Stack, distro: &str) -> Result<()> {
        let runner = &stack.runner;
        info!("provisioning the web UI inside distribution '{distro}'");

        // pip on the distro's python3, bootstrapping through the package
        // manager as a last resort.
        if !succeeded(compat_sh(runner, distro, "python3 -m pip --version >/dev/null 2>&1", false).await)
            && !succeeded(
                compat_sh(runner, distro, "python3 -m ensurepip --upgrade >/dev/null 2>&1", false)
                    .await,
            )
        {
            self.compat_checked(
                runner,
                distro,
                "(command -v apt >/dev/null 2>&1 && apt update && apt install -y python3-pip) || \
                 (command -v apk >/dev/null 2>&1 && apk add --no-cache py3-pip) || \
                 (command -v dnf >/dev/null 2>&1 && dnf install -y python3-pip)",
                true,
            )
            .await?;
        }

        // Dedicated virtual environment for the web UI.
        if !succeeded(
            compat_sh(
                runner,
                distro,
                &format!("[ -d {COMPAT_VENV} ] || python3 -m venv {COMPAT_VENV}"),
                false,
            )
            .await,
        ) {
            self.compat_checked(
                runner,
                distro,
                "(command -v apt >/dev/null 2>&1 && apt update && apt install -y python3-venv) || \
                 (command -v apk >/dev/null 2>&1 && apk add --no-cache py3-virtualenv) || \
                 (command -v dnf >/dev/null 2>&1 && dnf install -y python3-venv)",
                true,
            )
            .await?;
            self.compat_checked(runner, distro, &format!("python3 -m venv {COMPAT_VENV}"), false)
                .await?;
        }

        // Some distributions build Python without ensurepip inside venvs.
        if !succeeded(compat_sh(runner, distro, &format!("[ -x {COMPAT_VENV}/bin/pip ]"), false).await)
            && !succeeded(
                compat_sh(
                    runner,
                    distro,
                    &format!("{COMPAT_VENV}/bin/python -m ensurepip --upgrade"),
                    false,
                )
                .await,
            )
        {
            self.compat_checked(
                runner,
                distro,
                &format!(
                    "(command -v curl >/dev/null 2>&1 && curl -sSf https://bootstrap.pypa.io/get-pip.py | {COMPAT_VENV}/bin/python) || \
                     (command -v wget >/dev/null 2>&1 && wget -qO- https://bootstrap.pypa.io/get-pip.py | {COMPAT_VENV}/bin/python)"
                ),
                false,
            )
            .await?;
        }

        let _ = compat_sh(
            runner,
            distro,
            &format!("{COMPAT_VENV}/bin/pip install --upgrade pip"),
            false,
        )
        .await;
        self.compat_checked(
            runner,
            distro,
            &format!(
                "{COMPAT_VENV}/bin/pip show open-webui >/dev/null 2>&1 || \
                 {COMPAT_VENV}/bin/pip install open-webui"
            ),
            false,
        )
        .await?;
        Ok(())
    }

    async fn compat_checked(
        &self,
        runner: &ProcessRunner,
        distro: &str,
        command: &str,
        as_root: bool,
    ) -> Result<()> {
        let output = compat_sh(runner, distro, command, as_root).await?;
        if output.success() {
            Ok(())
        } else {
            Err(InstallError::Other(format!(
                "command inside distribution '{distro}' failed: {}",
                output.tail(10)
            )))
        }
    }
}

/// Starts the web UI on its backend and waits for it to answer.
pub struct StartWebUi;

#[async_trait]
impl InstallStep for StartWebUi {
    fn id(&self) -> &'static str {
        "start-webui"
    }

    fn label(&self) -> String {
        "Start the web UI".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let descriptor = webui_descriptor(&stack.settings, stack.profile()?);
        Ok(stack.supervisor().is_running(&descriptor).await)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let descriptor = webui_descriptor(&stack.settings, stack.profile()?);
        let supervisor = stack.supervisor();
        supervisor.start(&descriptor).await?;
        supervisor.wait_until_running(&descriptor).await?;
        supervisor
            .wait_for_http(&descriptor, &stack.settings.webui_url())
            .await
    }
}

/// Registers the web UI for launch at logon.
pub struct WebUiAutostart;

#[async_trait]
impl InstallStep for WebUiAutostart {
    fn id(&self) -> &'static str {
        "webui-autostart"
    }

    fn label(&self) -> String {
        "Register web UI autostart".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let entry = webui_autostart_entry(&stack.settings, stack.profile()?);
        Ok(stack.registrar().active_mechanism(&entry).await.is_some())
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let entry = webui_autostart_entry(&stack.settings, stack.profile()?);
        stack.registrar().register(&entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::new(PathBuf::from("/tmp/stack"))
    }

    #[test]
    fn container_descriptor_maps_the_fixed_ports() {
        let profile = BackendProfile::Container {
            container_name: "open-webui".into(),
            image: "open-webui/open-webui:latest".into(),
        };
        let descriptor = webui_descriptor(&settings(), &profile);
        assert_eq!(descriptor.port, 3000);
        let LaunchSpec::Container {
            host_port,
            container_port,
            env,
            ..
        } = &descriptor.launch
        else {
            panic!("container profile must produce a container launch");
        };
        assert_eq!((*host_port, *container_port), (3000, 8080));
        assert!(
            env.iter()
                .any(|(k, v)| k == "OLLAMA_BASE_URL" && v.contains("host.docker.internal"))
        );
    }

    #[test]
    fn compat_descriptor_wraps_the_serve_command() {
        let profile = BackendProfile::CompatLayer {
            distro: "Ubuntu".into(),
        };
        let descriptor = webui_descriptor(&settings(), &profile);
        let LaunchSpec::Detached { program, args, .. } = &descriptor.launch else {
            panic!("compat profile must produce a detached launch");
        };
        assert_eq!(program, &PathBuf::from("wsl"));
        assert!(args.contains(&"Ubuntu".to_string()));
        assert!(args.iter().any(|a| a.contains("open-webui serve")));
    }

    #[test]
    fn isolated_descriptor_points_into_the_venv() {
        let profile = BackendProfile::IsolatedRuntime {
            venv_dir: settings().venv_dir(),
        };
        let descriptor = webui_descriptor(&settings(), &profile);
        let LaunchSpec::Detached { program, env, .. } = &descriptor.launch else {
            panic!("isolated profile must produce a detached launch");
        };
        assert!(program.starts_with(settings().venv_dir()));
        assert!(env.iter().any(|(k, _)| k == "OLLAMA_BASE_URL"));
    }

    #[test]
    fn autostart_command_matches_the_backend() {
        let container = BackendProfile::Container {
            container_name: "open-webui".into(),
            image: "img".into(),
        };
        assert_eq!(
            webui_autostart_entry(&settings(), &container).command,
            "docker start open-webui"
        );

        let compat = BackendProfile::CompatLayer {
            distro: "Ubuntu".into(),
        };
        let entry = webui_autostart_entry(&settings(), &compat);
        assert!(entry.command.starts_with("wsl -d Ubuntu"));
        assert!(entry.command.contains("\\\"http://localhost:11434\\\""));
    }
}

//! Concrete install and uninstall steps
//!
//! Steps are assembled into a fixed ordered plan; later steps assume the
//! postconditions of earlier ones (model registration needs the runtime
//! live, autostart needs a successful service start), enforced purely by
//! this ordering.

pub mod extras;
pub mod model;
pub mod runtime;
pub mod uninstall;
pub mod webui;

use crate::backend::{BackendKind, BackendProfile};
use crate::error::Result;
use crate::plan::{InstallStep, Stack};
use async_trait::async_trait;

/// Logical autostart entry name for the model runtime server.
pub const RUNTIME_AUTOSTART_NAME: &str = "Modelstack Runtime";

/// Logical autostart entry name for the web UI.
pub const WEBUI_AUTOSTART_NAME: &str = "Modelstack Web UI";

/// Menu folder holding the generated shortcuts.
pub const MENU_DIR_NAME: &str = "Modelstack";

/// The full installation plan for the selected backend.
pub fn install_plan(profile: &BackendProfile) -> Vec<Box<dyn InstallStep>> {
    let mut steps: Vec<Box<dyn InstallStep>> = vec![
        Box::new(EnsureDirectories),
        Box::new(runtime::InstallRuntime),
    ];
    if cfg!(windows) {
        steps.push(Box::new(extras::RegisterRuntimePath));
    }
    steps.push(Box::new(runtime::StartRuntime));
    steps.push(Box::new(runtime::RuntimeAutostart));
    steps.push(Box::new(model::FetchModelArtifact));
    steps.push(Box::new(model::WriteModelfile));
    steps.push(Box::new(model::RegisterModel));
    if matches!(
        profile.kind(),
        BackendKind::CompatLayer | BackendKind::IsolatedRuntime
    ) {
        steps.push(Box::new(webui::ProvisionWebUi));
    }
    steps.push(Box::new(webui::StartWebUi));
    steps.push(Box::new(webui::WebUiAutostart));
    steps.push(Box::new(extras::EnsureCodecTool));
    steps.push(Box::new(extras::WriteLauncherScripts));
    steps.push(Box::new(extras::CreateShortcuts::default()));
    steps
}

/// The teardown plan. Every step treats "already absent" as success and
/// none of them aborts the sequence, so partial prior installs still get
/// cleaned all the way.
pub fn uninstall_plan() -> Vec<Box<dyn InstallStep>> {
    vec![
        Box::new(uninstall::RemoveAutostartEntries),
        Box::new(uninstall::StopServices),
        Box::new(uninstall::RemoveContainer),
        Box::new(uninstall::RemoveShortcuts::default()),
        Box::new(uninstall::RemoveBaseDirectory),
    ]
}

/// Creates the managed directory tree under the base directory.
pub struct EnsureDirectories;

#[async_trait]
impl InstallStep for EnsureDirectories {
    fn id(&self) -> &'static str {
        "ensure-dirs"
    }

    fn label(&self) -> String {
        "Prepare installation directories".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        Ok(stack.settings.managed_dirs().iter().all(|dir| dir.is_dir()))
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        for dir in stack.settings.managed_dirs() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Probes;
    use crate::settings::Settings;

    fn stack_with_profile(profile: Option<BackendProfile>) -> (tempfile::TempDir, Stack) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("stack"));
        let stack = Stack::new(settings, Probes::default(), profile).unwrap();
        (dir, stack)
    }

    #[tokio::test]
    async fn directory_step_converges_and_reports_satisfied() {
        let (_dir, stack) = stack_with_profile(None);
        let step = EnsureDirectories;
        assert!(!step.is_satisfied(&stack).await.unwrap());
        step.apply(&stack).await.unwrap();
        assert!(step.is_satisfied(&stack).await.unwrap());
    }

    #[test]
    fn container_plan_skips_venv_provisioning() {
        let profile = BackendProfile::Container {
            container_name: "open-webui".into(),
            image: "open-webui/open-webui:latest".into(),
        };
        let ids: Vec<_> = install_plan(&profile).iter().map(|s| s.id()).collect();
        assert!(!ids.contains(&"provision-webui"));
        assert!(ids.contains(&"start-webui"));
    }

    #[test]
    fn isolated_plan_provisions_before_starting() {
        let profile = BackendProfile::IsolatedRuntime {
            venv_dir: std::path::PathBuf::from("/tmp/venv"),
        };
        let ids: Vec<_> = install_plan(&profile).iter().map(|s| s.id()).collect();
        let provision = ids.iter().position(|id| *id == "provision-webui").unwrap();
        let start = ids.iter().position(|id| *id == "start-webui").unwrap();
        assert!(provision < start);
    }

    #[test]
    fn uninstall_plan_ends_with_base_directory_removal() {
        let ids: Vec<_> = uninstall_plan().iter().map(|s| s.id()).collect();
        assert_eq!(ids.last(), Some(&"remove-base-dir"));
        assert_eq!(ids.first(), Some(&"remove-autostart"));
    }
}

//! Model artifact steps: download, Modelfile, catalog registration

use crate::download::DownloadTask;
use crate::error::Result;
use crate::plan::{InstallStep, Stack};
use crate::settings::Settings;
use crate::steps::runtime::runtime_binary;
use async_trait::async_trait;
use tracing::info;

/// Download task for the GGUF artifact.
pub fn model_download_task(settings: &Settings) -> DownloadTask {
    let model = &settings.model;
    let mut task = DownloadTask::new(
        model.download_url(),
        settings.model_artifact_path(),
        format!("{} (model artifact)", model.file),
    );
    if let Some(sum) = &model.sha256 {
        task = task.with_sha256(sum.clone());
    }
    task
}

/// Fetches the model artifact with resume support.
pub struct FetchModelArtifact;

#[async_trait]
impl InstallStep for FetchModelArtifact {
    fn id(&self) -> &'static str {
        "fetch-model"
    }

    fn label(&self) -> String {
        "Download the model artifact".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        stack
            .downloader
            .is_cached(&model_download_task(&stack.settings))
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        stack
            .downloader
            .fetch(&model_download_task(&stack.settings))
            .await?;
        Ok(())
    }
}

/// Writes the Modelfile describing how the runtime imports the artifact.
/// Rewritten only when the desired content differs.
pub struct WriteModelfile;

#[async_trait]
impl InstallStep for WriteModelfile {
    fn id(&self) -> &'static str {
        "write-modelfile"
    }

    fn label(&self) -> String {
        "Write the Modelfile".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        let path = stack.settings.modelfile_path();
        match std::fs::read_to_string(&path) {
            Ok(existing) => Ok(existing == stack.settings.model.modelfile_contents()),
            Err(_) => Ok(false),
        }
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let path = stack.settings.modelfile_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, stack.settings.model.modelfile_contents())?;
        info!("wrote Modelfile to {}", path.display());
        Ok(())
    }
}

/// Imports the model into the runtime catalog under its registered name.
/// Creation is skipped when the catalog already lists the name.
pub struct RegisterModel;

#[async_trait]
impl InstallStep for RegisterModel {
    fn id(&self) -> &'static str {
        "register-model"
    }

    fn label(&self) -> String {
        "Register the model in the runtime catalog".to_string()
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool> {
        Ok(stack
            .supervisor()
            .model_registered(&stack.settings.tags_url(), &stack.settings.model.name)
            .await)
    }

    async fn apply(&self, stack: &Stack) -> Result<()> {
        let binary = runtime_binary(&stack.settings, &stack.runner).display().to_string();
        let modelfile = stack.settings.modelfile_path().display().to_string();
        info!("importing model as '{}'", stack.settings.model.name);
        stack
            .runner
            .run_checked_with(
                &binary,
                &[
                    "create",
                    stack.settings.model.name.as_str(),
                    "-f",
                    modelfile.as_str(),
                ],
                &[(
                    "OLLAMA_MODELS",
                    stack.settings.models_dir().display().to_string(),
                )],
                None,
            )
            .await?;
        Ok(())
    }
}

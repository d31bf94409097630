//! Step planning and execution
//!
//! A run is a fixed ordered list of steps. Each step knows how to tell
//! whether it is already satisfied, so a re-run after any crash resumes
//! from the first unsatisfied step with nothing persisted between runs.

use crate::autostart::AutostartRegistrar;
use crate::backend::{BackendProfile, Probes};
use crate::download::Downloader;
use crate::error::{InstallError, Result};
use crate::runner::ProcessRunner;
use crate::service::ServiceSupervisor;
use crate::settings::Settings;
use async_trait::async_trait;
use colored::Colorize;
use tracing::{error, info, warn};

/// Shared context handed to every step.
///
/// Capability probes and the backend profile are resolved once, before
/// the plan runs, and are immutable for the rest of the run.
pub struct Stack {
    pub settings: Settings,
    pub runner: ProcessRunner,
    pub downloader: Downloader,
    pub client: reqwest::Client,
    pub probes: Probes,
    profile: Option<BackendProfile>,
}

impl Stack {
    pub fn new(settings: Settings, probes: Probes, profile: Option<BackendProfile>) -> Result<Self> {
        let downloader = Downloader::new(settings.retry)?.with_progress(true);
        let client = reqwest::Client::builder()
            .user_agent("modelstack/0.1")
            .build()?;
        Ok(Self {
            settings,
            runner: ProcessRunner::new(),
            downloader,
            client,
            probes,
            profile,
        })
    }

    /// The backend selected for this run. Install plans always have one;
    /// uninstall runs operate without it.
    pub fn profile(&self) -> Result<&BackendProfile> {
        self.profile
            .as_ref()
            .ok_or_else(|| InstallError::Config("no backend profile selected for this run".into()))
    }

    pub fn has_profile(&self) -> bool {
        self.profile.is_some()
    }

    pub fn supervisor(&self) -> ServiceSupervisor<'_> {
        ServiceSupervisor::new(&self.runner, &self.settings, &self.client)
    }

    pub fn registrar(&self) -> AutostartRegistrar<'_> {
        AutostartRegistrar::new(&self.runner, &self.settings)
    }
}

/// One unit of installation work.
///
/// `is_satisfied` must be cheap and free of side effects; it is the only
/// thing that carries state between runs.
#[async_trait]
pub trait InstallStep: Send + Sync {
    fn id(&self) -> &'static str;
    fn label(&self) -> String;

    /// Whether a failure aborts the remaining sequence.
    fn fatal(&self) -> bool {
        true
    }

    async fn is_satisfied(&self, stack: &Stack) -> Result<bool>;
    async fn apply(&self, stack: &Stack) -> Result<()>;
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Skipped,
    Succeeded,
    /// Non-fatal failure; the run continued.
    Warned(String),
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: &'static str,
    pub label: String,
    pub status: StepStatus,
}

/// Aggregated result of a full run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
}

impl RunReport {
    pub fn warnings(&self) -> impl Iterator<Item = &StepRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Warned(_)))
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    /// True when every step was already satisfied (a fully converged run).
    pub fn all_skipped(&self) -> bool {
        !self.records.is_empty()
            && self
                .records
                .iter()
                .all(|r| r.status == StepStatus::Skipped)
    }
}

/// Walks an ordered step sequence with skip-if-satisfied semantics.
pub struct StepPlanner;

impl StepPlanner {
    pub async fn run(stack: &Stack, steps: &[Box<dyn InstallStep>]) -> Result<RunReport> {
        let mut report = RunReport::default();
        for step in steps {
            let label = step.label();

            let satisfied = match step.is_satisfied(stack).await {
                Ok(satisfied) => satisfied,
                Err(err) => {
                    // An inconclusive probe is not a reason to abort;
                    // applying the step will surface any real problem.
                    warn!("satisfaction check for '{label}' failed: {err}");
                    false
                }
            };
            if satisfied {
                info!("step '{label}' skipped (already satisfied)");
                println!("{} {} {}", "-".bright_black(), label, "(already satisfied)".bright_black());
                report.records.push(StepRecord {
                    id: step.id(),
                    label,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            info!("step '{label}' started");
            println!("{} {}", "→".green(), label);
            match step.apply(stack).await {
                Ok(()) => {
                    info!("step '{label}' succeeded");
                    println!("{} {}", "✓".green(), label);
                    report.records.push(StepRecord {
                        id: step.id(),
                        label,
                        status: StepStatus::Succeeded,
                    });
                }
                Err(err) if step.fatal() => {
                    error!("step '{label}' failed: {err}");
                    eprintln!("{} {}: {err}", "✗".red(), label);
                    return Err(err);
                }
                Err(err) => {
                    warn!("step '{label}' failed (continuing): {err}");
                    println!("{} {}: {err}", "!".yellow(), label);
                    report.records.push(StepRecord {
                        id: step.id(),
                        label,
                        status: StepStatus::Warned(err.to_string()),
                    });
                }
            }
        }
        Ok(report)
    }
}

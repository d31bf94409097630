//! modelstack-core - installer engine for a local inference stack
//!
//! Provisions a model runtime server, a downloaded model artifact, a web
//! front end and an auxiliary media codec tool on a single machine,
//! across four mutually exclusive execution backends. Every unit of work
//! is an idempotent step: the engine decides from runtime inspection
//! alone (file existence and size, process and port liveness, catalog
//! membership) whether the step is already satisfied, so a run can crash
//! anywhere and the next run converges without a transaction log.

pub mod autostart;
pub mod backend;
pub mod download;
pub mod error;
pub mod logging;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod service;
pub mod settings;
pub mod steps;

pub use autostart::{AutostartEntry, AutostartMechanism, AutostartRegistrar};
pub use backend::{BackendKind, BackendProfile, BackendSelector, Probes};
pub use download::{DownloadOutcome, DownloadTask, Downloader, file_sha256};
pub use error::{InstallError, Result};
pub use plan::{InstallStep, RunReport, Stack, StepPlanner, StepRecord, StepStatus};
pub use retry::RetryPolicy;
pub use runner::{CommandOutput, ProcessRunner};
pub use service::{LaunchSpec, ServiceDescriptor, ServiceSupervisor, port_open};
pub use settings::{ModelSpec, Settings};
pub use steps::{install_plan, uninstall_plan};

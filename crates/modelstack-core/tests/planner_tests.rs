//! Step planner semantics: skip-if-satisfied, failure policy, resume

use async_trait::async_trait;
use modelstack_core::{
    InstallError, InstallStep, Probes, Result, Settings, Stack, StepPlanner, StepStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Test step whose satisfaction is a marker file and whose failures are
/// switchable at runtime.
struct MarkerStep {
    id: &'static str,
    marker: PathBuf,
    fatal: bool,
    fail: Arc<AtomicBool>,
    applies: Arc<AtomicUsize>,
}

impl MarkerStep {
    fn new(id: &'static str, dir: &std::path::Path) -> Self {
        Self {
            id,
            marker: dir.join(format!("{id}.done")),
            fatal: true,
            fail: Arc::new(AtomicBool::new(false)),
            applies: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }

    fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl InstallStep for MarkerStep {
    fn id(&self) -> &'static str {
        self.id
    }

    fn label(&self) -> String {
        format!("test step {}", self.id)
    }

    fn fatal(&self) -> bool {
        self.fatal
    }

    async fn is_satisfied(&self, _stack: &Stack) -> Result<bool> {
        Ok(self.marker.exists())
    }

    async fn apply(&self, _stack: &Stack) -> Result<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::Other(format!("{} was told to fail", self.id)));
        }
        std::fs::write(&self.marker, b"done")?;
        Ok(())
    }
}

fn stack(dir: &std::path::Path) -> Stack {
    Stack::new(Settings::new(dir.join("stack")), Probes::default(), None).unwrap()
}

#[tokio::test]
async fn a_completed_run_reports_every_step_skipped_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let stack = stack(dir.path());
    let first = MarkerStep::new("first", dir.path());
    let second = MarkerStep::new("second", dir.path());
    let first_applies = first.applies.clone();
    let second_applies = second.applies.clone();
    let steps: Vec<Box<dyn InstallStep>> = vec![Box::new(first), Box::new(second)];

    let report = StepPlanner::run(&stack, &steps).await.unwrap();
    assert!(
        report
            .records
            .iter()
            .all(|r| r.status == StepStatus::Succeeded)
    );

    let rerun = StepPlanner::run(&stack, &steps).await.unwrap();
    assert!(rerun.all_skipped());
    assert_eq!(first_applies.load(Ordering::SeqCst), 1);
    assert_eq!(second_applies.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_fatal_failure_aborts_the_remaining_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let stack = stack(dir.path());
    let before = MarkerStep::new("before", dir.path());
    let failing = MarkerStep::new("failing", dir.path()).failing();
    let after = MarkerStep::new("after", dir.path());
    let after_applies = after.applies.clone();
    let steps: Vec<Box<dyn InstallStep>> = vec![Box::new(before), Box::new(failing), Box::new(after)];

    let err = StepPlanner::run(&stack, &steps).await.unwrap_err();
    assert!(err.to_string().contains("told to fail"));
    // Nothing after the fatal step may run.
    assert_eq!(after_applies.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_non_fatal_failure_is_recorded_and_the_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let stack = stack(dir.path());
    let warns = MarkerStep::new("warns", dir.path()).non_fatal().failing();
    let after = MarkerStep::new("after", dir.path());
    let after_applies = after.applies.clone();
    let steps: Vec<Box<dyn InstallStep>> = vec![Box::new(warns), Box::new(after)];

    let report = StepPlanner::run(&stack, &steps).await.unwrap();
    assert_eq!(report.warning_count(), 1);
    assert_eq!(after_applies.load(Ordering::SeqCst), 1);
    assert!(matches!(report.records[0].status, StepStatus::Warned(_)));
}

#[tokio::test]
async fn a_rerun_after_an_abort_resumes_from_the_first_unsatisfied_step() {
    let dir = tempfile::tempdir().unwrap();
    let stack = stack(dir.path());
    let first = MarkerStep::new("first", dir.path());
    let flaky = MarkerStep::new("flaky", dir.path()).failing();
    let last = MarkerStep::new("last", dir.path());
    let first_applies = first.applies.clone();
    let flaky_switch = flaky.fail.clone();
    let last_applies = last.applies.clone();
    let steps: Vec<Box<dyn InstallStep>> = vec![Box::new(first), Box::new(flaky), Box::new(last)];

    StepPlanner::run(&stack, &steps).await.unwrap_err();
    assert_eq!(first_applies.load(Ordering::SeqCst), 1);
    assert_eq!(last_applies.load(Ordering::SeqCst), 0);

    // The failure condition clears; the rerun resumes purely through the
    // satisfaction checks, with no run-state carried over.
    flaky_switch.store(false, Ordering::SeqCst);
    let report = StepPlanner::run(&stack, &steps).await.unwrap();
    assert_eq!(report.records[0].status, StepStatus::Skipped);
    assert_eq!(report.records[1].status, StepStatus::Succeeded);
    assert_eq!(report.records[2].status, StepStatus::Succeeded);
    assert_eq!(first_applies.load(Ordering::SeqCst), 1);
    assert_eq!(last_applies.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn teardown_style_failures_aggregate_instead_of_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let stack = stack(dir.path());
    let steps: Vec<Box<dyn InstallStep>> = vec![
        Box::new(MarkerStep::new("gone-a", dir.path()).non_fatal().failing()),
        Box::new(MarkerStep::new("ok", dir.path()).non_fatal()),
        Box::new(MarkerStep::new("gone-b", dir.path()).non_fatal().failing()),
    ];

    let report = StepPlanner::run(&stack, &steps).await.unwrap();
    assert_eq!(report.warning_count(), 2);
    assert_eq!(report.records.len(), 3);
    assert_eq!(report.records[1].status, StepStatus::Succeeded);
}

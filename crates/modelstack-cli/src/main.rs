//! modelstack - unattended installer for a local inference stack

mod cli;

use clap::Parser;
use cli::Cli;
use colored::Colorize;
use modelstack_core::{
    BackendSelector, InstallError, Probes, ProcessRunner, RunReport, Settings, Stack, StepPlanner,
    install_plan, uninstall_plan,
};

fn main() {
    let cli = Cli::parse();

    let settings = match build_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{} {err}", "✗".red());
            std::process::exit(err.exit_code());
        }
    };
    if let Err(err) = modelstack_core::logging::init(&settings, cli.verbose) {
        eprintln!("{} {err}", "✗".red());
        std::process::exit(err.exit_code());
    }

    // The orchestrator is strictly sequential; a single-threaded runtime
    // makes that explicit while still giving cancellable awaits.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{} failed to start the async runtime: {err}", "✗".red());
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        tokio::select! {
            result = run(&cli, &settings) => result,
            _ = tokio::signal::ctrl_c() => {
                // Detached services deliberately survive the installer;
                // only our own blocking work is cancelled here.
                Err(InstallError::Interrupted)
            }
        }
    });

    match result {
        Ok(report) => {
            print_summary(&cli, &settings, &report);
        }
        Err(err) => {
            eprintln!();
            eprintln!("{} {err}", "✗".red());
            eprintln!("  Log saved to: {}", settings.run_log_path().display());
            std::process::exit(err.exit_code());
        }
    }
}

fn build_settings(cli: &Cli) -> Result<Settings, InstallError> {
    match &cli.base_dir {
        Some(dir) => Ok(Settings::new(dir.clone())),
        None => Settings::with_default_base(),
    }
}

async fn run(cli: &Cli, settings: &Settings) -> Result<RunReport, InstallError> {
    let runner = ProcessRunner::new();
    // Probed once; everything downstream reads this cached snapshot.
    let probes = Probes::detect(&runner).await;

    if cli.uninstall {
        println!("{} Uninstalling the local inference stack", "→".green());
        let stack = Stack::new(settings.clone(), probes, None)?;
        return StepPlanner::run(&stack, &uninstall_plan()).await;
    }

    let profile = BackendSelector::select(
        cli.backend.map(Into::into),
        cli.distro.as_deref(),
        &probes,
        settings,
    )?;
    println!(
        "{} Installing the local inference stack ({} backend)",
        "→".green(),
        profile.to_string().cyan()
    );
    println!("  Install root: {}", settings.base_dir.display().to_string().cyan());

    let stack = Stack::new(settings.clone(), probes, Some(profile))?;
    let plan = install_plan(stack.profile()?);
    StepPlanner::run(&stack, &plan).await
}

fn print_summary(cli: &Cli, settings: &Settings, report: &RunReport) {
    println!();
    if cli.uninstall {
        println!("{} Uninstall complete", "✓".green());
    } else {
        println!("{} All set!", "✓".green());
        println!("  Web UI:      {}", settings.webui_url().cyan());
        println!("  Runtime API: {}", settings.runtime_base_url().cyan());
        println!("  Model name:  {}", settings.model.name.cyan());
    }
    for record in report.warnings() {
        if let modelstack_core::StepStatus::Warned(reason) = &record.status {
            println!("  {} {}: {reason}", "!".yellow(), record.label);
        }
    }
    println!("  Log saved to: {}", settings.run_log_path().display());
}

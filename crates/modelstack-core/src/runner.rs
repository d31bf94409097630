//! Process runner - the single funnel for every external command
//!
//! All package managers, container CLIs, compat-layer launchers and
//! scheduler CLIs are invoked through this module, so each caller has one
//! narrow surface and every invocation lands in the log with its command
//! text, exit status and duration.

use crate::error::{InstallError, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Last lines of the combined output, for error context.
    pub fn tail(&self, lines: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Executes external commands with captured output and a hard timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command_timeout: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run a command to completion, capturing stdout/stderr.
    ///
    /// A non-zero exit is not an error here; callers that need one use
    /// [`run_checked`](Self::run_checked).
    pub async fn run<S: AsRef<OsStr>>(&self, program: &str, args: &[S]) -> Result<CommandOutput> {
        self.run_with(program, args, &[], None).await
    }

    /// Run a command with extra environment variables and an optional
    /// working directory.
    pub async fn run_with<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        env: &[(&str, String)],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        let cmd_line = render_command(program, args);
        info!("$ {}", cmd_line);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        // A timed-out or cancelled command must not linger.
        cmd.kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                InstallError::Other(format!(
                    "command timed out after {}s: {cmd_line}",
                    self.command_timeout.as_secs()
                ))
            })??;
        let duration = started.elapsed();

        let result = CommandOutput {
            status: output.status.code(),
            stdout: decode_console_output(&output.stdout),
            stderr: decode_console_output(&output.stderr),
            duration,
        };
        info!(
            "  exit {:?} in {:.1}s",
            result.status,
            duration.as_secs_f64()
        );
        debug!("  stdout: {}", result.stdout.trim_end());
        if !result.stderr.trim().is_empty() {
            debug!("  stderr: {}", result.stderr.trim_end());
        }
        Ok(result)
    }

    /// Run a command and fail on a non-zero exit, carrying the output tail.
    pub async fn run_checked<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput> {
        self.run_checked_with(program, args, &[], None).await
    }

    pub async fn run_checked_with<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        env: &[(&str, String)],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        let output = self.run_with(program, args, env, cwd).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(InstallError::Other(format!(
                "{} exited with {:?}: {}",
                render_command(program, args),
                output.status,
                output.tail(10)
            )))
        }
    }

    /// Launch a long-lived background process that outlives this one.
    ///
    /// stdout and stderr are redirected (appended) to `log_file`; stdin is
    /// closed. Returns the child pid. The child is placed in its own
    /// process group so a Ctrl-C against the installer does not reach it.
    pub fn spawn_detached<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
        env: &[(&str, String)],
        cwd: Option<&Path>,
        log_file: &Path,
    ) -> Result<u32> {
        let cmd_line = render_command(&program.display().to_string(), args);
        info!("$ {} (detached)", cmd_line);

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(log)
            .stderr(log_err);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        info!("  started pid {pid}");
        // The child is intentionally not waited on; it must survive us.
        drop(child);
        Ok(pid)
    }

    /// Whether a process with this pid is currently alive.
    ///
    /// A terminated-but-unreaped child still answers signal 0, so on Linux
    /// zombies are explicitly reported as dead.
    pub fn is_process_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            if kill(Pid::from_raw(pid as i32), None).is_err() {
                return false;
            }
            #[cfg(target_os = "linux")]
            {
                if is_linux_zombie(pid) {
                    return false;
                }
            }
            true
        }
        #[cfg(windows)]
        {
            std::process::Command::new("tasklist")
                .arg("/FI")
                .arg(format!("PID eq {pid}"))
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = pid;
            false
        }
    }

    /// Terminate a process, gracefully first unless `force` is set.
    pub fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            match kill(Pid::from_raw(pid as i32), Some(signal)) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => {
                    warn!("failed to send {signal:?} to pid {pid}: {e}");
                    Err(InstallError::Other(format!(
                        "failed to terminate process {pid}: {e}"
                    )))
                }
            }
        }
        #[cfg(windows)]
        {
            let mut cmd = std::process::Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            let status = cmd.arg("/PID").arg(pid.to_string()).status()?;
            // taskkill fails when the pid is already gone, which is fine.
            if !status.success() {
                debug!("taskkill for pid {pid} exited with {status:?}");
            }
            Ok(())
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (pid, force);
            Err(InstallError::Other(
                "process termination is not supported on this platform".into(),
            ))
        }
    }

    /// Locate an executable on PATH, honoring Windows extensions.
    pub fn which(&self, binary: &str) -> Option<PathBuf> {
        which_in_path(binary, std::env::var_os("PATH").as_deref())
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn render_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}

fn which_in_path(binary: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var).find_map(|dir| {
        let direct = dir.join(binary);
        if direct.is_file() {
            return Some(direct);
        }
        #[cfg(windows)]
        {
            for ext in [".exe", ".cmd", ".bat"] {
                let with_ext = dir.join(format!("{binary}{ext}"));
                if with_ext.is_file() {
                    return Some(with_ext);
                }
            }
        }
        None
    })
}

#[cfg(target_os = "linux")]
fn is_linux_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The process state is the first field after the parenthesized comm.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        == Some("Z")
}

/// Decode captured console bytes.
///
/// Some Windows tools (notably `wsl.exe`) emit UTF-16LE; without decoding,
/// their output contains interleaved nulls and distro names never match.
fn decode_console_output(bytes: &[u8]) -> String {
    let looks_utf16 = (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE)
        || (bytes.len() >= 4 && bytes[1] == 0 && bytes[3] == 0 && bytes[0] != 0);
    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .filter(|unit| *unit != 0xFEFF)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

//! Service supervision across execution backends
//!
//! The same operations work for every backend profile; the difference is
//! encoded in each descriptor's launch spec when the plan is built. The
//! health check here is the only authority for "service already running":
//! nothing infers liveness from having issued a start command.

use crate::error::{InstallError, Result};
use crate::runner::ProcessRunner;
use crate::settings::Settings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How a service is brought up (and torn down) on its backend.
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    /// Create-or-start a named container with a fixed port mapping.
    Container {
        name: String,
        image: String,
        host_port: u16,
        container_port: u16,
        env: Vec<(String, String)>,
    },
    /// Detached background process that outlives the installer.
    Detached {
        program: PathBuf,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<PathBuf>,
    },
}

/// A supervised service: identity, expected port, launch recipe and the
/// fallback name used when a port probe is inconclusive.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    pub launch: LaunchSpec,
    /// Process name used by the secondary liveness lookup and the
    /// stop-by-name fallback.
    pub process_hint: Option<String>,
}

/// Short-timeout TCP connect against the loopback interface.
pub async fn port_open(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Per-backend start/stop/liveness operations for named services.
pub struct ServiceSupervisor<'a> {
    runner: &'a ProcessRunner,
    settings: &'a Settings,
    client: &'a reqwest::Client,
}

impl<'a> ServiceSupervisor<'a> {
    pub fn new(runner: &'a ProcessRunner, settings: &'a Settings, client: &'a reqwest::Client) -> Self {
        Self {
            runner,
            settings,
            client,
        }
    }

    /// Liveness probe: the expected port first, then a name lookup for the
    /// window where a freshly started service has not bound yet.
    pub async fn is_running(&self, descriptor: &ServiceDescriptor) -> bool {
        if port_open(descriptor.port, self.settings.probe_timeout).await {
            return true;
        }
        match &descriptor.launch {
            LaunchSpec::Container { name, .. } => {
                self.container_running(name).await.unwrap_or(false)
            }
            LaunchSpec::Detached { .. } => self
                .recorded_pid(descriptor)
                .map(|pid| self.runner.is_process_alive(pid))
                .unwrap_or(false),
        }
    }

    /// Bring the service up. Containers are created on first start and
    /// restarted afterwards; everything else becomes a detached process
    /// whose output lands in the run log and whose pid is recorded.
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        match &descriptor.launch {
            LaunchSpec::Container {
                name,
                image,
                host_port,
                container_port,
                env,
            } => {
                if self.container_exists(name).await? {
                    if !self.container_running(name).await? {
                        let output = self.runner.run("docker", &["start", name.as_str()]).await?;
                        if !output.success() {
                            warn!("docker start {name} failed: {}", output.tail(5));
                        }
                    }
                    info!("container '{name}' ensured on port {host_port}");
                } else {
                    let mut args: Vec<String> = vec![
                        "run".into(),
                        "-d".into(),
                        "--name".into(),
                        name.clone(),
                        "-p".into(),
                        format!("{host_port}:{container_port}"),
                    ];
                    for (key, value) in env {
                        args.push("-e".into());
                        args.push(format!("{key}={value}"));
                    }
                    args.push("--restart".into());
                    args.push("unless-stopped".into());
                    args.push(image.clone());
                    self.runner.run_checked("docker", &args).await?;
                    info!("container '{name}' created on port {host_port}");
                }
            }
            LaunchSpec::Detached {
                program,
                args,
                env,
                cwd,
            } => {
                let env: Vec<(&str, String)> =
                    env.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
                let pid = self.runner.spawn_detached(
                    program,
                    args,
                    &env,
                    cwd.as_deref(),
                    self.settings.run_log_path(),
                )?;
                std::fs::write(self.settings.pid_file(&descriptor.name), pid.to_string())?;
            }
        }
        Ok(())
    }

    /// Tear the service down: stop the container, or terminate the
    /// recorded pid (gracefully, then forcibly), falling back to a
    /// name-based kill when no pid was recorded.
    pub async fn stop(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        match &descriptor.launch {
            LaunchSpec::Container { name, .. } => {
                let output = self.runner.run("docker", &["stop", name.as_str()]).await?;
                if !output.success() {
                    debug!("docker stop {name}: {}", output.tail(3));
                }
            }
            LaunchSpec::Detached { .. } => {
                if let Some(pid) = self.recorded_pid(descriptor) {
                    if self.runner.is_process_alive(pid) {
                        self.runner.terminate(pid, false)?;
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        if self.runner.is_process_alive(pid) {
                            warn!("pid {pid} still running; forcing termination");
                            self.runner.terminate(pid, true)?;
                        }
                    }
                    let _ = std::fs::remove_file(self.settings.pid_file(&descriptor.name));
                } else if let Some(hint) = &descriptor.process_hint {
                    self.kill_by_name(hint).await?;
                }
            }
        }
        info!("service '{}' stopped", descriptor.name);
        Ok(())
    }

    /// Poll liveness under the shared backoff schedule until the start
    /// timeout elapses.
    pub async fn wait_until_running(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let deadline = Instant::now() + self.settings.start_timeout;
        let mut attempt = 1u32;
        loop {
            if self.is_running(descriptor).await {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(descriptor));
            }
            tokio::time::sleep(self.settings.retry.delay_before(attempt).min(remaining)).await;
            attempt += 1;
        }
    }

    /// Wait for an HTTP endpoint to answer (any status below 500 counts,
    /// since an auth challenge still proves the service is up).
    pub async fn wait_for_http(&self, descriptor: &ServiceDescriptor, url: &str) -> Result<()> {
        info!("waiting for HTTP readiness: {url}");
        let deadline = Instant::now() + self.settings.start_timeout;
        let mut attempt = 1u32;
        loop {
            let ready = match self
                .client
                .get(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) => resp.status().as_u16() < 500,
                Err(_) => false,
            };
            if ready {
                info!("HTTP ready: {url}");
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(descriptor));
            }
            tokio::time::sleep(self.settings.retry.delay_before(attempt).min(remaining)).await;
            attempt += 1;
        }
    }

    /// Names currently present in the runtime's model catalog.
    pub async fn registered_models(&self, tags_url: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(tags_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Catalog membership check used to keep model registration idempotent.
    pub async fn model_registered(&self, tags_url: &str, name: &str) -> bool {
        match self.registered_models(tags_url).await {
            Ok(models) => models
                .iter()
                .any(|m| m == name || m.split(':').next() == Some(name)),
            Err(err) => {
                debug!("model catalog query failed: {err}");
                false
            }
        }
    }

    /// Whether a container with this name exists, running or stopped.
    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        self.container_query(name, true).await
    }

    /// Whether a container with this name is currently running.
    pub async fn container_running(&self, name: &str) -> Result<bool> {
        self.container_query(name, false).await
    }

    async fn container_query(&self, name: &str, include_stopped: bool) -> Result<bool> {
        let filter = format!("name={name}");
        let mut args: Vec<&str> = vec!["ps"];
        if include_stopped {
            args.push("-a");
        }
        args.extend(["--filter", filter.as_str(), "--format", "{{.Names}}"]);
        let output = self.runner.run("docker", &args).await?;
        Ok(output.success() && output.stdout.lines().any(|line| line.trim() == name))
    }

    async fn kill_by_name(&self, hint: &str) -> Result<()> {
        #[cfg(windows)]
        let output = {
            let image = format!("{hint}.exe");
            self.runner
                .run("taskkill", &["/IM", image.as_str(), "/F"])
                .await?
        };
        #[cfg(not(windows))]
        let output = self.runner.run("pkill", &["-f", hint]).await?;
        if !output.success() {
            debug!("no '{hint}' process matched");
        }
        Ok(())
    }

    fn recorded_pid(&self, descriptor: &ServiceDescriptor) -> Option<u32> {
        std::fs::read_to_string(self.settings.pid_file(&descriptor.name))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn timeout_error(&self, descriptor: &ServiceDescriptor) -> InstallError {
        InstallError::ServiceTimeout {
            service: descriptor.name.clone(),
            port: descriptor.port,
            timeout_secs: self.settings.start_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_settings(dir: &Path) -> Settings {
        let mut settings = Settings::new(dir.to_path_buf());
        settings.start_timeout = Duration::from_millis(200);
        settings.probe_timeout = Duration::from_millis(200);
        settings
    }

    fn descriptor(port: u16) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "probe-target".into(),
            port,
            launch: LaunchSpec::Detached {
                program: PathBuf::from("true"),
                args: vec![],
                env: vec![],
                cwd: None,
            },
            process_hint: None,
        }
    }

    #[tokio::test]
    async fn port_probe_detects_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open(port, Duration::from_millis(500)).await);
        drop(listener);
    }

    #[tokio::test]
    async fn is_running_is_false_without_port_or_process() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let runner = ProcessRunner::new();
        let client = reqwest::Client::new();
        let supervisor = ServiceSupervisor::new(&runner, &settings, &client);
        // Port 1 is never listening in the test environment.
        assert!(!supervisor.is_running(&descriptor(1)).await);
    }

    #[tokio::test]
    async fn wait_until_running_times_out_with_the_service_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let runner = ProcessRunner::new();
        let client = reqwest::Client::new();
        let supervisor = ServiceSupervisor::new(&runner, &settings, &client);
        let err = supervisor
            .wait_until_running(&descriptor(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::ServiceTimeout { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_lifecycle_records_and_clears_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let runner = ProcessRunner::new();
        let client = reqwest::Client::new();
        let supervisor = ServiceSupervisor::new(&runner, &settings, &client);

        let sleeper = ServiceDescriptor {
            name: "sleeper".into(),
            port: 1,
            launch: LaunchSpec::Detached {
                program: PathBuf::from("sleep"),
                args: vec!["30".into()],
                env: vec![],
                cwd: None,
            },
            process_hint: None,
        };

        supervisor.start(&sleeper).await.unwrap();
        let pid_file = settings.pid_file("sleeper");
        assert!(pid_file.exists());
        assert!(supervisor.is_running(&sleeper).await);

        supervisor.stop(&sleeper).await.unwrap();
        assert!(!pid_file.exists());
        assert!(!supervisor.is_running(&sleeper).await);
    }

    #[test]
    fn tags_payload_parses_model_names() {
        let payload = r#"{"models":[{"name":"smollm3-local:latest","size":1}]}"#;
        let tags: TagsResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(tags.models[0].name, "smollm3-local:latest");
    }
}

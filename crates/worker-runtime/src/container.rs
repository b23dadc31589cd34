//! Container management for backend instances
//!
//! Backends run as containers started through a docker-compatible CLI. Every
//! invocation is built from an argument vector and its exit status is checked
//! explicitly.

use crate::readiness::{poll_until, ReadinessPolicy};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_core::{ContainerConfig, Error, Result};

/// Description of a container to run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cpus: Option<f32>,
    /// `(host, container)` port pairs
    pub publish: Vec<(u16, u16)>,
    /// `(host path, container path)` bind mounts
    pub volumes: Vec<(PathBuf, String)>,
    pub env: Vec<(String, String)>,
    /// Extra `docker run` flags such as `--ipc=host`
    pub flags: Vec<String>,
    /// Command and arguments passed to the image
    pub command: Vec<String>,
    /// Run through the GPU-enabled CLI
    pub gpu: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn cpus(mut self, cpus: f32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn publish(mut self, host: u16, container: u16) -> Self {
        self.publish.push((host, container));
        self
    }

    pub fn volume(mut self, host: impl AsRef<Path>, container: impl Into<String>) -> Self {
        self.volumes.push((host.as_ref().to_path_buf(), container.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.push(arg.into());
        self
    }

    pub fn gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Arguments of the detached `run` invocation
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-d".to_string(),
            format!("--name={}", self.name),
        ];
        for (host, container) in &self.publish {
            args.push(format!("-p{}:{}", host, container));
        }
        if let Some(cpus) = self.cpus {
            args.push(format!("--cpus={:.1}", cpus));
        }
        args.extend(self.flags.iter().cloned());
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (host, container) in &self.volumes {
            args.push(format!("-v{}:{}", host.display(), container));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Captured result of one CLI invocation
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Runs and stops containers through the container CLI
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
    gpu_binary: String,
    stop_timeout: Duration,
    command_timeout: Duration,
}

impl ContainerRuntime {
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            gpu_binary: config.gpu_binary.clone(),
            stop_timeout: config.stop_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    async fn exec(&self, binary: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("Running {} {:?}", binary, args);

        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "{} {} did not finish within {:?}",
                    binary,
                    args.first().map(String::as_str).unwrap_or_default(),
                    self.command_timeout
                ))
            })?
            .map_err(|e| Error::launch_failure(format!("failed to spawn {}: {}", binary, e)))?;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Start a detached container and return its id
    pub async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let binary = if spec.gpu { &self.gpu_binary } else { &self.binary };
        info!(name = %spec.name, image = %spec.image, "Starting container");

        let output = self.exec(binary, &spec.run_args()).await?;
        if !output.status.success() {
            return Err(Error::launch_failure(format!(
                "container {} exited with {}: {}",
                spec.name, output.status, output.stderr
            )));
        }

        let id = output.stdout.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(Error::launch_failure(format!(
                "container {} started without reporting an id",
                spec.name
            )));
        }
        Ok(id)
    }

    /// Stop a container. Stopping a container that no longer exists succeeds.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.stop_timeout.as_secs().to_string(),
            name.to_string(),
        ];
        let output = self.exec(&self.binary, &args).await?;
        if output.status.success() {
            info!(name, "Container stopped");
            return Ok(());
        }
        if output.stderr.contains("No such container") {
            debug!(name, "Container already gone");
            return Ok(());
        }
        warn!(name, stderr = %output.stderr, "Container stop failed");
        Err(Error::upstream(format!(
            "stopping container {} exited with {}: {}",
            name, output.status, output.stderr
        )))
    }

    /// Whether a container with exactly this name exists, running or not
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let args = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "--filter".to_string(),
            format!("name=^/{}$", name),
        ];
        let output = self.exec(&self.binary, &args).await?;
        if !output.status.success() {
            return Err(Error::upstream(format!(
                "listing containers exited with {}: {}",
                output.status, output.stderr
            )));
        }
        Ok(!output.stdout.is_empty())
    }

    /// Wait until no container holds `name`, e.g. while a previous instance
    /// of the same name is still being removed
    pub async fn wait_until_absent(
        &self,
        name: &str,
        policy: ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let what = format!("container name {} to become free", name);
        poll_until(policy, cancel, &what, || async move {
            Ok(!self.exists(name).await?)
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_with(binary: &str) -> ContainerRuntime {
        ContainerRuntime::new(&ContainerConfig {
            binary: binary.to_string(),
            gpu_binary: binary.to_string(),
            command_timeout_secs: 5,
            ..Default::default()
        })
    }

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec::new("resnet50_4", "worker/pytorch-serving:latest")
            .publish(9001, 9001)
            .cpus(4.0)
            .flag("--ipc=host")
            .env("OFFLINENICE", "OFF")
            .volume("/tmp/models/resnet50_4", "/tmp/model")
            .arg("serve.py")
            .arg("224");

        assert_eq!(
            spec.run_args(),
            vec![
                "run",
                "--rm",
                "-d",
                "--name=resnet50_4",
                "-p9001:9001",
                "--cpus=4.0",
                "--ipc=host",
                "-e",
                "OFFLINENICE=OFF",
                "-v/tmp/models/resnet50_4:/tmp/model",
                "worker/pytorch-serving:latest",
                "serve.py",
                "224",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_reports_container_id() {
        // `echo` prints its arguments, standing in for a container id.
        let runtime = runtime_with("echo");
        let id = runtime
            .run(&ContainerSpec::new("resnet50_4", "image"))
            .await
            .unwrap();
        assert!(id.contains("--name=resnet50_4"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_launch_failure() {
        let runtime = runtime_with("false");
        let err = runtime
            .run(&ContainerSpec::new("resnet50_4", "image"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailure(_)));

        let err = runtime.stop("resnet50_4").await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let runtime = runtime_with("/nonexistent/container-cli");
        let err = runtime
            .run(&ContainerSpec::new("resnet50_4", "image"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailure(_)));
    }

    #[tokio::test]
    async fn test_absent_name_is_free() {
        // `true` prints nothing, so no container matches.
        let runtime = runtime_with("true");
        assert!(!runtime.exists("resnet50_4").await.unwrap());
        runtime
            .wait_until_absent(
                "resnet50_4",
                ReadinessPolicy::new(Duration::from_millis(10), 3),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }
}

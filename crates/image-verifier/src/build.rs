//! One-shot build container that runs the Makefile against the work directory.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::VerifierConfig;
use crate::error::{Error, Result};
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec, LogSource, SESSION_LABEL};

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Exit code of the build container, always 0
    pub exit_code: i64,
    /// How long the build took
    pub duration: Duration,
}

/// Runs the build container to completion
pub struct BuildStage {
    spec: ContainerSpec,
    timeout: Duration,
}

impl BuildStage {
    /// Create the build stage from the verifier config
    pub fn new(config: &VerifierConfig, session_id: &str) -> Self {
        let spec = ContainerSpec::new(&config.build_image)
            .with_bind(BindMount::read_write(
                &config.docker_socket,
                config.docker_socket.to_string_lossy(),
            ))
            .with_bind(BindMount::read_write(&config.work_dir, &config.build_mount))
            .with_working_dir(&config.build_mount)
            .with_command(config.build_command.clone())
            .with_label(SESSION_LABEL, session_id);

        Self {
            spec,
            timeout: config.build_timeout,
        }
    }

    /// The container the build runs in
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// Run the build and block until it exits.
    ///
    /// Fails unless the container exits with code 0 within the timeout. The
    /// container is removed afterwards in every case.
    pub async fn run<R: ContainerRuntime + ?Sized>(&self, runtime: &R) -> Result<BuildOutcome> {
        info!(
            "Building images with {} (timeout {:?})",
            self.spec.image, self.timeout
        );
        let started = Instant::now();

        runtime.ensure_image(&self.spec.image).await?;
        let container_id = runtime.start(&self.spec).await?;

        let log_task = match runtime.follow_logs(&container_id).await {
            Ok(logs) => Some(forward_logs(logs)),
            Err(e) => {
                warn!("Could not follow build output: {}", e);
                None
            }
        };

        let waited = tokio::time::timeout(self.timeout, runtime.wait(&container_id)).await;
        let result = match waited {
            Ok(Ok(0)) => Ok(BuildOutcome {
                exit_code: 0,
                duration: started.elapsed(),
            }),
            Ok(Ok(exit_code)) => Err(Error::BuildFailed { exit_code }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if let Err(e) = runtime.stop(&container_id).await {
                    warn!("Failed to stop timed out build container: {}", e);
                }
                Err(Error::BuildTimeout {
                    timeout: self.timeout,
                })
            }
        };

        if let Some(task) = log_task {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, task).await.is_err() {
                debug!("Build log stream still open after exit, dropping it");
            }
        }
        if let Err(e) = runtime.remove(&container_id).await {
            warn!("Failed to remove build container {}: {}", container_id, e);
        }

        match &result {
            Ok(outcome) => info!("Build finished in {:?}", outcome.duration),
            Err(e) => warn!("Build failed: {}", e),
        }
        result
    }
}

fn forward_logs(mut logs: crate::runtime::LogStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = logs.next().await {
            match line.source {
                LogSource::Stdout => info!(target: "image_verifier::build", "{}", line.message),
                LogSource::Stderr => warn!(target: "image_verifier::build", "{}", line.message),
            }
        }
    })
}

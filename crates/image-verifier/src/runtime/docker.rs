use std::collections::HashMap;
use std::pin::pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::channel::mpsc;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, ContainerSpec, LogLine, LogSource, LogStream};
use crate::error::{Error, Result};

const STOP_TIMEOUT_SECS: i64 = 10;

/// [`ContainerRuntime`] backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connect to the local daemon and check it responds
    pub async fn connect(host_override: Option<&str>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::docker("connect", e))?;
        docker.ping().await.map_err(|e| Error::docker("ping", e))?;

        let docker_host = std::env::var("DOCKER_HOST").ok();
        let host = resolve_host(host_override, docker_host.as_deref());
        debug!("Connected to Docker, mapped ports reachable via {}", host);

        Ok(Self { docker, host })
    }

    /// Whether a Docker daemon is reachable
    pub async fn is_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}

/// Host used to reach published ports.
///
/// An explicit override wins, then the host part of a `tcp://` style
/// `DOCKER_HOST`, then `localhost`.
pub fn resolve_host(host_override: Option<&str>, docker_host: Option<&str>) -> String {
    if let Some(host) = host_override.filter(|h| !h.trim().is_empty()) {
        return host.trim().to_string();
    }

    if let Some(docker_host) = docker_host {
        let remote = ["tcp://", "http://", "https://"]
            .iter()
            .find_map(|scheme| docker_host.strip_prefix(scheme));
        if let Some(rest) = remote {
            let authority = rest.split('/').next().unwrap_or_default();
            let host = if authority.starts_with('[') {
                authority.split_inclusive(']').next().unwrap_or_default()
            } else {
                authority.split(':').next().unwrap_or_default()
            };
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }

    "localhost".to_string()
}

fn is_status(error: &DockerError, status: u16) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

fn log_lines(output: LogOutput) -> Vec<LogLine> {
    let (source, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (LogSource::Stdout, message)
        }
        LogOutput::StdErr { message } => (LogSource::Stderr, message),
        LogOutput::StdIn { .. } => return Vec::new(),
    };

    String::from_utf8_lossy(&message)
        .lines()
        .map(|line| LogLine {
            source,
            message: line.to_string(),
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = pin!(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| Error::docker("pull image", e))?;
            if let Some(status) = progress.status {
                debug!("[pull {}] {}", image, status);
            }
        }
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();
        let binds: Vec<String> = spec.binds.iter().map(|b| b.to_bind_string()).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                publish_all_ports: Some(!spec.exposed_ports.is_empty()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| Error::docker("create container", e))?;
        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", spec.image, warning);
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Never started, so only removal is needed
            if let Err(remove_err) = self.remove(&created.id).await {
                warn!("Failed to remove unstarted container {}: {}", created.id, remove_err);
            }
            return Err(Error::docker("start container", e));
        }

        info!("Started container {} from {}", created.id, spec.image);
        Ok(created.id)
    }

    async fn follow_logs(&self, container_id: &str) -> Result<LogStream> {
        let (sender, receiver) = mpsc::unbounded();
        let docker = self.docker.clone();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };

            let mut stream = pin!(docker.logs(&container_id, Some(options)));
            while let Some(log_result) = stream.next().await {
                match log_result {
                    Ok(output) => {
                        for line in log_lines(output) {
                            if sender.unbounded_send(line).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Log stream for {} ended: {}", container_id, e);
                        return;
                    }
                }
            }
        });

        Ok(receiver.boxed())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = pin!(self.docker.wait_container(container_id, Some(options)));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::docker("wait container", e)),
            None => {
                let inspect = self
                    .docker
                    .inspect_container(container_id, None::<InspectContainerOptions>)
                    .await
                    .map_err(|e| Error::docker("inspect container", e))?;
                Ok(inspect.state.and_then(|s| s.exit_code).unwrap_or(-1))
            }
        }
    }

    async fn mapped_port(&self, container_id: &str, port: u16) -> Result<u16> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::docker("inspect container", e))?;

        let key = format!("{}/tcp", port);
        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()))
            .ok_or_else(|| Error::PortNotMapped {
                container_id: container_id.to_string(),
                port,
            })
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(Error::docker("stop container", e)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(Error::docker("remove container", e)),
        }
    }
}

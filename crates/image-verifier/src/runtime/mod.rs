//! Container runtime abstraction.
//!
//! The build stage and the per-image verification only talk to containers
//! through [`ContainerRuntime`], so they can be driven by Docker in real runs
//! and by an in-memory runtime in tests.

mod docker;

pub use docker::{DockerRuntime, resolve_host};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Label attached to every container started by this crate
pub const SESSION_LABEL: &str = "image-verifier.session";

/// Stream of log lines from a running container
pub type LogStream = BoxStream<'static, LogLine>;

/// Access mode of a bind mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Mounted read-only
    ReadOnly,
    /// Mounted read-write
    ReadWrite,
}

/// A host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Path on the host
    pub host: PathBuf,
    /// Path inside the container
    pub container: String,
    /// Access mode
    pub mode: BindMode,
}

impl BindMount {
    /// A read-write bind mount
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: BindMode::ReadWrite,
        }
    }

    /// Docker `binds` notation, `host:container:mode`
    pub fn to_bind_string(&self) -> String {
        let mode = match self.mode {
            BindMode::ReadOnly => "ro",
            BindMode::ReadWrite => "rw",
        };
        format!("{}:{}:{}", self.host.display(), self.container, mode)
    }
}

/// Everything needed to create and start a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference, `name:tag`
    pub image: String,
    /// Command overriding the image default
    pub command: Option<Vec<String>>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Container ports published on random host ports
    pub exposed_ports: Vec<u16>,
    /// Host paths mounted into the container
    pub binds: Vec<BindMount>,
    /// Labels attached to the container
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Start building a spec for `image`
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Override the command
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Publish a container port
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    /// Add a bind mount
    pub fn with_bind(mut self, bind: BindMount) -> Self {
        self.binds.push(bind);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One line of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Origin of the line
    pub source: LogSource,
    /// Line text without the trailing newline
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        };
        write!(f, "[{}] {}", source, self.message)
    }
}

/// Operations the verifier needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a container, returning its id
    async fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Follow the container's output until it exits
    async fn follow_logs(&self, container_id: &str) -> Result<LogStream>;

    /// Block until the container exits and return its exit code
    async fn wait(&self, container_id: &str) -> Result<i64>;

    /// Host port bound to the container's `port`
    async fn mapped_port(&self, container_id: &str, port: u16) -> Result<u16>;

    /// Host name through which mapped ports are reachable
    fn host(&self) -> String;

    /// Stop the container
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove the container
    async fn remove(&self, container_id: &str) -> Result<()>;
}

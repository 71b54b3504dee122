//! Shared helpers for image-verifier integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use image_verifier::runtime::{LogLine, LogSource, LogStream};
use image_verifier::{ContainerRuntime, ContainerSpec, Error, Result};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Calls made against the mock runtime, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureImage(String),
    Start(String),
    FollowLogs(String),
    Wait(String),
    MappedPort(String, u16),
    Stop(String),
    Remove(String),
}

/// In-memory container runtime.
///
/// Images registered with [`MockRuntime::serve`] map their container port to
/// a local HTTP responder; the build image exits with a configurable code.
pub struct MockRuntime {
    calls: Arc<Mutex<Vec<Call>>>,
    containers: Mutex<HashMap<String, String>>,
    ports: HashMap<String, u16>,
    build_exit_code: i64,
    build_duration: Duration,
    fail_stop: bool,
    panic_on_port: Option<String>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            containers: Mutex::new(HashMap::new()),
            ports: HashMap::new(),
            build_exit_code: 0,
            build_duration: Duration::ZERO,
            fail_stop: false,
            panic_on_port: None,
        }
    }

    /// Containers of `image` answer on the given responder
    pub fn serve(mut self, image: &str, responder: &Responder) -> Self {
        self.ports.insert(image.to_string(), responder.port);
        self
    }

    /// Containers of `image` start, but nothing answers on their port
    pub fn serve_nothing(mut self, image: &str) -> Self {
        self.ports.insert(image.to_string(), closed_port());
        self
    }

    /// Looking up the port of an `image` container panics
    pub fn with_panicking_port(mut self, image: &str) -> Self {
        self.panic_on_port = Some(image.to_string());
        self
    }

    pub fn with_build_exit_code(mut self, code: i64) -> Self {
        self.build_exit_code = code;
        self
    }

    pub fn with_build_duration(mut self, duration: Duration) -> Self {
        self.build_duration = duration;
        self
    }

    pub fn with_failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Handle on the call log that outlives the runtime
    pub fn call_log(&self) -> Arc<Mutex<Vec<Call>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn image_of(&self, container_id: &str) -> Option<String> {
        self.containers.lock().unwrap().get(container_id).cloned()
    }
}

/// A local port nothing listens on
pub fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Images that were started, in order
pub fn started_images(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::Start(image) => Some(image.clone()),
            _ => None,
        })
        .collect()
}

/// How many times a container of `image` was stopped
pub fn stop_count(calls: &[Call], image: &str) -> usize {
    let suffix = format!("/{}", image);
    calls
        .iter()
        .filter(|c| matches!(c, Call::Stop(id) if id.ends_with(&suffix)))
        .count()
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.record(Call::EnsureImage(image.to_string()));
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(Call::Start(spec.image.clone()));
        let is_build = spec.command.is_some();
        if !is_build && !self.ports.contains_key(&spec.image) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No such image: {}", spec.image),
            )));
        }

        let mut containers = self.containers.lock().unwrap();
        // Ids carry the image so tests can attribute stops
        let id = format!("container-{}/{}", containers.len(), spec.image);
        containers.insert(id.clone(), spec.image.clone());
        Ok(id)
    }

    async fn follow_logs(&self, container_id: &str) -> Result<LogStream> {
        self.record(Call::FollowLogs(container_id.to_string()));
        let lines = vec![
            LogLine {
                source: LogSource::Stdout,
                message: "docker build -t jetty:9.4-jre11 9.4-jre11".to_string(),
            },
            LogLine {
                source: LogSource::Stderr,
                message: "WARNING: apk cache is stale".to_string(),
            },
        ];
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        self.record(Call::Wait(container_id.to_string()));
        tokio::time::sleep(self.build_duration).await;
        Ok(self.build_exit_code)
    }

    async fn mapped_port(&self, container_id: &str, port: u16) -> Result<u16> {
        self.record(Call::MappedPort(container_id.to_string(), port));
        let image = self.image_of(container_id).unwrap_or_default();
        if self.panic_on_port.as_deref() == Some(image.as_str()) {
            panic!("port table corrupted for {}", image);
        }
        self.ports.get(&image).copied().ok_or(Error::PortNotMapped {
            container_id: container_id.to_string(),
            port,
        })
    }

    fn host(&self) -> String {
        "127.0.0.1".to_string()
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.record(Call::Stop(container_id.to_string()));
        if self.fail_stop {
            return Err(Error::Io(std::io::Error::other("stop timed out")));
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.record(Call::Remove(container_id.to_string()));
        Ok(())
    }
}

/// Minimal HTTP server standing in for a running image
pub struct Responder {
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Responder {
    /// Answer every request with `status` and `body`
    pub async fn spawn(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }

                    let request = String::from_utf8_lossy(&request);
                    if let Some(path) = request.split_whitespace().nth(1) {
                        seen.lock().unwrap().push(path.to_string());
                    }

                    let reason = match status {
                        200 => "OK",
                        404 => "Not Found",
                        _ => "Error",
                    };
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        reason,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { port, requests }
    }

    /// Paths requested so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// The fixture webapp's index page shipped with the tests
pub fn fixture_index() -> String {
    std::fs::read_to_string(fixture_source().join("index.html")).unwrap()
}

fn fixture_source() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/test-webapp")
}

/// A work directory with the given entries and the fixture in place
pub fn work_dir(dirs: &[&str], files: &[&str]) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for dir in dirs {
        std::fs::create_dir(temp_dir.path().join(dir)).unwrap();
    }
    for file in files {
        std::fs::write(temp_dir.path().join(file), "").unwrap();
    }

    let fixture = temp_dir.path().join("src/test/resources/test-webapp");
    std::fs::create_dir_all(&fixture).unwrap();
    std::fs::copy(fixture_source().join("index.html"), fixture.join("index.html")).unwrap();
    temp_dir
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::verify::ResponseExpectation;

// Constants for default paths
const FIXTURE_RELATIVE_PATH: &str = "src/test/resources/test-webapp";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const BUILD_MOUNT_PATH: &str = "/work";
const WEBAPP_MOUNT_PATH: &str = "/var/lib/jetty/webapps/test-webapp";
const BUILD_SCRIPT: &str = "ls -la && apk update && apk add make && make";

/// Configuration for building and verifying images
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Directory holding one sub-directory per image tag and the Makefile
    pub work_dir: PathBuf,
    /// Repository name of the images under test
    pub image_name: String,
    /// Helper image used to run the build
    pub build_image: String,
    /// Host path of the container runtime socket
    pub docker_socket: PathBuf,
    /// Where the work directory is mounted inside the build container
    pub build_mount: String,
    /// Command executed by the build container
    pub build_command: Vec<String>,
    /// Upper bound on the build container's run time
    pub build_timeout: Duration,
    /// Skip the build stage and verify images that already exist
    pub skip_build: bool,
    /// Port the image serves HTTP on
    pub container_port: u16,
    /// Host directory of the fixture webapp
    pub fixture_dir: PathBuf,
    /// Where the fixture is mounted inside each verification container
    pub webapp_mount: String,
    /// How long a started image may take to answer HTTP
    pub startup_timeout: Duration,
    /// Path requested from each running image
    pub request_path: String,
    /// Status and body markers each response must satisfy
    pub expectation: ResponseExpectation,
    /// Per-request timeout of the shared client
    pub request_timeout: Duration,
    /// Host used to reach mapped ports, instead of the runtime's own host
    pub host_override: Option<String>,
    /// Only verify these tags; empty means all discovered tags
    pub tag_filter: Vec<String>,
}

/// Rooted at the current directory. If that cannot be read the work
/// directory is `.`, which [`VerifierConfig::validate`] rejects.
impl Default for VerifierConfig {
    fn default() -> Self {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(current_dir)
    }
}

impl VerifierConfig {
    /// Create a config rooted at `work_dir`, with the fixture under it
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let fixture_dir = work_dir.join(FIXTURE_RELATIVE_PATH);
        Self {
            work_dir,
            image_name: "jetty".to_string(),
            build_image: "docker:latest".to_string(),
            docker_socket: PathBuf::from(DOCKER_SOCKET),
            build_mount: BUILD_MOUNT_PATH.to_string(),
            build_command: vec!["sh".to_string(), "-c".to_string(), BUILD_SCRIPT.to_string()],
            build_timeout: Duration::from_secs(10 * 60),
            skip_build: false,
            container_port: 8080,
            fixture_dir,
            webapp_mount: WEBAPP_MOUNT_PATH.to_string(),
            startup_timeout: Duration::from_secs(60),
            request_path: "/test-webapp".to_string(),
            expectation: ResponseExpectation::default(),
            request_timeout: Duration::from_secs(30),
            host_override: None,
            tag_filter: Vec::new(),
        }
    }

    /// Set the image repository name
    pub fn with_image_name(mut self, name: impl Into<String>) -> Self {
        self.image_name = name.into();
        self
    }

    /// Set the fixture directory
    pub fn with_fixture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixture_dir = dir.into();
        self
    }

    /// Set the build timeout
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Skip the build stage
    pub fn with_skip_build(mut self) -> Self {
        self.skip_build = true;
        self
    }

    /// Reach mapped ports through this host
    pub fn with_host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }

    /// Restrict verification to the given tags
    pub fn with_tag_filter(mut self, tags: Vec<String>) -> Self {
        self.tag_filter = tags;
        self
    }

    /// Settings for the shared HTTP client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: self.request_timeout,
            ..ClientConfig::default()
        }
    }

    /// Check the config before any container is started.
    ///
    /// Both directories end up as bind mounts, so they must be absolute.
    pub fn validate(&self) -> Result<()> {
        require_dir(&self.work_dir, "work directory")?;
        require_dir(&self.fixture_dir, "fixture directory")?;

        if self.image_name.trim().is_empty() {
            return Err(Error::config("image name must not be empty"));
        }
        if self.build_command.is_empty() {
            return Err(Error::config("build command must not be empty"));
        }
        if self.build_timeout.is_zero() || self.startup_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }
        if !self.request_path.starts_with('/') {
            return Err(Error::config(format!(
                "request path must start with '/': {}",
                self.request_path
            )));
        }
        Ok(())
    }
}

pub(crate) fn require_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_absolute() {
        Err(Error::config(format!("{} must be an absolute path: {}", what, path.display())))
    } else if path.is_dir() {
        Ok(())
    } else {
        Err(Error::config(format!("{} does not exist: {}", what, path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = VerifierConfig::new("/repo");

        assert_eq!(config.image_name, "jetty");
        assert_eq!(config.build_image, "docker:latest");
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.build_mount, "/work");
        assert_eq!(
            config.build_command,
            vec!["sh", "-c", "ls -la && apk update && apk add make && make"]
        );
        assert_eq!(config.build_timeout, Duration::from_secs(600));
        assert_eq!(config.container_port, 8080);
        assert_eq!(
            config.fixture_dir,
            PathBuf::from("/repo/src/test/resources/test-webapp")
        );
        assert_eq!(config.webapp_mount, "/var/lib/jetty/webapps/test-webapp");
        assert_eq!(config.request_path, "/test-webapp");
        assert_eq!(config.startup_timeout, Duration::from_secs(60));
        assert!(!config.skip_build);
        assert!(config.host_override.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let config = VerifierConfig::new("/repo")
            .with_image_name("jetty-test")
            .with_skip_build()
            .with_host_override("docker.internal")
            .with_build_timeout(Duration::from_secs(5))
            .with_tag_filter(vec!["12.0-jre21".to_string()]);

        assert_eq!(config.image_name, "jetty-test");
        assert!(config.skip_build);
        assert_eq!(config.host_override.as_deref(), Some("docker.internal"));
        assert_eq!(config.build_timeout, Duration::from_secs(5));
        assert_eq!(config.tag_filter, vec!["12.0-jre21"]);
    }

    #[test]
    fn test_client_config_uses_request_timeout() {
        let mut config = VerifierConfig::new("/repo");
        config.request_timeout = Duration::from_secs(3);
        assert_eq!(config.client_config().request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_validate_requires_fixture() {
        let temp_dir = TempDir::new().unwrap();
        let config = VerifierConfig::new(temp_dir.path());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fixture directory"));

        std::fs::create_dir_all(temp_dir.path().join(FIXTURE_RELATIVE_PATH)).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_request_path() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = VerifierConfig::new(temp_dir.path()).with_fixture_dir(temp_dir.path());
        config.request_path = "test-webapp".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let config = VerifierConfig::new(temp_dir.path())
            .with_fixture_dir(temp_dir.path())
            .with_build_timeout(Duration::ZERO);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_fixture_dir() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("rel-fixture")).unwrap();
        // Exists relative to the work dir, but Docker would read it as a volume name
        let config = VerifierConfig::new(temp_dir.path()).with_fixture_dir("rel-fixture");

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fixture directory must be an absolute path"));
    }

    #[test]
    fn test_validate_rejects_relative_work_dir() {
        let config = VerifierConfig::new(".");

        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("work directory must be an absolute path"));
    }
}

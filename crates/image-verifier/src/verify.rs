//! Per-image verification.
//!
//! Each tag goes through `NotStarted -> Running -> Requested -> Verified|Failed
//! -> Stopped`. A failure at any point skips straight to `Failed`, and the
//! container is always stopped before the tag's report is produced.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{HttpResponse, SharedHttpClient};
use crate::config::VerifierConfig;
use crate::discovery::ImageTag;
use crate::error::{AssertionFailure, Error, Result};
use crate::report::{TagReport, Verdict};
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec, SESSION_LABEL};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const BODY_EXCERPT_CHARS: usize = 200;

/// Where a tag's verification stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPhase {
    /// No container yet
    NotStarted,
    /// Container started
    Running,
    /// Response received
    Requested,
    /// Response matched expectations
    Verified,
    /// Something went wrong
    Failed,
    /// Container torn down
    Stopped,
}

impl VerificationPhase {
    /// Whether moving from `self` to `next` is a legal step
    pub fn can_transition_to(self, next: VerificationPhase) -> bool {
        use VerificationPhase::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Failed)
                | (Running, Requested)
                | (Running, Failed)
                | (Requested, Verified)
                | (Requested, Failed)
                | (Verified, Stopped)
                | (Failed, Stopped)
        )
    }
}

impl fmt::Display for VerificationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationPhase::NotStarted => "not started",
            VerificationPhase::Running => "running",
            VerificationPhase::Requested => "requested",
            VerificationPhase::Verified => "verified",
            VerificationPhase::Failed => "failed",
            VerificationPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a successful response looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseExpectation {
    /// Required status code
    pub status: u16,
    /// Substrings the body must contain
    pub markers: Vec<String>,
}

impl Default for ResponseExpectation {
    fn default() -> Self {
        Self {
            status: 200,
            markers: vec!["test-webapp".to_string(), "success".to_string()],
        }
    }
}

impl ResponseExpectation {
    /// Compare a response against the expectation
    pub fn check(&self, response: &HttpResponse) -> std::result::Result<(), AssertionFailure> {
        let missing_markers: Vec<String> = self
            .markers
            .iter()
            .filter(|marker| !response.body.contains(marker.as_str()))
            .cloned()
            .collect();

        if response.status == self.status && missing_markers.is_empty() {
            return Ok(());
        }

        Err(AssertionFailure {
            expected_status: self.status,
            actual_status: response.status,
            missing_markers,
            body_excerpt: response.body.chars().take(BODY_EXCERPT_CHARS).collect(),
        })
    }
}

/// Result of running work against a scoped container
#[derive(Debug)]
pub struct Scoped<T> {
    /// Id of the container, if it was started
    pub container_id: Option<String>,
    /// Result of starting the container and running the work
    pub result: Result<T>,
    /// Result of stopping and removing the container
    pub cleanup: Result<()>,
}

/// Start a container, run `work` against it, then stop and remove it.
///
/// The container is stopped exactly once whether `work` succeeds, returns an
/// error or panics. A panic is resumed after cleanup.
pub async fn with_container<R, F, Fut, T>(runtime: &R, spec: &ContainerSpec, work: F) -> Scoped<T>
where
    R: ContainerRuntime + ?Sized,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let container_id = match runtime.start(spec).await {
        Ok(id) => id,
        Err(e) => {
            return Scoped {
                container_id: None,
                result: Err(e),
                cleanup: Ok(()),
            };
        }
    };

    let outcome = AssertUnwindSafe(work(container_id.clone())).catch_unwind().await;
    let cleanup = release(runtime, &container_id).await;

    match outcome {
        Ok(result) => Scoped {
            container_id: Some(container_id),
            result,
            cleanup,
        },
        Err(panic) => {
            if let Err(e) = &cleanup {
                warn!("{}", e);
            }
            std::panic::resume_unwind(panic)
        }
    }
}

async fn release<R: ContainerRuntime + ?Sized>(runtime: &R, container_id: &str) -> Result<()> {
    let stopped = runtime.stop(container_id).await;
    // Force removal also kills the container if stopping failed
    let removed = runtime.remove(container_id).await;

    let problems: Vec<String> = [stopped, removed]
        .into_iter()
        .filter_map(|r| r.err().map(|e| e.to_string()))
        .collect();
    if problems.is_empty() {
        debug!("Container {} stopped and removed", container_id);
        Ok(())
    } else {
        Err(Error::Cleanup {
            container_id: container_id.to_string(),
            reason: problems.join("; "),
        })
    }
}

/// Container spec for verifying `tag`
pub fn verification_spec(config: &VerifierConfig, session_id: &str, tag: &ImageTag) -> ContainerSpec {
    ContainerSpec::new(tag.image_reference(&config.image_name))
        .with_exposed_port(config.container_port)
        .with_bind(BindMount::read_write(&config.fixture_dir, &config.webapp_mount))
        .with_label(SESSION_LABEL, session_id)
}

/// Poll `url` until the server answers anything.
///
/// The whole wait, including requests in flight, is bounded by `timeout`.
async fn wait_until_responding(
    client: &SharedHttpClient,
    image: &str,
    url: &str,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    let poll = async {
        while !client.responds(url).await {
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(()) => {
            debug!("{} is answering after {:?}", image, start.elapsed());
            Ok(())
        }
        Err(_) => Err(Error::NotReady {
            image: image.to_string(),
            url: url.to_string(),
            timeout,
        }),
    }
}

/// Text of a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Start the image for `tag`, request the fixture and check the response.
///
/// Never fails: every problem ends up in the returned report, panics
/// included, so later tags still run.
pub async fn verify_tag<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    client: &SharedHttpClient,
    config: &VerifierConfig,
    session_id: &str,
    tag: &ImageTag,
) -> TagReport {
    let started = Instant::now();
    let spec = verification_spec(config, session_id, tag);
    let image = spec.image.clone();
    info!("Verifying {}", image);

    let image_ref = image.as_str();
    let scoped = with_container(runtime, &spec, |container_id| async move {
        let work = async {
            let port = runtime.mapped_port(&container_id, config.container_port).await?;
            let base_url = format!("http://{}:{}", runtime.host(), port);
            wait_until_responding(client, image_ref, &base_url, config.startup_timeout).await?;

            let url = format!("{}{}", base_url, config.request_path);
            let response = client.get(&url).await?;
            Ok::<_, Error>(response)
        };
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::Panicked(panic_message(&*panic))),
        }
    });
    // A panic outside the work itself, e.g. while starting the container
    let scoped = match AssertUnwindSafe(scoped).catch_unwind().await {
        Ok(scoped) => scoped,
        Err(panic) => Scoped {
            container_id: None,
            result: Err(Error::Panicked(panic_message(&*panic))),
            cleanup: Ok(()),
        },
    };

    let mut phases = vec![VerificationPhase::NotStarted];
    let mut push = |next: VerificationPhase| {
        let current = *phases.last().unwrap_or(&VerificationPhase::NotStarted);
        debug_assert!(current.can_transition_to(next), "{} -> {}", current, next);
        debug!("{}: {} -> {}", image, current, next);
        phases.push(next);
    };

    if scoped.container_id.is_some() {
        push(VerificationPhase::Running);
    }
    let failure = match scoped.result {
        Ok(response) => {
            push(VerificationPhase::Requested);
            match config.expectation.check(&response) {
                Ok(()) => None,
                Err(assertion) => Some(Error::Assertion(assertion)),
            }
        }
        Err(e) => Some(e),
    };
    let verdict = match &failure {
        None => {
            push(VerificationPhase::Verified);
            Verdict::Passed
        }
        Some(_) => {
            push(VerificationPhase::Failed);
            Verdict::Failed
        }
    };
    if scoped.container_id.is_some() {
        push(VerificationPhase::Stopped);
    }

    let cleanup_error = scoped.cleanup.err().map(|e| e.to_string());
    if let Some(e) = &cleanup_error {
        warn!("{}", e);
    }
    match &failure {
        None => info!("{} verified", image),
        Some(e) => warn!("{} failed: {}", image, e),
    }

    TagReport {
        tag: tag.clone(),
        image,
        verdict,
        phases,
        failure: failure.map(|e| e.to_string()),
        cleanup_error,
        duration: started.elapsed(),
    }
}

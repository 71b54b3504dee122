//! Per-tag results and the run summary.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::discovery::ImageTag;
use crate::verify::VerificationPhase;

/// Outcome of one image's verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Status and body matched
    Passed,
    /// Anything else
    Failed,
}

/// Result of verifying a single image tag
#[derive(Debug, Clone, Serialize)]
pub struct TagReport {
    /// The tag that was verified
    pub tag: ImageTag,
    /// Full image reference
    pub image: String,
    /// Pass or fail
    pub verdict: Verdict,
    /// Phases the verification went through, in order
    pub phases: Vec<VerificationPhase>,
    /// Why the verification failed
    pub failure: Option<String>,
    /// Why the container could not be cleaned up
    pub cleanup_error: Option<String>,
    /// Wall-clock time spent on this tag
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TagReport {
    /// Whether the image passed
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }
}

/// Results of one verification run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    /// Session the run belongs to
    pub session_id: String,
    /// One entry per verified tag, in verification order
    pub tags: Vec<TagReport>,
    /// When verification started
    pub started_at: DateTime<Utc>,
    /// When verification finished
    pub finished_at: DateTime<Utc>,
}

impl SuiteReport {
    /// Tags that passed
    pub fn passed(&self) -> impl Iterator<Item = &TagReport> {
        self.tags.iter().filter(|t| t.passed())
    }

    /// Tags that failed
    pub fn failed(&self) -> impl Iterator<Item = &TagReport> {
        self.tags.iter().filter(|t| !t.passed())
    }

    /// Tags whose container could not be cleaned up
    pub fn cleanup_errors(&self) -> impl Iterator<Item = &TagReport> {
        self.tags.iter().filter(|t| t.cleanup_error.is_some())
    }

    /// True when every tag passed and every container was cleaned up
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none() && self.cleanup_errors().next().is_none()
    }

    /// Serialize the report as pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image verification session {}", self.session_id)?;
        for report in &self.tags {
            let verdict = match report.verdict {
                Verdict::Passed => "PASS",
                Verdict::Failed => "FAIL",
            };
            write!(f, "  {} {} ({:.1}s)", verdict, report.image, report.duration.as_secs_f64())?;
            if let Some(failure) = &report.failure {
                write!(f, ": {}", failure)?;
            }
            writeln!(f)?;
            if let Some(cleanup) = &report.cleanup_error {
                writeln!(f, "       cleanup: {}", cleanup)?;
            }
        }
        write!(
            f,
            "{} passed, {} failed, {} total",
            self.passed().count(),
            self.failed().count(),
            self.tags.len()
        )
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

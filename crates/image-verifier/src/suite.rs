//! Setup, per-tag verification and teardown of a verification run.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::build::BuildStage;
use crate::client::SharedHttpClient;
use crate::config::{VerifierConfig, require_dir};
use crate::discovery::{ImageTag, discover_image_tags};
use crate::error::{Error, Result};
use crate::report::SuiteReport;
use crate::runtime::ContainerRuntime;
use crate::verify::verify_tag;

/// Session id derived from a timestamp, `YYYY-MM-DD_HH-MM-SS`
pub fn session_id_at(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Everything the verifications share, built once by [`SuiteContext::setup`]
pub struct SuiteContext<R: ContainerRuntime> {
    config: VerifierConfig,
    runtime: R,
    tags: Vec<ImageTag>,
    client: SharedHttpClient,
    session_id: String,
}

impl<R: ContainerRuntime> SuiteContext<R> {
    /// Discover tags, build the images unless skipped, start the HTTP client.
    ///
    /// Any error here is fatal: no image gets verified.
    pub async fn setup(config: VerifierConfig, runtime: R) -> Result<Self> {
        let session_id = session_id_at(&Utc::now());
        info!("Running with work directory: {}", config.work_dir.display());

        config.validate()?;
        let tags = select_tags(discover_image_tags(&config.work_dir)?, &config.tag_filter)?;
        info!("{} image tags to verify: {:?}", tags.len(), tags);

        if config.skip_build {
            info!("Skipping image build");
        } else {
            BuildStage::new(&config, &session_id).run(&runtime).await?;
        }

        let client = SharedHttpClient::start(&config.client_config())?;

        Ok(Self {
            config,
            runtime,
            tags,
            client,
            session_id,
        })
    }

    /// Tags that will be verified
    pub fn tags(&self) -> &[ImageTag] {
        &self.tags
    }

    /// Session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The runtime containers are started on
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Verify one tag
    pub async fn verify(&self, tag: &ImageTag) -> crate::report::TagReport {
        verify_tag(&self.runtime, &self.client, &self.config, &self.session_id, tag).await
    }

    /// Verify every tag, one after another. A failing tag does not stop the rest.
    pub async fn verify_all(&self) -> SuiteReport {
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            reports.push(self.verify(tag).await);
        }

        SuiteReport {
            session_id: self.session_id.clone(),
            tags: reports,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Stop the shared client and hand back the runtime
    pub fn teardown(self) -> R {
        self.client.stop();
        info!("Session {} torn down", self.session_id);
        self.runtime
    }
}

/// Keep only the tags named in `filter`, in discovery order.
///
/// Naming a tag that was not discovered is a configuration error.
fn select_tags(tags: Vec<ImageTag>, filter: &[String]) -> Result<Vec<ImageTag>> {
    if filter.is_empty() {
        return Ok(tags);
    }

    if let Some(unknown) = filter.iter().find(|f| !tags.iter().any(|t| t.as_str() == f.as_str())) {
        return Err(Error::config(format!(
            "tag {} was not found among the discovered tags",
            unknown
        )));
    }
    Ok(tags
        .into_iter()
        .filter(|t| filter.iter().any(|f| f == t.as_str()))
        .collect())
}

/// Run only the build stage
pub async fn run_build<R: ContainerRuntime>(
    config: &VerifierConfig,
    runtime: &R,
) -> Result<crate::build::BuildOutcome> {
    require_dir(&config.work_dir, "work directory")?;
    let session_id = session_id_at(&Utc::now());
    BuildStage::new(config, &session_id).run(runtime).await
}

/// Setup, verify every tag, teardown
pub async fn run_suite<R: ContainerRuntime>(config: VerifierConfig, runtime: R) -> Result<SuiteReport> {
    let context = SuiteContext::setup(config, runtime).await?;
    let report = context.verify_all().await;
    context.teardown();

    if report.is_success() {
        info!("All {} images verified", report.tags.len());
    } else {
        warn!(
            "{} of {} images failed verification",
            report.failed().count(),
            report.tags.len()
        );
    }
    Ok(report)
}

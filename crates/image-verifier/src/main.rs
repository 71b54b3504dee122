//! Image verification runner
//!
//! Builds every image variant of the work directory and checks that each one
//! serves the fixture webapp.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use image_verifier::{DockerRuntime, SuiteReport, VerifierConfig, discover_image_tags};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "image-verifier")]
#[command(about = "Build versioned container images and verify each serves the test webapp")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    common: CommonArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args)]
struct CommonArgs {
    /// Directory with one sub-directory per image tag and the Makefile
    #[arg(long, env = "IMAGE_VERIFIER_WORK_DIR", global = true)]
    work_dir: Option<PathBuf>,

    /// Repository name of the images under test
    #[arg(long, env = "IMAGE_VERIFIER_IMAGE", default_value = "jetty", global = true)]
    image_name: String,

    /// Host used to reach published ports
    #[arg(long, env = "IMAGE_VERIFIER_HOST", global = true)]
    host: Option<String>,
}

#[derive(Args)]
struct VerifyArgs {
    /// Only verify this tag (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Fixture webapp directory (defaults to src/test/resources/test-webapp)
    #[arg(long, value_name = "PATH")]
    fixture_dir: Option<PathBuf>,

    /// Seconds a started image may take to answer HTTP
    #[arg(long, default_value_t = 60)]
    startup_timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the image tags found in the work directory
    Discover,

    /// Build all images without verifying them
    Build {
        /// Seconds the build container may run
        #[arg(long, default_value_t = 600)]
        build_timeout: u64,
    },

    /// Verify images that were already built
    Verify(VerifyArgs),

    /// Build all images, then verify each one
    Run {
        /// Skip the build stage
        #[arg(long)]
        skip_build: bool,

        /// Seconds the build container may run
        #[arg(long, default_value_t = 600)]
        build_timeout: u64,

        #[command(flatten)]
        verify: VerifyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = base_config(&cli.common)?;

    match cli.command {
        Commands::Discover => {
            let tags = discover_image_tags(&config.work_dir)?;
            for tag in tags {
                println!("{}", tag);
            }
        }
        Commands::Build { build_timeout } => {
            let config = config.with_build_timeout(Duration::from_secs(build_timeout));
            let runtime = DockerRuntime::connect(config.host_override.as_deref()).await?;
            let outcome = image_verifier::run_build(&config, &runtime)
                .await
                .context("Image build failed")?;
            info!("Images built in {:?}", outcome.duration);
        }
        Commands::Verify(args) => {
            let config = apply_verify_args(config.with_skip_build(), &args)?;
            run(config, args.json).await?;
        }
        Commands::Run {
            skip_build,
            build_timeout,
            verify,
        } => {
            let mut config = apply_verify_args(config, &verify)?
                .with_build_timeout(Duration::from_secs(build_timeout));
            config.skip_build = skip_build;
            run(config, verify.json).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn base_config(common: &CommonArgs) -> Result<VerifierConfig> {
    let work_dir = match &common.work_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let work_dir = work_dir
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize work directory {:?}", work_dir))?;

    let mut config = VerifierConfig::new(work_dir).with_image_name(&common.image_name);
    if let Some(host) = &common.host {
        config = config.with_host_override(host);
    }
    Ok(config)
}

fn apply_verify_args(config: VerifierConfig, args: &VerifyArgs) -> Result<VerifierConfig> {
    let mut config = config.with_tag_filter(args.tags.clone());
    if let Some(dir) = &args.fixture_dir {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize fixture directory {:?}", dir))?;
        config = config.with_fixture_dir(dir);
    }
    config.startup_timeout = Duration::from_secs(args.startup_timeout);
    Ok(config)
}

async fn run(config: VerifierConfig, json: bool) -> Result<()> {
    let runtime = DockerRuntime::connect(config.host_override.as_deref())
        .await
        .context("Failed to connect to Docker")?;
    let report = match image_verifier::run_suite(config, runtime).await {
        Ok(report) => report,
        Err(e) if e.is_fatal() => {
            return Err(anyhow::Error::new(e).context("Setup failed, no images were verified"));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("Container runtime error during setup, no images were verified"));
        }
    };

    print_report(&report, json)?;
    if !report.is_success() {
        anyhow::bail!(
            "{} of {} images failed verification, {} containers not cleaned up",
            report.failed().count(),
            report.tags.len(),
            report.cleanup_errors().count()
        );
    }
    Ok(())
}

fn print_report(report: &SuiteReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

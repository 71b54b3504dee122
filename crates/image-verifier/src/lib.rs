//! Build versioned container images and verify that each one serves a
//! fixture webapp.
//!
//! A run discovers image tags from the directory names of the work
//! directory, builds all images with a one-shot build container, then starts
//! one container per tag, requests the fixture over HTTP and checks the
//! response. See [`run_suite`] for the whole run and [`SuiteContext`] for
//! driving the phases separately.

#![warn(missing_docs)]

pub mod build;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod report;
pub mod runtime;
pub mod suite;
pub mod verify;

pub use build::{BuildOutcome, BuildStage};
pub use client::{ClientConfig, HttpResponse, SharedHttpClient};
pub use config::VerifierConfig;
pub use discovery::{ImageTag, discover_image_tags, is_image_tag};
pub use error::{AssertionFailure, Error, Result};
pub use report::{SuiteReport, TagReport, Verdict};
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use suite::{SuiteContext, run_build, run_suite};
pub use verify::{ResponseExpectation, VerificationPhase, verify_tag, with_container};

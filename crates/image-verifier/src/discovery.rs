//! Image tag discovery from the working directory listing.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+\.[0-9]*-.*$").expect("tag pattern is a valid regex")
});

/// Tag of one image variant, e.g. `12.0-jre21`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageTag(String);

impl ImageTag {
    /// Wrap a name that matches the tag pattern
    pub fn parse(name: &str) -> Option<Self> {
        is_image_tag(name).then(|| Self(name.to_string()))
    }

    /// The tag text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full image reference, `<image_name>:<tag>`
    pub fn image_reference(&self, image_name: &str) -> String {
        format!("{}:{}", image_name, self.0)
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ImageTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether a directory entry name looks like `<major>.<minor>-<suffix>`
pub fn is_image_tag(name: &str) -> bool {
    TAG_PATTERN.is_match(name)
}

/// List `dir` (non-recursively) and keep the entries whose names are image tags.
///
/// Tags are returned in listing order. Names that are not valid UTF-8 are
/// skipped. Any listing error is fatal.
pub fn discover_image_tags(dir: &Path) -> Result<Vec<ImageTag>> {
    let discovery_error = |source| Error::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    let mut tags = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(discovery_error)? {
        let entry = entry.map_err(discovery_error)?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            debug!("Skipping non UTF-8 entry {:?}", file_name);
            continue;
        };
        if let Some(tag) = ImageTag::parse(name) {
            tags.push(tag);
        }
    }

    info!("Discovered image tags in {}: {:?}", dir.display(), tags);
    Ok(tags)
}

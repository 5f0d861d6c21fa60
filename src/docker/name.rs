use std::fmt::{Display, Formatter};

use crate::registry::{Flavor, TAG_SEPARATOR};

/// Number of git sha characters appended to non-production tags.
pub const GIT_SHA_LENGTH: usize = 10;

/// Fully qualified name of a Docker image, as pushed to a registry.
///
/// Rendering is done through `Display`, one format per registry flavor:
///
/// * ECR: `<registry>/<repository>:<image>-<version>`
/// * GAR: `<registry>/<gcp_project>/<repository>/<image>-<version>`
/// * Docker Hub: `<registry>/<repository>/<namespace>:<image>-<version>`
///
/// Each format is suffixed with `-<git sha>` when a git sha is set,
/// truncated to [GIT_SHA_LENGTH] characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub flavor: Flavor,
    pub registry: String,
    pub repository: String,
    pub gcp_project: String,
    /// Docker Hub only. An empty namespace still renders as an empty path segment.
    pub namespace: String,
    pub image: String,
    pub version: String,
    pub git_sha: Option<String>,
}

impl ImageName {
    /// `<image>-<version>`, the part of the tag compared against published versions.
    pub fn stem(&self) -> String {
        format!("{}{TAG_SEPARATOR}{}", self.image, self.version)
    }

    pub fn with_git_sha(self, git_sha: Option<String>) -> Self {
        Self { git_sha, ..self }
    }

    fn git_suffix(&self) -> Option<&str> {
        self.git_sha
            .as_deref()
            .filter(|sha| !sha.is_empty())
            .map(|sha| truncate(sha, GIT_SHA_LENGTH))
    }
}

impl Display for ImageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.flavor {
            Flavor::Ecr => write!(f, "{}/{}:{}", self.registry, self.repository, self.stem())?,
            Flavor::Gar => write!(
                f,
                "{}/{}/{}/{}",
                self.registry,
                self.gcp_project,
                self.repository,
                self.stem()
            )?,
            Flavor::DockerHub => write!(
                f,
                "{}/{}/{}:{}",
                self.registry,
                self.repository,
                self.namespace,
                self.stem()
            )?,
        }
        if let Some(sha) = self.git_suffix() {
            write!(f, "{TAG_SEPARATOR}{sha}")?;
        }
        Ok(())
    }
}

/// Truncate a string to at most `length` characters without panicking.
pub fn truncate(s: &str, length: usize) -> &str {
    match s.char_indices().nth(length) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}

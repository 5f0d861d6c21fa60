use log::debug;
use thiserror::Error;

use crate::ecr::EcrLister;

/// Separator between the image name and its version inside a published tag.
pub const TAG_SEPARATOR: char = '-';

#[derive(Error, Debug)]
pub enum Error {
    #[error("list tags in {repository}: {message}")]
    Query { repository: String, message: String },
}

/// The kind of container registry a given endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// AWS Elastic Container Registry, e.g. `123456789012.dkr.ecr.eu-north-1.amazonaws.com`.
    Ecr,
    /// Google Artifact Registry or the older Google Container Registry.
    Gar,
    /// Docker Hub, and anything else we don't recognize.
    DockerHub,
}

impl Flavor {
    /// Classify a registry endpoint by the hostname markers it contains.
    /// Unrecognized endpoints are treated as Docker Hub style registries.
    pub fn detect(registry: &str) -> Self {
        let registry = registry.to_ascii_lowercase();
        if registry.contains(".ecr.") {
            Flavor::Ecr
        } else if registry.contains("pkg.dev") || registry.contains("gcr.io") {
            Flavor::Gar
        } else {
            Flavor::DockerHub
        }
    }
}

/// AWS account id embedded as the first label of an ECR hostname.
pub fn aws_account_id(registry: &str) -> Option<String> {
    if Flavor::detect(registry) != Flavor::Ecr {
        return None;
    }
    registry
        .split('.')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// The AWS account to act on: an explicitly given id wins over the one in the hostname.
pub fn resolve_account_id(explicit: Option<&str>, registry: &str) -> Option<String> {
    explicit
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| aws_account_id(registry))
}

/// A tag found in a registry, split into image name and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTag {
    pub name: String,
    pub semver: String,
}

impl PublishedTag {
    /// Split a raw tag such as `svc-1.2.3`. Only tags with exactly two
    /// dash-separated components are accepted, so `svc-1.2.3-rc1` or
    /// `svc-1.2.3-0a1b2c3d4e` yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(TAG_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(semver), None) => Some(Self {
                name: name.to_string(),
                semver: semver.to_string(),
            }),
            _ => None,
        }
    }
}

/// Parse raw tags, silently discarding anything malformed.
pub fn parse_tags<I, S>(raw_tags: I) -> Vec<PublishedTag>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw_tags
        .into_iter()
        .filter_map(|raw| {
            let parsed = PublishedTag::parse(raw.as_ref());
            if parsed.is_none() {
                debug!("Ignoring published tag {}", raw.as_ref());
            }
            parsed
        })
        .collect()
}

/// Something that knows which tags have already been published to a repository.
#[allow(async_fn_in_trait)]
pub trait TagLister {
    async fn published_tags(&self, repository: &str) -> Result<Vec<PublishedTag>, Error>;
}

/// Tag lister chosen by registry flavor.
///
/// Only ECR supports listing. Every other registry reports no published
/// tags, which makes the version gate always proceed.
pub enum RegistryLister {
    Ecr(EcrLister),
    Unsupported(Flavor),
}

impl TagLister for RegistryLister {
    async fn published_tags(&self, repository: &str) -> Result<Vec<PublishedTag>, Error> {
        match self {
            RegistryLister::Ecr(ecr) => ecr.published_tags(repository).await,
            RegistryLister::Unsupported(flavor) => {
                debug!("Tag listing is not supported for {flavor:?} registries");
                Ok(vec![])
            }
        }
    }
}

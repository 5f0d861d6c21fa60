use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;
use semver::Version;
use thiserror::Error;
use Error::*;

use crate::docker::name::ImageName;
use crate::gate::parse_version;
use crate::registry::{Flavor, TAG_SEPARATOR};

/// Project manifest file name, found in the root of every image project.
pub const MANIFEST_FILE: &str = "forge.yaml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("no {MANIFEST_FILE} found in {0}")]
    ManifestNotFound(String),

    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("deserialize: {0}")]
    Deserialize(#[from] serde_yaml::Error),

    #[error("missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("neither `container_repo` nor `gcp_project_id` is set")]
    MissingRepository,

    #[error("`{0}` is not a semantic version")]
    InvalidVersion(String),

    #[error("`image_tag` must look like <name>-<version>, got `{0}`")]
    InvalidImageTag(String),
}

/// Path of the manifest inside `dir`, if there is one.
pub fn detect_manifest(dir: &Path) -> Result<PathBuf, Error> {
    let path = dir.join(MANIFEST_FILE);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ManifestNotFound(dir.display().to_string()))
    }
}

/// Parent image an image is built on top of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    pub version: String,
}

/// Contents of a forge.yaml file.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub image_name: String,
    pub image_version: String,
    pub container_registry: Option<String>,
    pub container_repo: Option<String>,
    pub gcp_project_id: Option<String>,
    pub container_namespace: Option<String>,
    pub base_image: Option<BaseImage>,
    build_flags: HashMap<String, bool>,
}

impl Manifest {
    pub fn parse(yaml_string: &str) -> Result<Self, Error> {
        let parsed = serde_yaml::from_str::<yaml::ForgeYaml>(yaml_string)?;

        let (image_name, image_version) = match (
            yaml::text(parsed.image_name),
            yaml::text(parsed.image_version),
            yaml::text(parsed.image_tag),
        ) {
            (Some(name), Some(version), _) => (name, version),
            (None, None, Some(tag)) => split_image_tag(&tag)?,
            (None, _, _) => return Err(MissingKey("image_name")),
            (Some(_), None, _) => return Err(MissingKey("image_version")),
        };

        let base_image = match (
            yaml::text(parsed.base_image_name_used),
            yaml::text(parsed.base_image_version_used),
        ) {
            (Some(name), Some(version)) => Some(BaseImage { name, version }),
            (Some(_), None) => return Err(MissingKey("base_image_version_used")),
            (None, _) => None,
        };

        let build_flags = parsed
            .rest
            .into_iter()
            .filter(|(key, _)| key.starts_with("build_"))
            .filter_map(|(key, value)| value.as_bool().map(|flag| (key, flag)))
            .collect();

        Ok(Self {
            image_name,
            image_version,
            container_registry: yaml::text(parsed.container_registry),
            container_repo: yaml::text(parsed.container_repo),
            gcp_project_id: yaml::text(parsed.gcp_project_id),
            container_namespace: yaml::text(parsed.container_namespace),
            base_image,
            build_flags,
        })
    }

    pub fn parse_file(path: &Path) -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string(path).map_err(|err| ReadFile {
            err,
            path: path.display().to_string(),
        })?)
    }

    /// Whether the manifest asks for an image in `env`.
    ///
    /// Reads `build_<env>`, then the older `build_deploy_<env>`. Absent means no.
    pub fn build_requested(&self, env: &str) -> bool {
        self.build_flags
            .get(&format!("build_{env}"))
            .or_else(|| self.build_flags.get(&format!("build_deploy_{env}")))
            .copied()
            .unwrap_or(false)
    }
}

/// Split an older style `<name>-<version>` image tag.
fn split_image_tag(tag: &str) -> Result<(String, String), Error> {
    match tag.split(TAG_SEPARATOR).collect::<Vec<_>>().as_slice() {
        [name, version] if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_string(), version.to_string()))
        }
        _ => Err(InvalidImageTag(tag.to_string())),
    }
}

/// A manifest resolved against its directory and command line overrides,
/// ready to be built.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub flavor: Flavor,
    pub registry: String,
    pub repository: String,
    pub gcp_project: String,
    pub namespace: String,
    pub image_name: String,
    pub version: Version,
    pub manifest: Manifest,
}

impl Project {
    pub fn resolve(
        dir: &Path,
        manifest: Manifest,
        registry_override: Option<&str>,
    ) -> Result<Self, Error> {
        let registry = registry_override
            .map(str::to_string)
            .or_else(|| manifest.container_registry.clone())
            .ok_or(MissingKey("container_registry"))?;
        let flavor = Flavor::detect(&registry);

        let repository = manifest
            .container_repo
            .clone()
            .or_else(|| manifest.gcp_project_id.clone())
            .ok_or(MissingRepository)?;

        let gcp_project = match (flavor, &manifest.gcp_project_id) {
            (Flavor::Gar, None) => return Err(MissingKey("gcp_project_id")),
            (_, project) => project.clone().unwrap_or_default(),
        };

        let version = parse_version(&manifest.image_version)
            .ok_or_else(|| InvalidVersion(manifest.image_version.clone()))?;

        debug!(
            "Resolved {} {} for {flavor:?} registry {registry}",
            manifest.image_name, version
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            flavor,
            registry,
            repository,
            gcp_project,
            namespace: manifest.container_namespace.clone().unwrap_or_default(),
            image_name: manifest.image_name.clone(),
            version,
            manifest,
        })
    }

    /// Read and resolve the manifest found in `dir`.
    pub fn load(dir: &Path, registry_override: Option<&str>) -> Result<Self, Error> {
        let manifest = Manifest::parse_file(&detect_manifest(dir)?)?;
        Self::resolve(dir, manifest, registry_override)
    }

    /// Name of this project's image, without any git suffix.
    pub fn image(&self) -> ImageName {
        self.image_named(&self.image_name, &self.manifest.image_version)
    }

    /// Name of the pinned parent image, if any.
    pub fn base_image(&self) -> Option<ImageName> {
        self.manifest
            .base_image
            .as_ref()
            .map(|base| self.image_named(&base.name, &base.version))
    }

    fn image_named(&self, image: &str, version: &str) -> ImageName {
        ImageName {
            flavor: self.flavor,
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            gcp_project: self.gcp_project.clone(),
            namespace: self.namespace.clone(),
            image: image.to_string(),
            version: version.to_string(),
            git_sha: None,
        }
    }
}

mod yaml {
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::fmt::{Display, Formatter};

    /// Scalar manifest value. Versions such as `1.4` are read by YAML as numbers.
    #[derive(Deserialize)]
    #[serde(untagged)]
    pub enum Scalar {
        Text(String),
        Number(serde_yaml::Number),
        Bool(bool),
    }

    impl Display for Scalar {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            match self {
                Scalar::Text(text) => f.write_str(text),
                Scalar::Number(number) => write!(f, "{number}"),
                Scalar::Bool(flag) => write!(f, "{flag}"),
            }
        }
    }

    /// Non-empty string form of an optional scalar.
    pub fn text(value: Option<Scalar>) -> Option<String> {
        value
            .map(|value| value.to_string().trim().to_string())
            .filter(|value| !value.is_empty())
    }

    #[derive(Deserialize)]
    pub struct ForgeYaml {
        pub image_name: Option<Scalar>,
        pub image_version: Option<Scalar>,
        pub image_tag: Option<Scalar>,
        pub container_registry: Option<Scalar>,
        pub container_repo: Option<Scalar>,
        pub gcp_project_id: Option<Scalar>,
        pub container_namespace: Option<Scalar>,
        pub base_image_name_used: Option<Scalar>,
        pub base_image_version_used: Option<Scalar>,
        #[serde(flatten)]
        pub rest: HashMap<String, serde_yaml::Value>,
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use log::{debug, info};
use thiserror::Error;

use crate::config;
use crate::docker::name::{truncate, ImageName, GIT_SHA_LENGTH};
use crate::docker::{self, BuildEngine, BuildRequest};
use crate::gate;
use crate::manifest::Project;
use crate::registry::{self, TagLister};
use crate::scaffold;

const AWS_ACCOUNT_ID_ARG: &str = "_AWS_ACCT_ID_";
const BASE_IMAGE_VERSION_ARG: &str = "_BASE_IMG_VERSION_";
const GIT_SHA_ARG: &str = "_GITHUB_SHA_";

/// Environment name that selects the base image flow.
const BASE_ENVIRONMENT: &str = "base";

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown environment `{0}`")]
    UnknownEnvironment(String),

    #[error("registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("{0}")]
    Docker(#[from] docker::Error),

    #[error("dockerfile: {0}")]
    Dockerfile(#[from] scaffold::Error),
}

/// How an image gets built, chosen by environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Parent images. Always built, never version gated.
    /// The optional environment is folded into the image name.
    Base { env: Option<String> },
    /// Production-like environments. Built only when the manifest version is
    /// newer than anything published, and tagged without a git sha.
    Prod,
    /// Development and QA. Built when the manifest asks for it, tagged with a git sha.
    DevQa(String),
}

impl Flow {
    pub fn for_environment(env: &str, environments: &config::Environments) -> Result<Self, Error> {
        if env == BASE_ENVIRONMENT {
            Ok(Flow::Base { env: None })
        } else if environments.production.iter().any(|name| name == env) {
            Ok(Flow::Prod)
        } else if environments.development.iter().any(|name| name == env) {
            Ok(Flow::DevQa(env.to_string()))
        } else {
            Err(Error::UnknownEnvironment(env.to_string()))
        }
    }
}

/// What happened to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pushed(String),
    NotRequested,
    SameVersion,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pushed(tag) => write!(f, "{tag} built & pushed!"),
            Outcome::NotRequested => f.write_str("Not building the image..."),
            Outcome::SameVersion => f.write_str("Same version...  Not dockering it..."),
        }
    }
}

/// Per invocation inputs that don't come from the manifest.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub aws_account_id: Option<String>,
    pub git_sha: Option<String>,
    pub build_args: BTreeMap<String, String>,
}

/// Builds and pushes a single project according to a [Flow].
pub struct Pipeline<'a, E, L> {
    engine: &'a E,
    lister: &'a L,
}

impl<'a, E: BuildEngine, L: TagLister> Pipeline<'a, E, L> {
    pub fn new(engine: &'a E, lister: &'a L) -> Self {
        Self { engine, lister }
    }

    pub async fn run(&self, project: &Project, flow: &Flow, options: &Options) -> Result<Outcome, Error> {
        match flow {
            Flow::Base { env } => self.base(project, env.as_deref(), options).await,
            Flow::Prod => self.prod(project, options).await,
            Flow::DevQa(env) => self.dev_qa(project, env, options).await,
        }
    }

    async fn base(&self, project: &Project, env: Option<&str>, options: &Options) -> Result<Outcome, Error> {
        let image = project.image();
        let image = match env {
            Some(env) => ImageName {
                image: format!("{}_{env}", image.image),
                ..image
            },
            None => image,
        };
        self.build_and_push(project, image, options).await
    }

    async fn prod(&self, project: &Project, options: &Options) -> Result<Outcome, Error> {
        let published = self.lister.published_tags(&project.repository).await?;
        if !gate::should_build(&project.version, &published, &project.image_name) {
            info!("{} {} is already published", project.image_name, project.version);
            return Ok(Outcome::SameVersion);
        }
        self.build_and_push(project, project.image(), options).await
    }

    async fn dev_qa(&self, project: &Project, env: &str, options: &Options) -> Result<Outcome, Error> {
        if !project.manifest.build_requested(env) {
            debug!("{} does not request a build for {env}", project.image_name);
            return Ok(Outcome::NotRequested);
        }
        let git_sha = options
            .git_sha
            .as_deref()
            .map(|sha| truncate(sha, GIT_SHA_LENGTH).to_string());
        self.build_and_push(project, project.image().with_git_sha(git_sha), options)
            .await
    }

    async fn build_and_push(&self, project: &Project, image: ImageName, options: &Options) -> Result<Outcome, Error> {
        let tag = image.to_string();
        let dockerfile = scaffold::dockerfile_for_build(project)?;
        let request = BuildRequest {
            context: project.dir.clone(),
            dockerfile: dockerfile.path().to_path_buf(),
            tag: tag.clone(),
            build_args: build_args(project, &image, options),
        };

        info!("Building {tag}");
        self.engine.build(&request).await?;
        self.engine.push(&tag).await?;
        Ok(Outcome::Pushed(tag))
    }
}

/// Conventional build arguments, set only when they have a value.
/// Arguments passed in explicitly take precedence.
fn build_args(project: &Project, image: &ImageName, options: &Options) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    let aws_account_id = options
        .aws_account_id
        .clone()
        .or_else(|| registry::aws_account_id(&project.registry));
    let base_image_version = project
        .manifest
        .base_image
        .as_ref()
        .map(|base| base.version.clone());
    let git_sha = image.git_sha.clone();

    for (key, value) in [
        (AWS_ACCOUNT_ID_ARG, aws_account_id),
        (BASE_IMAGE_VERSION_ARG, base_image_version),
        (GIT_SHA_ARG, git_sha),
    ] {
        if let Some(value) = value.filter(|value| !value.is_empty()) {
            args.insert(key.to_string(), value);
        }
    }
    args.extend(options.build_args.clone());
    args
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::manifest::Manifest;
    use crate::registry::{parse_tags, PublishedTag};

    const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

    #[derive(Default)]
    struct FakeEngine {
        fail_build: bool,
        builds: Mutex<Vec<BuildRequest>>,
        pushes: Mutex<Vec<String>>,
    }

    impl BuildEngine for FakeEngine {
        async fn build(&self, request: &BuildRequest) -> Result<(), docker::Error> {
            self.builds.lock().unwrap().push(request.clone());
            if self.fail_build {
                Err(docker::Error::BuildOutput)
            } else {
                Ok(())
            }
        }

        async fn push(&self, tag: &str) -> Result<(), docker::Error> {
            self.pushes.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    impl FakeEngine {
        fn pushed(&self) -> Vec<String> {
            self.pushes.lock().unwrap().clone()
        }

        fn built(&self) -> Vec<BuildRequest> {
            self.builds.lock().unwrap().clone()
        }
    }

    enum FakeLister {
        Tags(Vec<PublishedTag>),
        Broken,
    }

    impl TagLister for FakeLister {
        async fn published_tags(&self, repository: &str) -> Result<Vec<PublishedTag>, registry::Error> {
            match self {
                FakeLister::Tags(tags) => Ok(tags.clone()),
                FakeLister::Broken => Err(registry::Error::Query {
                    repository: repository.to_string(),
                    message: "throttled".to_string(),
                }),
            }
        }
    }

    fn project(dir: &Path, version: &str, extra: &str) -> Project {
        let manifest = format!(
            "image_name: svc\nimage_version: {version}\ncontainer_registry: {REGISTRY}\ncontainer_repo: apps\n{extra}"
        );
        Project::resolve(dir, Manifest::parse(&manifest).unwrap(), None).unwrap()
    }

    fn options() -> Options {
        Options {
            git_sha: Some("0123456789abcdef".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn flows_by_environment() {
        let environments = config::Environments::default();
        assert_eq!(Flow::for_environment("prod", &environments).unwrap(), Flow::Prod);
        assert_eq!(
            Flow::for_environment("base", &environments).unwrap(),
            Flow::Base { env: None }
        );
        assert_eq!(
            Flow::for_environment("qa", &environments).unwrap(),
            Flow::DevQa("qa".into())
        );
        assert!(matches!(
            Flow::for_environment("staging", &environments),
            Err(Error::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn status_lines() {
        assert_eq!(Outcome::Pushed("r/a:svc-1.0.0".into()).to_string(), "r/a:svc-1.0.0 built & pushed!");
        assert_eq!(Outcome::NotRequested.to_string(), "Not building the image...");
        assert_eq!(Outcome::SameVersion.to_string(), "Same version...  Not dockering it...");
    }

    #[tokio::test]
    async fn prod_builds_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Tags(parse_tags(["svc-1.9.0"]));

        let outcome = Pipeline::new(&engine, &lister)
            .run(&project(dir.path(), "2.0.0", ""), &Flow::Prod, &options())
            .await
            .unwrap();

        let tag = format!("{REGISTRY}/apps:svc-2.0.0");
        assert_eq!(outcome, Outcome::Pushed(tag.clone()));
        assert_eq!(engine.pushed(), vec![tag.clone()]);
        let built = engine.built();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].tag, tag);
        assert_eq!(built[0].context, dir.path());
        assert!(!built[0].build_args.contains_key(GIT_SHA_ARG));
        assert_eq!(
            built[0].build_args.get(AWS_ACCOUNT_ID_ARG).map(String::as_str),
            Some("123456789012")
        );
    }

    #[tokio::test]
    async fn prod_skips_published_version() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Tags(parse_tags(["svc-1.0.0"]));

        let outcome = Pipeline::new(&engine, &lister)
            .run(&project(dir.path(), "1.0.0", ""), &Flow::Prod, &options())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::SameVersion);
        assert!(engine.built().is_empty());
        assert!(engine.pushed().is_empty());
    }

    #[tokio::test]
    async fn prod_ignores_build_flags() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Tags(vec![]);

        let outcome = Pipeline::new(&engine, &lister)
            .run(&project(dir.path(), "1.0.0", "build_prod: false\n"), &Flow::Prod, &options())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Pushed(_)));
    }

    #[tokio::test]
    async fn prod_aborts_when_registry_query_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();

        let result = Pipeline::new(&engine, &FakeLister::Broken)
            .run(&project(dir.path(), "2.0.0", ""), &Flow::Prod, &options())
            .await;

        assert!(matches!(result, Err(Error::Registry(_))));
        assert!(engine.built().is_empty());
    }

    #[tokio::test]
    async fn dev_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Broken;

        let outcome = Pipeline::new(&engine, &lister)
            .run(
                &project(dir.path(), "9.9.9", "build_dev: false\n"),
                &Flow::DevQa("dev".into()),
                &options(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::NotRequested);
        assert!(engine.built().is_empty());
    }

    #[tokio::test]
    async fn dev_builds_with_git_sha() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Broken;

        let outcome = Pipeline::new(&engine, &lister)
            .run(
                &project(dir.path(), "1.0.0", "build_dev: true\n"),
                &Flow::DevQa("dev".into()),
                &options(),
            )
            .await
            .unwrap();

        let tag = format!("{REGISTRY}/apps:svc-1.0.0-0123456789");
        assert_eq!(outcome, Outcome::Pushed(tag.clone()));
        assert_eq!(
            engine.built()[0].build_args.get(GIT_SHA_ARG).map(String::as_str),
            Some("0123456789")
        );
    }

    #[tokio::test]
    async fn failed_build_is_not_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine {
            fail_build: true,
            ..Default::default()
        };
        let lister = FakeLister::Tags(vec![]);

        let result = Pipeline::new(&engine, &lister)
            .run(&project(dir.path(), "1.0.0", ""), &Flow::Base { env: None }, &options())
            .await;

        assert!(matches!(result, Err(Error::Docker(docker::Error::BuildOutput))));
        assert_eq!(engine.built().len(), 1);
        assert!(engine.pushed().is_empty());
    }

    #[tokio::test]
    async fn base_always_builds_without_git_sha() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Broken;

        let outcome = Pipeline::new(&engine, &lister)
            .run(
                &project(dir.path(), "1.0.0", ""),
                &Flow::Base { env: Some("dv".into()) },
                &options(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Pushed(format!("{REGISTRY}/apps:svc_dv-1.0.0")));
    }

    #[tokio::test]
    async fn build_args_for_child_images() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::default();
        let lister = FakeLister::Tags(vec![]);
        let options = Options {
            aws_account_id: Some("999999999999".into()),
            build_args: BTreeMap::from([
                ("EXTRA".to_string(), "1".to_string()),
                (BASE_IMAGE_VERSION_ARG.to_string(), "override".to_string()),
            ]),
            ..Default::default()
        };

        Pipeline::new(&engine, &lister)
            .run(
                &project(
                    dir.path(),
                    "1.0.0",
                    "base_image_name_used: pybase\nbase_image_version_used: 0.3.0\n",
                ),
                &Flow::Prod,
                &options,
            )
            .await
            .unwrap();

        let args = &engine.built()[0].build_args;
        assert_eq!(args.get(AWS_ACCOUNT_ID_ARG).map(String::as_str), Some("999999999999"));
        assert_eq!(args.get(BASE_IMAGE_VERSION_ARG).map(String::as_str), Some("override"));
        assert_eq!(args.get("EXTRA").map(String::as_str), Some("1"));
    }
}

/// Forgedrop
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::docker::Docker;
use crate::ecr::EcrLister;
use crate::manifest::Project;
use crate::pipeline::{Flow, Options, Outcome, Pipeline};
use crate::registry::{Flavor, RegistryLister};

mod auth;
mod config;
mod docker;
mod ecr;
mod gate;
mod git;
mod manifest;
mod pipeline;
mod registry;
mod scaffold;

/// Build container images from forge.yaml projects and push them to ECR, GAR or Docker Hub.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the forgedrop configuration file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scaffold a new image project with a template forge.yaml.
    Init {
        /// Project name, also used as the image name.
        #[arg(long)]
        name: String,
        /// Directory the project is created in.
        #[arg(long = "where")]
        location: String,
    },
    /// Render a Dockerfile for a project into its directory.
    Dockerfile {
        #[arg(long = "where")]
        location: String,
    },
    /// Build and push a base image. Base images are never version gated.
    Baseimage {
        #[arg(long = "where")]
        location: String,
        /// Environment folded into the image name, as in `<name>_<env>-<version>`.
        #[arg(long)]
        env: Option<String>,
        #[command(flatten)]
        build: BuildFlags,
    },
    /// Build and push the image of one project.
    Image {
        #[arg(long = "where")]
        location: String,
        /// Deployment environment, e.g. dev, qa or prod.
        #[arg(long)]
        env: String,
        /// Commit id of the source. Detected from GITHUB_SHA or git if omitted.
        #[arg(long)]
        gitsha: Option<String>,
        #[command(flatten)]
        build: BuildFlags,
    },
    /// Build and push every project found under a directory, one after another.
    Images {
        #[arg(long)]
        parent_dir: String,
        #[arg(long)]
        env: String,
        /// Commit id of the sources. Detected from GITHUB_SHA or git if omitted.
        #[arg(long)]
        gitsha: Option<String>,
        #[command(flatten)]
        build: BuildFlags,
    },
}

#[derive(Debug, Args)]
struct BuildFlags {
    /// Use this registry instead of `container_registry` from forge.yaml.
    #[arg(long)]
    registry: Option<String>,
    /// AWS account id passed to the build as `_AWS_ACCT_ID_`.
    #[arg(long)]
    aws_acct_id: Option<String>,
    /// Extra build arguments as a JSON object.
    #[arg(long)]
    buildargs: Option<String>,
    /// Log in to the registry with ambient cloud credentials before building.
    #[arg(long)]
    login: bool,
    /// Abort docker build or push after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::Error),

    #[error("forge.yaml: {0}")]
    Manifest(#[from] manifest::Error),

    #[error("build arguments must be a JSON object: {0}")]
    BuildArgs(String),

    #[error("{0}")]
    Pipeline(#[from] pipeline::Error),

    #[error("scaffold: {0}")]
    Scaffold(#[from] scaffold::Error),

    #[error("registry login: {0}")]
    Auth(#[from] auth::Error),

    #[error("docker error: {0}")]
    Docker(#[from] docker::Error),

    #[error("{failed} of {total} projects failed")]
    BatchFailed { failed: usize, total: usize },
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists in the
/// working directory. If it does, it is used implicitly.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "forgedrop.toml";

    let config_file = match &args.config {
        None => Path::new(DEFAULT_CONFIG_FILE)
            .is_file()
            .then(|| DEFAULT_CONFIG_FILE.to_string()),
        Some(c) => Some(c.clone()),
    };

    Ok(match config_file {
        Some(config_file) => {
            debug!("Reading configuration from {config_file}");
            config::File::default_with_user_config_file(&config_file)?
        }
        None => config::File::default(),
    })
}

/// Parse `--buildargs`. Non-string JSON values are passed on in their JSON form.
fn parse_build_args(json: Option<&str>) -> Result<BTreeMap<String, String>, Error> {
    let Some(json) = json.filter(|json| !json.trim().is_empty()) else {
        return Ok(BTreeMap::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|err| Error::BuildArgs(err.to_string()))?;
    let serde_json::Value::Object(map) = value else {
        return Err(Error::BuildArgs(format!("got {json}")));
    };
    Ok(map
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(text) => (key, text),
            other => (key, other.to_string()),
        })
        .collect())
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let cfg = read_config(&args)?;

    match &args.command {
        Commands::Init { name, location } => {
            scaffold::init(name, &scaffold::expand_home(location))?;
            Ok(())
        }
        Commands::Dockerfile { location } => {
            let project = Project::load(&scaffold::expand_home(location), None)?;
            let path = scaffold::write_dockerfile(&project)?;
            info!("Dockerfile written to {}", path.display());
            Ok(())
        }
        Commands::Baseimage { location, env, build } => {
            let flow = Flow::Base { env: env.clone() };
            build_project(&scaffold::expand_home(location), &flow, None, build, &cfg).await?;
            Ok(())
        }
        Commands::Image { location, env, gitsha, build } => {
            let flow = Flow::for_environment(env, &cfg.environments)?;
            build_project(&scaffold::expand_home(location), &flow, gitsha.as_deref(), build, &cfg).await?;
            Ok(())
        }
        Commands::Images { parent_dir, env, gitsha, build } => {
            let flow = Flow::for_environment(env, &cfg.environments)?;
            build_all(&scaffold::expand_home(parent_dir), &flow, gitsha.as_deref(), build, &cfg).await
        }
    }
}

/// Build every project directory under `root`, in name order.
///
/// A failing project is reported and skipped; the batch fails at the end
/// if any project did.
async fn build_all(
    root: &Path,
    flow: &Flow,
    gitsha: Option<&str>,
    flags: &BuildFlags,
    cfg: &config::File,
) -> Result<(), Error> {
    let mut dirs = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<PathBuf>>();
    dirs.sort();

    let mut total = 0;
    let mut failed = 0;
    for dir in dirs {
        if manifest::detect_manifest(&dir).is_err() {
            debug!("Skipping {}, no {}", dir.display(), manifest::MANIFEST_FILE);
            continue;
        }
        total += 1;
        if let Err(err) = build_project(&dir, flow, gitsha, flags, cfg).await {
            error!("{}: {err}", dir.display());
            failed += 1;
        }
    }

    info!("{} of {total} projects processed successfully", total - failed);
    if failed > 0 {
        Err(Error::BatchFailed { failed, total })
    } else {
        Ok(())
    }
}

async fn build_project(
    dir: &Path,
    flow: &Flow,
    gitsha: Option<&str>,
    flags: &BuildFlags,
    cfg: &config::File,
) -> Result<Outcome, Error> {
    info!("Processing {}", dir.display());
    let project = Project::load(dir, flags.registry.as_deref())?;

    let git_sha = match flow {
        Flow::DevQa(_) => git::resolve_sha(gitsha, dir).await,
        Flow::Base { .. } | Flow::Prod => {
            if gitsha.is_some() {
                warn!("Ignoring --gitsha, {} is tagged by version only", dir.display());
            }
            None
        }
    };
    let options = Options {
        aws_account_id: registry::resolve_account_id(flags.aws_acct_id.as_deref(), &project.registry),
        git_sha,
        build_args: parse_build_args(flags.buildargs.as_deref())?,
    };

    let lister = registry_lister(&project, flow, &options, cfg).await;
    let timeout = flags.timeout.map(Duration::from_secs).or(cfg.docker.timeout());
    let docker = Docker::new(cfg.docker.binary.clone(), timeout);

    let logged_in = if flags.login {
        login(&docker, &project, options.aws_account_id.as_deref(), cfg).await?
    } else {
        false
    };

    let outcome = Pipeline::new(&docker, &lister).run(&project, flow, &options).await;

    if logged_in {
        if let Err(err) = docker.logout(&project.registry).await {
            warn!("{err}");
        }
    }

    let outcome = outcome?;
    println!("{outcome}");
    Ok(outcome)
}

/// Only production builds consult the registry, so only they pay for an AWS client.
async fn registry_lister(project: &Project, flow: &Flow, options: &Options, cfg: &config::File) -> RegistryLister {
    match (flow, project.flavor, options.aws_account_id.clone()) {
        (Flow::Prod, Flavor::Ecr, Some(account_id)) => {
            RegistryLister::Ecr(EcrLister::new(&cfg.ecr, &project.registry, account_id).await)
        }
        (_, flavor, _) => RegistryLister::Unsupported(flavor),
    }
}

async fn login(
    docker: &Docker,
    project: &Project,
    aws_account_id: Option<&str>,
    cfg: &config::File,
) -> Result<bool, Error> {
    match auth::credentials(project.flavor, &project.registry, aws_account_id, &cfg.ecr).await? {
        Some(creds) => {
            docker
                .login(&project.registry, &creds.username, &creds.password)
                .await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

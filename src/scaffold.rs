use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::manifest::{Project, MANIFEST_FILE};

const DOCKERFILE: &str = "Dockerfile";
const CHILD_TEMPLATE: &str = include_str!("../templates/Dockerfile");
const BASE_TEMPLATE: &str = include_str!("../templates/Dockerfile.base");
const MANIFEST_TEMPLATE: &str = include_str!("../templates/forge.yaml");
const REQUIREMENTS_TEMPLATE: &str = include_str!("../templates/requirements.txt");

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} already exists")]
    ProjectExists(String),

    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),
}

/// Replace a leading `~` with the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    expand_home_with(path, std::env::var("HOME").ok())
}

fn expand_home_with(path: &str, home: Option<String>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) => PathBuf::from(format!("{home}{rest}")),
        _ => PathBuf::from(path),
    }
}

/// Create a new image project named `name` inside `parent`.
///
/// Lays down a manifest, an empty requirements file and a workspace stub.
/// Refuses to touch an existing directory.
pub fn init(name: &str, parent: &Path) -> Result<PathBuf, Error> {
    let location = parent.join(name);
    if location.exists() {
        return Err(Error::ProjectExists(location.display().to_string()));
    }

    std::fs::create_dir_all(parent)?;
    std::fs::create_dir(&location)?;
    std::fs::create_dir(location.join("workspace"))?;
    std::fs::File::create(location.join("workspace").join("main.py"))?;

    std::fs::write(
        location.join(MANIFEST_FILE),
        MANIFEST_TEMPLATE.replace("{image_name}", name),
    )?;
    std::fs::write(location.join("requirements.txt"), REQUIREMENTS_TEMPLATE)?;

    info!("Project {name} created in {}", location.display());
    Ok(location)
}

/// Dockerfile contents for a project.
///
/// Projects pinned to a parent image build `FROM` it, others get the
/// standalone base image template.
pub fn render_dockerfile(project: &Project) -> String {
    match project.base_image() {
        Some(base_image) => CHILD_TEMPLATE.replace("{base_image}", &base_image.to_string()),
        None => BASE_TEMPLATE.replace("{image_name}", &project.image_name),
    }
}

/// Write the rendered Dockerfile into the project directory.
pub fn write_dockerfile(project: &Project) -> Result<PathBuf, Error> {
    let path = project.dir.join(DOCKERFILE);
    std::fs::write(&path, render_dockerfile(project))?;
    Ok(path)
}

/// The Dockerfile used for a build.
pub enum Dockerfile {
    /// Maintained by hand in the project directory.
    Existing(PathBuf),
    /// Rendered from a template for the duration of the build.
    Generated(tempfile::NamedTempFile),
}

impl Dockerfile {
    pub fn path(&self) -> &Path {
        match self {
            Dockerfile::Existing(path) => path,
            Dockerfile::Generated(file) => file.path(),
        }
    }
}

/// Use the project's own Dockerfile if it has one, otherwise render one into a temporary file.
pub fn dockerfile_for_build(project: &Project) -> Result<Dockerfile, Error> {
    let existing = project.dir.join(DOCKERFILE);
    if existing.is_file() {
        return Ok(Dockerfile::Existing(existing));
    }

    debug!("No Dockerfile in {}, generating one", project.dir.display());
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(render_dockerfile(project).as_bytes())?;
    file.flush()?;
    Ok(Dockerfile::Generated(file))
}

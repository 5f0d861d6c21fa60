use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;

pub mod name;

/// Marker in streamed build output that fails a build regardless of exit code.
const BUILD_ERROR_MARKER: &str = "ERROR";

#[derive(Error, Debug)]
pub enum Error {
    #[error("docker build failed with exit code {0}")]
    Build(ExitStatus),

    #[error("docker build reported an error in its output")]
    BuildOutput,

    #[error("docker login failed with exit code {0}")]
    Login(ExitStatus),

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error("docker push failed with exit code {0}")]
    Push(ExitStatus),

    #[error("docker {0} did not finish within {1:?}")]
    Timeout(&'static str, Duration),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Everything needed to build one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context directory.
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
}

/// Builds and pushes container images.
#[allow(async_fn_in_trait)]
pub trait BuildEngine {
    async fn build(&self, request: &BuildRequest) -> Result<(), Error>;
    async fn push(&self, tag: &str) -> Result<(), Error>;
}

/// The docker command line client.
pub struct Docker {
    binary: String,
    timeout: Option<Duration>,
}

impl Docker {
    pub fn new(binary: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true);
        command
    }

    async fn with_timeout<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match self.timeout {
            None => fut.await,
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout(what, limit))?,
        }
    }

    pub async fn login(&self, registry: &str, username: &str, password: &str) -> Result<(), Error> {
        debug!("Logging in to Docker registry {registry}");
        let mut child = self
            .command()
            .arg("login")
            .arg(registry)
            .arg("--username")
            .arg(username)
            .arg("--password-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
        }
        let status = self
            .with_timeout("login", async { Ok::<_, Error>(child.wait().await?) })
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Login(status))
        }
    }

    pub async fn logout(&self, registry: &str) -> Result<(), Error> {
        let status = self
            .command()
            .arg("logout")
            .arg(registry)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Logout(status))
        }
    }
}

impl BuildEngine for Docker {
    async fn build(&self, request: &BuildRequest) -> Result<(), Error> {
        debug!("Building image {} from {}", request.tag, request.dockerfile.display());
        let mut command = self.command();
        command
            .arg("build")
            .arg("--file")
            .arg(&request.dockerfile)
            .arg("--tag")
            .arg(&request.tag);
        for (key, value) in &request.build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        let mut child = command
            .arg(&request.context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, error_marked) = self
            .with_timeout("build", async {
                let (out, err) = tokio::join!(echo_lines(stdout, false), echo_lines(stderr, true));
                let status = child.wait().await?;
                Ok::<_, Error>((status, out? || err?))
            })
            .await?;

        if !status.success() {
            Err(Error::Build(status))
        } else if error_marked {
            Err(Error::BuildOutput)
        } else {
            Ok(())
        }
    }

    async fn push(&self, tag: &str) -> Result<(), Error> {
        debug!("Pushing image {tag}");
        let mut child = self
            .command()
            .arg("push")
            .arg(tag)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let status = self
            .with_timeout("push", async { Ok::<_, Error>(child.wait().await?) })
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Push(status))
        }
    }
}

/// Echo every line of `reader` to the console, returning whether any of them
/// carried the build error marker.
///
/// Output is not required to be UTF-8, invalid bytes are replaced.
async fn echo_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    to_stderr: bool,
) -> Result<bool, std::io::Error> {
    let Some(reader) = reader else {
        return Ok(false);
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut error_marked = false;
    while reader.read_until(b'\n', &mut buf).await? > 0 {
        let text = String::from_utf8_lossy(&buf).into_owned();
        buf.clear();
        let line = text.trim_end_matches(['\n', '\r']);
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        error_marked |= line.contains(BUILD_ERROR_MARKER);
    }
    Ok(error_marked)
}

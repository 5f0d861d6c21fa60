use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("deserialize: {0}")]
    Deserialize(#[from] toml::de::Error),
}

/// A forgedrop.toml file.
#[derive(Deserialize, Debug, Clone)]
pub struct File {
    pub description: Option<String>,
    #[serde(default = "Default::default")]
    pub docker: Docker,
    #[serde(default = "Default::default")]
    pub environments: Environments,
    #[serde(default = "Default::default")]
    pub ecr: Ecr,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Read a user configuration file. Sections and keys missing from it
    /// fall back to the built-in defaults.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user_config = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::parse(&user_config)
    }

    pub fn parse(user_config: &str) -> Result<Self, Error> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let user: toml::Table = toml::from_str(user_config)?;
        merge(&mut merged, user);
        Ok(toml::Value::Table(merged).try_into()?)
    }
}

/// Recursively overlay `overlay` on top of `base`.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge(base_table, overlay_table)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Docker {
    #[serde_inline_default("docker".to_string())]
    pub binary: String,
    /// Upper bound for a single build or push. Unset means wait forever.
    pub timeout_secs: Option<u64>,
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout_secs: None,
        }
    }
}

impl Docker {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Which environment names select which build flow.
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Environments {
    #[serde_inline_default(vec!["prod".to_string()])]
    pub production: Vec<String>,
    #[serde_inline_default(vec!["dev".to_string(), "qa".to_string()])]
    pub development: Vec<String>,
}

impl Default for Environments {
    fn default() -> Self {
        Self {
            production: vec!["prod".to_string()],
            development: vec!["dev".to_string(), "qa".to_string()],
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Ecr {
    /// Page size for image listing requests.
    #[serde_inline_default(1000)]
    pub max_results: i32,
    pub region: Option<String>,
}

impl Default for Ecr {
    fn default() -> Self {
        Self {
            max_results: 1000,
            region: None,
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::time::Duration;

    #[test]
    pub fn load_default_configuration() {
        let cfg = super::File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.docker.binary, "docker");
        assert_eq!(cfg.docker.timeout(), None);
        assert_eq!(cfg.environments.production, vec!["prod"]);
        assert_eq!(cfg.environments.development, vec!["dev", "qa"]);
        assert_eq!(cfg.ecr.max_results, 1000);
    }

    #[test]
    pub fn user_configuration_overrides_defaults() {
        let cfg = super::File::parse(
            r#"
            [docker]
            timeout_secs = 600

            [environments]
            production = ["prod", "stg"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.docker.binary, "docker");
        assert_eq!(cfg.docker.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.environments.production, vec!["prod", "stg"]);
        assert_eq!(cfg.environments.development, vec!["dev", "qa"]);
    }

    #[test]
    pub fn broken_user_configuration() {
        assert!(super::File::parse("[docker\n").is_err());
        assert!(super::File::parse("[ecr]\nmax_results = \"many\"").is_err());
    }

    #[test]
    pub fn missing_user_configuration_file() {
        let err = super::File::default_with_user_config_file("/nonexistent/forgedrop.toml");
        assert!(matches!(err, Err(super::Error::ReadFile { .. })));
    }
}

use std::time::Duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config;
use crate::ecr;
use crate::registry::{self, Flavor};

#[derive(Error, Debug)]
pub enum Error {
    #[error("google auth error: {0}")]
    GoogleAuth(#[from] google_cloud_auth::error::Error),

    #[error("google auth token error: {0}")]
    GoogleAuthToken(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("unexpected response with status {0}: {1}")]
    Deserialize(u16, String),

    #[error("ecr authorization token: {0}")]
    Ecr(String),

    #[error("no AWS account id in registry {0}")]
    MissingAccountId(String),
}

/// Username and password for `docker login`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Obtain registry credentials from the ambient cloud identity.
///
/// Returns `None` for registries we can't log in to on our own, in which
/// case an existing docker login is expected.
pub async fn credentials(
    flavor: Flavor,
    registry: &str,
    aws_account_id: Option<&str>,
    ecr_cfg: &config::Ecr,
) -> Result<Option<Credentials>, Error> {
    match flavor {
        Flavor::Ecr => {
            let account_id = registry::resolve_account_id(aws_account_id, registry)
                .ok_or_else(|| Error::MissingAccountId(registry.to_string()))?;
            let client = ecr::client(ecr_cfg, registry).await;
            let password = ecr::login_password(&client, &account_id)
                .await
                .map_err(Error::Ecr)?;
            Ok(Some(Credentials {
                username: "AWS".into(),
                password,
            }))
        }
        Flavor::Gar => Ok(Some(Credentials {
            username: "oauth2accesstoken".into(),
            password: gar_token().await?,
        })),
        Flavor::DockerHub => {
            warn!("Don't know how to log in to {registry}, relying on an existing docker login");
            Ok(None)
        }
    }
}

/// OAuth2 access token for Google Artifact Registry.
///
/// Inside GitHub Actions with a workload identity pool configured, the
/// GitHub id token is exchanged for a Google token. Everywhere else the
/// application default credentials are used.
pub async fn gar_token() -> Result<String, Error> {
    let workload_identity_pool = std::env::var("WORKLOAD_IDENTITY_POOL").ok();
    let github_id_token_url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok();
    let github_token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok();

    match (workload_identity_pool, github_id_token_url, github_token) {
        (Some(pool), Some(url), Some(token)) => {
            let id_token = github_id_token(&url, &token, &pool).await?;
            exchange_federated_token(&pool, &id_token.value)
                .await
                .map(|token| token.access_token)
        }
        _ => default_credentials_token().await,
    }
}

async fn default_credentials_token() -> Result<String, Error> {
    debug!("Exchanging Google application default credentials for an oauth2 token");

    use google_cloud_auth::{project::Config, token::DefaultTokenSourceProvider};
    use google_cloud_token::TokenSourceProvider as _;

    let scopes = ["https://www.googleapis.com/auth/cloud-platform"];
    let config = Config::default()
        .with_audience("https://oauth2.googleapis.com/token/")
        .with_scopes(&scopes);
    let tsp = DefaultTokenSourceProvider::new(config).await?;
    let token = tsp.token_source().token().await?;
    Ok(strip_bearer(&token).to_string())
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    value: String,
}

fn http_client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?)
}

async fn decode_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|_| Error::Deserialize(status, String::from_utf8_lossy(&bytes).to_string()))
}

async fn exchange_federated_token(
    workload_identity_pool: &str,
    github_id_token: &str,
) -> Result<TokenExchangeResponse, Error> {
    debug!("Exchanging federated GitHub token for an oauth2 token");
    let request = TokenExchangeRequest {
        audience: &format!("//iam.googleapis.com/{workload_identity_pool}"),
        grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
        requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
        scope: "https://www.googleapis.com/auth/cloud-platform",
        subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
        subject_token: github_id_token,
    };

    let resp = http_client()?
        .post("https://sts.googleapis.com/v1/token")
        .json(&request)
        .send()
        .await?;
    decode_response(resp).await
}

async fn github_id_token(
    url: &str,
    bearer_token: &str,
    workload_identity_pool: &str,
) -> Result<GitHubTokenResponse, Error> {
    debug!("Getting GitHub actions id_token");
    let resp = http_client()?
        .get(url)
        .bearer_auth(bearer_token)
        .query(&[(
            "audience",
            format!("https://iam.googleapis.com/{workload_identity_pool}"),
        )])
        .send()
        .await?;
    decode_response(resp).await
}

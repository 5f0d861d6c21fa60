use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecr::error::DisplayErrorContext;
use aws_sdk_ecr::types::{ListImagesFilter, TagStatus};
use aws_sdk_ecr::Client;
use base64::Engine as _;
use log::debug;

use crate::config;
use crate::registry::{self, PublishedTag, TagLister};

/// Lists tagged images in an ECR repository.
pub struct EcrLister {
    client: Client,
    registry_id: String,
    max_results: i32,
}

/// Region embedded in an ECR hostname, e.g. `eu-north-1` in
/// `123456789012.dkr.ecr.eu-north-1.amazonaws.com`.
pub fn region_from_registry(registry: &str) -> Option<String> {
    let mut labels = registry.split('.');
    labels.find(|label| *label == "ecr")?;
    labels
        .next()
        .filter(|region| !region.is_empty())
        .map(str::to_string)
}

/// Load AWS credentials from the default provider chain, pinned to the configured
/// region, or the one found in the registry hostname.
pub async fn client(cfg: &config::Ecr, registry: &str) -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = cfg.region.clone().or_else(|| region_from_registry(registry)) {
        debug!("Using AWS region {region}");
        loader = loader.region(Region::new(region));
    }
    Client::new(&loader.load().await)
}

impl EcrLister {
    pub async fn new(cfg: &config::Ecr, registry: &str, registry_id: String) -> Self {
        Self::with_client(client(cfg, registry).await, registry_id, cfg.max_results)
    }

    pub fn with_client(client: Client, registry_id: String, max_results: i32) -> Self {
        Self {
            client,
            registry_id,
            max_results,
        }
    }
}

impl TagLister for EcrLister {
    async fn published_tags(&self, repository: &str) -> Result<Vec<PublishedTag>, registry::Error> {
        let mut raw_tags = Vec::new();
        let mut next_token = None;

        loop {
            let resp = self
                .client
                .list_images()
                .registry_id(&self.registry_id)
                .repository_name(repository)
                .max_results(self.max_results)
                .filter(ListImagesFilter::builder().tag_status(TagStatus::Tagged).build())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|err| registry::Error::Query {
                    repository: repository.to_string(),
                    message: DisplayErrorContext(&err).to_string(),
                })?;

            raw_tags.extend(
                resp.image_ids()
                    .iter()
                    .filter_map(|id| id.image_tag().map(str::to_string)),
            );

            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!("{} tags found in ECR repository {repository}", raw_tags.len());
        Ok(registry::parse_tags(raw_tags))
    }
}

/// Exchange AWS credentials for a docker login password.
///
/// ECR hands out a base64 encoded `AWS:<password>` pair.
pub async fn login_password(client: &Client, registry_id: &str) -> Result<String, String> {
    let resp = client
        .get_authorization_token()
        .registry_ids(registry_id)
        .send()
        .await
        .map_err(|err| DisplayErrorContext(&err).to_string())?;

    let token = resp
        .authorization_data()
        .iter()
        .find_map(|data| data.authorization_token())
        .ok_or_else(|| "no authorization data returned".to_string())?;

    decode_authorization_token(token)
}

fn decode_authorization_token(token: &str) -> Result<String, String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|err| err.to_string())?;
    let decoded = String::from_utf8(decoded).map_err(|err| err.to_string())?;
    decoded
        .split_once(':')
        .map(|(_user, password)| password.to_string())
        .ok_or_else(|| "authorization token is not a user:password pair".to_string())
}

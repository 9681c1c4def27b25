//! Application directory: resolves an application id to its name, space and org.
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::time;
use tracing::debug;

use crate::error::DirectoryError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppMetadata {
    pub app_id: String,
    pub name: String,
    pub space: String,
    pub org: String,
}

/// A source of application metadata. `Ok(None)` means the application does not exist.
#[async_trait]
pub trait AppDirectory: Send + Sync + 'static {
    async fn fetch_app_metadata(&self, app_id: &str) -> Result<Option<AppMetadata>, DirectoryError>;
}

/// Cloud Controller v3 backed directory. One request per lookup: the app is
/// fetched with its space and organization included.
pub struct HttpAppDirectory {
    client: reqwest::Client,
    api_url: url::Url,
}

#[derive(Deserialize)]
struct AppResource {
    guid: String,
    name: String,
    #[serde(default)]
    included: Included,
}

#[derive(Deserialize, Default)]
struct Included {
    #[serde(default)]
    spaces: Vec<SpaceResource>,
    #[serde(default)]
    organizations: Vec<NamedResource>,
}

#[derive(Deserialize)]
struct SpaceResource {
    name: String,
    relationships: SpaceRelationships,
}

#[derive(Deserialize)]
struct SpaceRelationships {
    organization: ToOne,
}

#[derive(Deserialize)]
struct ToOne {
    data: Guid,
}

#[derive(Deserialize)]
struct Guid {
    guid: String,
}

#[derive(Deserialize)]
struct NamedResource {
    guid: String,
    name: String,
}

impl HttpAppDirectory {
    pub fn new(
        api_url: &str,
        token: Option<&str>,
        request_timeout: time::Duration,
    ) -> Result<Self, DirectoryError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("bearer {token}"))
                .map_err(|_| DirectoryError::InvalidToken)?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Firehose Nozzle")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: url::Url::parse(api_url)?,
        })
    }
}

#[async_trait]
impl AppDirectory for HttpAppDirectory {
    async fn fetch_app_metadata(&self, app_id: &str) -> Result<Option<AppMetadata>, DirectoryError> {
        let mut url = self.api_url.join(&format!("v3/apps/{app_id}"))?;
        url.query_pairs_mut()
            .append_pair("include", "space.organization");

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(app_id, "application not found in directory");
            return Ok(None);
        }

        let app: AppResource = response.error_for_status()?.json().await?;
        let space = app.included.spaces.first();
        let org = space.and_then(|space| {
            app.included
                .organizations
                .iter()
                .find(|org| org.guid == space.relationships.organization.data.guid)
        });

        Ok(Some(AppMetadata {
            app_id: app.guid,
            name: app.name,
            space: space.map(|s| s.name.clone()).unwrap_or_default(),
            org: org.map(|o| o.name.clone()).unwrap_or_default(),
        }))
    }
}

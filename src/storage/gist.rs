use super::{DocumentStore, FileChanges, RemoteBundle};
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

const PAGE_SIZE: usize = 100;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// GitHub Gist REST API client.
pub struct GistClient {
    client: Client,
    api_url: String,
}

impl GistClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(&config.gist_api_url, &config.github_token, config.http_timeout)
    }

    pub fn with_base_url(
        api_url: &str,
        token: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| Error::Config("GitHub token contains invalid characters".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(GistClient {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreatedGist {
    id: String,
}

/// Turns a non-2xx response into [`Error::Remote`], keeping GitHub's
/// `message` when the body carries one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiMessage>(&body)
        .map(|m| m.message)
        .unwrap_or(body);
    Err(Error::Remote {
        status: status.as_u16(),
        message,
    })
}

fn files_payload(files: &FileChanges) -> Value {
    let files: serde_json::Map<String, Value> = files
        .iter()
        .map(|(name, content)| {
            let value = match content {
                Some(content) => json!({ "content": content }),
                None => Value::Null,
            };
            (name.clone(), value)
        })
        .collect();
    Value::Object(files)
}

#[async_trait]
impl DocumentStore for GistClient {
    async fn find_bundle(&self, label: &str) -> Result<Option<String>> {
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(self.url("/gists"))
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await?;
            let gists: Vec<RemoteBundle> = check(response).await?.json().await?;

            if let Some(found) = gists
                .iter()
                .find(|g| g.description.as_deref() == Some(label))
            {
                tracing::debug!(gist = %found.id, page, "found library gist");
                return Ok(Some(found.id.clone()));
            }
            if gists.len() < PAGE_SIZE {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn create_bundle(&self, label: &str, files: &FileChanges) -> Result<String> {
        let body = json!({
            "description": label,
            "public": false,
            "files": files_payload(files),
        });
        let response = self
            .client
            .post(self.url("/gists"))
            .json(&body)
            .send()
            .await?;
        let created: CreatedGist = check(response).await?.json().await?;
        tracing::info!(gist = %created.id, files = files.len(), "created library gist");
        Ok(created.id)
    }

    async fn patch_bundle(&self, id: &str, files: &FileChanges) -> Result<()> {
        let body = json!({ "files": files_payload(files) });
        let response = self
            .client
            .patch(self.url(&format!("/gists/{id}")))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        tracing::debug!(gist = %id, files = files.len(), "patched library gist");
        Ok(())
    }

    async fn fetch_bundle(&self, id: &str) -> Result<RemoteBundle> {
        let response = self
            .client
            .get(self.url(&format!("/gists/{id}")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch_raw(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        Ok(check(response).await?.text().await?)
    }

    async fn verify_credentials(&self) -> Result<bool> {
        let response = self.client.get(self.url("/user")).send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            _ => check(response).await.map(|_| true),
        }
    }
}

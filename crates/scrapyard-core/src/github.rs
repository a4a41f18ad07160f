//! Source-host integration: per-owner installation tokens and contributor
//! lists, served by a GitHub App.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum SourceHostError {
    /// The owner has not installed the app; no token can be issued.
    #[error("no app installation for {0}")]
    NotInstalled(String),
    #[error("source host request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source host returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid app credentials: {0}")]
    Credentials(String),
}

#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Short-lived token granting read access to the owner's repositories.
    async fn installation_token(&self, owner: &str) -> Result<SecretString, SourceHostError>;

    /// Logins of everyone who has committed to `full_name` (`owner/repo`).
    async fn contributor_nicknames(
        &self,
        full_name: &str,
        token: &SecretString,
    ) -> Result<Vec<String>, SourceHostError>;
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Contributor {
    login: Option<String>,
}

const PER_PAGE: usize = 100;

pub struct GitHubApp {
    api_url: String,
    app_id: String,
    key: EncodingKey,
    client: reqwest::Client,
}

impl GitHubApp {
    pub fn new(api_url: &str, app_id: &str, private_key_pem: &[u8]) -> Result<Self, SourceHostError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| SourceHostError::Credentials(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("scrapyard")
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            key,
            client,
        })
    }

    /// `None` when no app id is configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        if config.github_app_id.is_empty() {
            return Ok(None);
        }
        let pem = std::fs::read(&config.github_app_private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "failed to read GitHub App key {}: {e}",
                config.github_app_private_key_path
            )
        })?;
        let app = Self::new(&config.github_api_url, &config.github_app_id, &pem)?;
        Ok(Some(app))
    }

    fn app_jwt(&self) -> Result<String, SourceHostError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 9 * 60,
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| SourceHostError::Credentials(e.to_string()))
    }

    fn request(&self, method: reqwest::Method, path: &str, bearer: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(bearer)
    }

    async fn installation_id(&self, owner: &str, jwt: &str) -> Result<i64, SourceHostError> {
        for scope in ["users", "orgs"] {
            let resp = self
                .request(reqwest::Method::GET, &format!("/{scope}/{owner}/installation"), jwt)
                .send()
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                continue;
            }
            let installation: Installation = check(resp).await?.json().await?;
            return Ok(installation.id);
        }
        Err(SourceHostError::NotInstalled(owner.to_string()))
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SourceHostError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SourceHostError::Api {
        status: status.as_u16(),
        body: body.chars().take(300).collect(),
    })
}

#[async_trait]
impl SourceHost for GitHubApp {
    async fn installation_token(&self, owner: &str) -> Result<SecretString, SourceHostError> {
        let jwt = self.app_jwt()?;
        let id = self.installation_id(owner, &jwt).await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/app/installations/{id}/access_tokens"),
                &jwt,
            )
            .send()
            .await?;
        let token: AccessToken = check(resp).await?.json().await?;
        debug!(owner, installation = id, "github: issued installation token");
        Ok(SecretString::from(token.token))
    }

    async fn contributor_nicknames(
        &self,
        full_name: &str,
        token: &SecretString,
    ) -> Result<Vec<String>, SourceHostError> {
        let mut logins = Vec::new();
        for page in 1.. {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &format!("/repos/{full_name}/contributors?per_page={PER_PAGE}&page={page}"),
                    token.expose_secret(),
                )
                .send()
                .await?;
            // Empty repositories answer 204 with no body.
            if resp.status() == StatusCode::NO_CONTENT {
                break;
            }
            let batch: Vec<Contributor> = check(resp).await?.json().await?;
            let n = batch.len();
            logins.extend(batch.into_iter().filter_map(|c| c.login));
            if n < PER_PAGE {
                break;
            }
        }
        Ok(logins)
    }
}

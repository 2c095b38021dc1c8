// src/services/http.rs

//! REST client for the v1.1-style social-graph API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{AppError, Result, Unavailable};
use crate::models::{ApiConfig, CrawlerConfig, Profile};
use crate::services::api::{GraphApi, IdPage};
use crate::utils::http::create_async_client;

/// Upstream error code for a suspended account.
const CODE_SUSPENDED: i64 = 63;
/// Upstream error code for an account that does not exist.
const CODE_NOT_FOUND: i64 = 50;

#[derive(Debug, Deserialize)]
struct WireUser {
    id_str: String,
    screen_name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    profile_image_url_https: Option<String>,
    #[serde(default)]
    friends_count: u64,
    #[serde(default)]
    followers_count: u64,
}

impl From<WireUser> for Profile {
    fn from(user: WireUser) -> Self {
        Profile {
            id: user.id_str,
            screen_name: user.screen_name,
            url: user.url.unwrap_or_default(),
            description: user.description.unwrap_or_default(),
            profile_image_url: user.profile_image_url_https.unwrap_or_default(),
            friends_count: user.friends_count,
            followers_count: user.followers_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireIds {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    next_cursor: i64,
}

#[derive(Debug, Default, Deserialize)]
struct WireErrors {
    #[serde(default)]
    errors: Vec<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Map an upstream error code to a permanent account condition.
fn unavailable_from_code(code: i64) -> Option<Unavailable> {
    match code {
        CODE_SUSPENDED => Some(Unavailable::Suspended),
        CODE_NOT_FOUND => Some(Unavailable::NotFound),
        _ => None,
    }
}

/// Bearer-token authenticated API client.
pub struct HttpGraphApi {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpGraphApi {
    pub fn new(crawler: &CrawlerConfig, api: &ApiConfig) -> Result<Self> {
        let mut base = api.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            client: create_async_client(crawler)?,
            base_url: Url::parse(&base)?,
            bearer_token: api.bearer_token.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        account: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.base_url.join(endpoint)?;
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited { retry_after_secs });
        }

        let errors: WireErrors = serde_json::from_str(&body).unwrap_or_default();
        if let Some(reason) = errors.errors.iter().find_map(|e| unavailable_from_code(e.code)) {
            return Err(AppError::AccountUnavailable {
                account: account.to_string(),
                reason,
            });
        }
        let message = errors
            .errors
            .first()
            .map(|e| format!("{} (code {})", e.message, e.code))
            .unwrap_or_else(|| body.chars().take(200).collect());
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::not_found(format!("{}: {}", account, message)));
        }
        Err(AppError::upstream(format!("{} {}: {}", status, endpoint, message)))
    }

    async fn ids(&self, endpoint: &str, id: &str, cursor: i64, page_size: u32) -> Result<IdPage> {
        let wire: WireIds = self
            .get_json(
                endpoint,
                id,
                &[
                    ("user_id", id.to_string()),
                    ("cursor", cursor.to_string()),
                    ("count", page_size.to_string()),
                    ("stringify_ids", "true".to_string()),
                ],
            )
            .await?;
        Ok(IdPage {
            ids: wire.ids,
            next_cursor: wire.next_cursor,
        })
    }
}

#[async_trait]
impl GraphApi for HttpGraphApi {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Profile> {
        let user: WireUser = self
            .get_json("users/show.json", handle, &[("screen_name", handle.to_string())])
            .await?;
        Ok(user.into())
    }

    async fn lookup_by_id(&self, id: &str) -> Result<Profile> {
        let user: WireUser = self
            .get_json("users/show.json", id, &[("user_id", id.to_string())])
            .await?;
        Ok(user.into())
    }

    async fn friend_ids(&self, id: &str, cursor: i64, page_size: u32) -> Result<IdPage> {
        self.ids("friends/ids.json", id, cursor, page_size).await
    }

    async fn follower_ids(&self, id: &str, cursor: i64, page_size: u32) -> Result<IdPage> {
        self.ids("followers/ids.json", id, cursor, page_size).await
    }
}

//! X v2 API client.
//!
//! The trait is the network boundary the processors program against; the
//! reqwest implementation talks to the real API and classifies failures into
//! the engine taxonomy, including the distinguished case where an upstream
//! network policy intercepts the request and returns an HTML block page
//! instead of an API error.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::constants::DISCOVERY_PAGE_SIZE;
use crate::errors::EngineError;
use crate::storage::records::XPaidTier;
use crate::x::oauth::{AppOAuthCredentials, ClientAuthStrategy};
use crate::x::types::{PublishedPost, SearchPost, SearchQuery, TokenResponse, XUser};

/// How much failure body is retained in error messages.
const ERROR_BODY_LIMIT: usize = 512;

#[async_trait]
pub trait XApi: Send + Sync {
    async fn search_recent(
        &self,
        access_token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchPost>, EngineError>;

    /// Publish a post, optionally as a reply (thread chaining and reply
    /// engagement both go through the same endpoint).
    async fn publish_post(
        &self,
        access_token: &str,
        text: &str,
        in_reply_to: Option<&str>,
    ) -> Result<PublishedPost, EngineError>;

    async fn like_post(
        &self,
        access_token: &str,
        x_user_id: &str,
        post_id: &str,
    ) -> Result<(), EngineError>;

    async fn follow_user(
        &self,
        access_token: &str,
        x_user_id: &str,
        target_user_id: &str,
    ) -> Result<(), EngineError>;

    async fn get_authenticated_user(&self, access_token: &str) -> Result<XUser, EngineError>;

    /// Infer the account's paid tier from the rate-limit ceiling the API
    /// advertises on the user-lookup endpoint.
    async fn detect_paid_tier(&self, access_token: &str) -> Result<XPaidTier, EngineError>;

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
        strategy: &ClientAuthStrategy,
    ) -> Result<TokenResponse, EngineError>;

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        creds: &AppOAuthCredentials,
    ) -> Result<TokenResponse, EngineError>;
}

/// Build the recent-search query string for one topic.
pub fn build_search_query(query: &SearchQuery) -> String {
    let mut parts = vec![
        query.keyword.trim().to_string(),
        "-is:retweet".to_string(),
        "-is:reply".to_string(),
    ];
    if let Some(language) = &query.language {
        if !language.is_empty() {
            parts.push(format!("lang:{}", language));
        }
    }
    if query.min_likes > 0 {
        parts.push(format!("min_faves:{}", query.min_likes));
    }
    parts.join(" ")
}

/// Detect an HTML block page injected by a network security appliance in
/// place of the expected JSON error.
pub fn is_network_block_page(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect::<String>().to_lowercase();
    head.starts_with("<!doctype html")
        || head.starts_with("<html")
        || head.contains("blocked by network security")
}

/// Map a failed response to the engine taxonomy.
pub fn classify_failure(status: u16, body: &str) -> EngineError {
    if is_network_block_page(body) {
        return EngineError::NetworkBlocked;
    }
    EngineError::ThirdPartyApi {
        status,
        body: body.chars().take(ERROR_BODY_LIMIT).collect(),
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    EngineError::Network {
        details: err.to_string(),
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<RawSearchPost>,
    #[serde(default)]
    includes: SearchIncludes,
}

#[derive(Deserialize, Default)]
struct SearchIncludes {
    #[serde(default)]
    users: Vec<XUser>,
}

#[derive(Deserialize)]
struct RawSearchPost {
    id: String,
    text: String,
    author_id: String,
    lang: Option<String>,
    #[serde(default)]
    public_metrics: RawPublicMetrics,
}

#[derive(Deserialize, Default)]
struct RawPublicMetrics {
    #[serde(default)]
    like_count: i64,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct PublishedPostData {
    id: String,
    text: String,
}

pub struct HttpXApi {
    http_client: Arc<reqwest::Client>,
    api_base_url: String,
    oauth_token_url: String,
}

impl HttpXApi {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        api_base_url: String,
        oauth_token_url: String,
    ) -> Self {
        Self {
            http_client,
            api_base_url,
            oauth_token_url,
        }
    }

    async fn read_failure(response: reqwest::Response) -> EngineError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        classify_failure(status, &body)
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        basic: Option<(&str, &str)>,
    ) -> Result<TokenResponse, EngineError> {
        let mut request = self.http_client.post(&self.oauth_token_url).form(params);
        if let Some((username, password)) = basic {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        response.json().await.map_err(transport_error)
    }
}

#[async_trait]
impl XApi for HttpXApi {
    async fn search_recent(
        &self,
        access_token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchPost>, EngineError> {
        let response = self
            .http_client
            .get(format!("{}/tweets/search/recent", self.api_base_url))
            .bearer_auth(access_token)
            .query(&[
                ("query", build_search_query(query)),
                ("max_results", DISCOVERY_PAGE_SIZE.to_string()),
                ("tweet.fields", "author_id,lang,public_metrics".to_string()),
                ("expansions", "author_id".to_string()),
                ("user.fields", "username".to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }

        let payload: SearchResponse = response.json().await.map_err(transport_error)?;
        let users_by_id: HashMap<String, XUser> = payload
            .includes
            .users
            .into_iter()
            .map(|user| (user.id.clone(), user))
            .collect();

        Ok(payload
            .data
            .into_iter()
            .map(|post| SearchPost {
                author_handle: users_by_id
                    .get(&post.author_id)
                    .and_then(|user| user.username.clone()),
                id: post.id,
                text: post.text,
                author_id: post.author_id,
                language: post.lang,
                like_count: post.public_metrics.like_count,
            })
            .collect())
    }

    async fn publish_post(
        &self,
        access_token: &str,
        text: &str,
        in_reply_to: Option<&str>,
    ) -> Result<PublishedPost, EngineError> {
        let body = match in_reply_to {
            Some(parent) => json!({
                "text": text,
                "reply": {"in_reply_to_tweet_id": parent},
            }),
            None => json!({"text": text}),
        };

        let response = self
            .http_client
            .post(format!("{}/tweets", self.api_base_url))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }

        let envelope: DataEnvelope<PublishedPostData> =
            response.json().await.map_err(transport_error)?;
        debug!(post_id = %envelope.data.id, "Published post");
        Ok(PublishedPost {
            id: envelope.data.id,
            text: envelope.data.text,
        })
    }

    async fn like_post(
        &self,
        access_token: &str,
        x_user_id: &str,
        post_id: &str,
    ) -> Result<(), EngineError> {
        let response = self
            .http_client
            .post(format!("{}/users/{}/likes", self.api_base_url, x_user_id))
            .bearer_auth(access_token)
            .json(&json!({"tweet_id": post_id}))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        Ok(())
    }

    async fn follow_user(
        &self,
        access_token: &str,
        x_user_id: &str,
        target_user_id: &str,
    ) -> Result<(), EngineError> {
        let response = self
            .http_client
            .post(format!(
                "{}/users/{}/following",
                self.api_base_url, x_user_id
            ))
            .bearer_auth(access_token)
            .json(&json!({"target_user_id": target_user_id}))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        Ok(())
    }

    async fn get_authenticated_user(&self, access_token: &str) -> Result<XUser, EngineError> {
        let response = self
            .http_client
            .get(format!("{}/users/me", self.api_base_url))
            .bearer_auth(access_token)
            .query(&[("user.fields", "username,name")])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }

        let envelope: DataEnvelope<XUser> = response.json().await.map_err(transport_error)?;
        Ok(envelope.data)
    }

    async fn detect_paid_tier(&self, access_token: &str) -> Result<XPaidTier, EngineError> {
        let response = self
            .http_client
            .get(format!("{}/users/me", self.api_base_url))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }

        let rate_limit = response
            .headers()
            .get("x-rate-limit-limit")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(paid_tier_for_rate_limit(rate_limit))
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
        strategy: &ClientAuthStrategy,
    ) -> Result<TokenResponse, EngineError> {
        match strategy {
            ClientAuthStrategy::PublicClient { client_id } => {
                self.token_request(
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", client_id),
                    ],
                    None,
                )
                .await
            }
            ClientAuthStrategy::BasicClientId {
                client_id,
                client_secret,
            } => {
                self.token_request(
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", client_id),
                    ],
                    Some((client_id, client_secret)),
                )
                .await
            }
            ClientAuthStrategy::BasicApiKey {
                api_key,
                client_secret,
            } => {
                self.token_request(
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ],
                    Some((api_key, client_secret)),
                )
                .await
            }
            ClientAuthStrategy::BasicApiKeyWithClientId {
                api_key,
                client_secret,
                client_id,
            } => {
                self.token_request(
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", client_id),
                    ],
                    Some((api_key, client_secret)),
                )
                .await
            }
        }
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        creds: &AppOAuthCredentials,
    ) -> Result<TokenResponse, EngineError> {
        let callback_url = creds
            .callback_url
            .as_deref()
            .ok_or(EngineError::MissingAppCredentials)?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback_url),
            ("code_verifier", code_verifier),
            ("client_id", &creds.client_id),
        ];
        let basic = creds
            .client_secret
            .as_deref()
            .map(|secret| (creds.client_id.as_str(), secret));

        self.token_request(&params, basic).await
    }
}

/// Tier thresholds observed on the `x-rate-limit-limit` header.
pub fn paid_tier_for_rate_limit(rate_limit: i64) -> XPaidTier {
    if rate_limit >= 1000 {
        XPaidTier::Enterprise
    } else if rate_limit >= 300 {
        XPaidTier::Pro
    } else if rate_limit >= 60 {
        XPaidTier::Basic
    } else {
        XPaidTier::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_includes_filters_in_order() {
        let query = SearchQuery {
            keyword: "  rust async  ".to_string(),
            language: Some("en".to_string()),
            min_likes: 25,
        };
        assert_eq!(
            build_search_query(&query),
            "rust async -is:retweet -is:reply lang:en min_faves:25"
        );

        let bare = SearchQuery {
            keyword: "rust".to_string(),
            language: None,
            min_likes: 0,
        };
        assert_eq!(build_search_query(&bare), "rust -is:retweet -is:reply");
    }

    #[test]
    fn html_block_pages_are_distinguished_from_api_errors() {
        let block = classify_failure(403, "<!DOCTYPE html><html><body>Access Denied</body></html>");
        assert!(matches!(block, EngineError::NetworkBlocked));

        let block = classify_failure(200, "\n  <html><head><title>Blocked</title></head>");
        assert!(matches!(block, EngineError::NetworkBlocked));

        let api = classify_failure(429, r#"{"title":"Too Many Requests"}"#);
        assert!(matches!(
            api,
            EngineError::ThirdPartyApi { status: 429, .. }
        ));
    }

    #[test]
    fn long_failure_bodies_are_truncated() {
        let body = "x".repeat(5000);
        match classify_failure(500, &body) {
            EngineError::ThirdPartyApi { body, .. } => assert_eq!(body.len(), ERROR_BODY_LIMIT),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn paid_tier_thresholds() {
        assert_eq!(paid_tier_for_rate_limit(0), XPaidTier::Free);
        assert_eq!(paid_tier_for_rate_limit(59), XPaidTier::Free);
        assert_eq!(paid_tier_for_rate_limit(60), XPaidTier::Basic);
        assert_eq!(paid_tier_for_rate_limit(300), XPaidTier::Pro);
        assert_eq!(paid_tier_for_rate_limit(1000), XPaidTier::Enterprise);
    }
}

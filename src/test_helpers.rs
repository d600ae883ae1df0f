//! Test helper utilities for xgrowth tests
//!
//! Provides a reversible secrets codec, a scriptable mock of the X API, a
//! scriptable generator, and a harness that assembles the full service
//! bundle from in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai::{Moderation, OfflineTextGenerator, PostPrompt, ReplyPrompt, TextGenerator};
use crate::coordination::MemoryCoordination;
use crate::errors::{EngineError, SecretsError};
use crate::jobs::context::{PacingPolicy, Services};
use crate::secrets::SecretsCodec;
use crate::storage::records::{
    Connection, InternalPlan, NewCandidate, UsageAction, UsageMeta, User, XPaidTier,
};
use crate::storage::{
    MemoryAccountStorage, MemoryAuditStorage, MemoryCandidateStorage, MemoryConfigStorage,
    MemoryGeneratedPostStorage, MemoryTopicStorage, MemoryUsageStorage,
};
use crate::text::fingerprint_text;
use crate::x::client::XApi;
use crate::x::oauth::{AppOAuthCredentials, ClientAuthStrategy};
use crate::x::types::{PublishedPost, SearchPost, SearchQuery, TokenResponse, XUser};

/// Reversible marker codec. Not encryption; just enough to verify that the
/// engine never hands stored values around un-decoded.
pub struct TestCodec;

impl SecretsCodec for TestCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        Ok(format!("enc[{plaintext}]"))
    }

    fn decrypt(&self, payload: &str) -> Result<String, SecretsError> {
        payload
            .strip_prefix("enc[")
            .and_then(|rest| rest.strip_suffix(']'))
            .map(str::to_string)
            .ok_or(SecretsError::InvalidPayload)
    }
}

/// Build a search result fixture.
pub fn search_post(id: &str, text: &str, like_count: i64) -> SearchPost {
    SearchPost {
        id: id.to_string(),
        text: text.to_string(),
        author_id: format!("author-{id}"),
        author_handle: Some(format!("handle_{id}")),
        language: Some("en".to_string()),
        like_count,
    }
}

/// Scriptable mock of the X API boundary.
#[derive(Default)]
pub struct MockXApi {
    search_results: Mutex<Vec<SearchPost>>,
    search_failure: Mutex<Option<EngineError>>,
    search_calls: Mutex<usize>,

    published: Mutex<Vec<(String, Option<String>)>>,
    publish_failures: Mutex<HashMap<usize, EngineError>>,
    publish_calls: Mutex<usize>,
    publish_delay_ms: Mutex<u64>,

    likes: Mutex<Vec<String>>,
    like_failure: Mutex<Option<EngineError>>,
    follows: Mutex<Vec<String>>,

    refresh_script: Mutex<Vec<Result<TokenResponse, EngineError>>>,
    refresh_attempts: Mutex<Vec<(String, Option<String>)>>,
}

impl MockXApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_search_results(&self, posts: Vec<SearchPost>) {
        *self.search_results.lock() = posts;
    }

    pub fn fail_search_with(&self, err: EngineError) {
        *self.search_failure.lock() = Some(err);
    }

    pub fn search_calls(&self) -> usize {
        *self.search_calls.lock()
    }

    /// `(text, in_reply_to)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Option<String>)> {
        self.published.lock().clone()
    }

    /// The id assigned to the nth successful publish.
    pub fn post_id(&self, index: usize) -> String {
        format!("x-post-{index}")
    }

    pub fn fail_publish_at(&self, call_index: usize, err: EngineError) {
        self.publish_failures.lock().insert(call_index, err);
    }

    pub fn set_publish_delay_ms(&self, delay: u64) {
        *self.publish_delay_ms.lock() = delay;
    }

    pub fn likes(&self) -> Vec<String> {
        self.likes.lock().clone()
    }

    pub fn fail_likes_with(&self, err: EngineError) {
        *self.like_failure.lock() = Some(err);
    }

    pub fn follows(&self) -> Vec<String> {
        self.follows.lock().clone()
    }

    /// Queue per-call refresh outcomes; once drained, further calls fail
    /// with a terminal 401.
    pub fn script_refresh(&self, outcomes: Vec<Result<TokenResponse, EngineError>>) {
        let mut script = self.refresh_script.lock();
        script.clear();
        script.extend(outcomes);
    }

    /// Strategy labels of every refresh attempt, in order.
    pub fn refresh_attempts(&self) -> Vec<String> {
        self.refresh_attempts
            .lock()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Client ids sent with refresh attempts, for strategies that carry one.
    pub fn refresh_client_ids(&self) -> Vec<String> {
        self.refresh_attempts
            .lock()
            .iter()
            .filter_map(|(_, client_id)| client_id.clone())
            .collect()
    }
}

#[async_trait]
impl XApi for MockXApi {
    async fn search_recent(
        &self,
        _access_token: &str,
        _query: &SearchQuery,
    ) -> Result<Vec<SearchPost>, EngineError> {
        *self.search_calls.lock() += 1;
        if let Some(err) = self.search_failure.lock().clone() {
            return Err(err);
        }
        Ok(self.search_results.lock().clone())
    }

    async fn publish_post(
        &self,
        _access_token: &str,
        text: &str,
        in_reply_to: Option<&str>,
    ) -> Result<PublishedPost, EngineError> {
        let delay = *self.publish_delay_ms.lock();
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        // fail_publish_at indexes publish calls, successful or not.
        let call_index = {
            let mut calls = self.publish_calls.lock();
            let index = *calls;
            *calls += 1;
            index
        };
        if let Some(err) = self.publish_failures.lock().remove(&call_index) {
            return Err(err);
        }

        let mut published = self.published.lock();
        let id = format!("x-post-{}", published.len());
        published.push((text.to_string(), in_reply_to.map(str::to_string)));
        Ok(PublishedPost {
            id,
            text: text.to_string(),
        })
    }

    async fn like_post(
        &self,
        _access_token: &str,
        _x_user_id: &str,
        post_id: &str,
    ) -> Result<(), EngineError> {
        if let Some(err) = self.like_failure.lock().clone() {
            return Err(err);
        }
        self.likes.lock().push(post_id.to_string());
        Ok(())
    }

    async fn follow_user(
        &self,
        _access_token: &str,
        _x_user_id: &str,
        target_user_id: &str,
    ) -> Result<(), EngineError> {
        self.follows.lock().push(target_user_id.to_string());
        Ok(())
    }

    async fn get_authenticated_user(&self, _access_token: &str) -> Result<XUser, EngineError> {
        Ok(XUser {
            id: "x-mock".to_string(),
            username: Some("mock_handle".to_string()),
            name: Some("Mock".to_string()),
        })
    }

    async fn detect_paid_tier(&self, _access_token: &str) -> Result<XPaidTier, EngineError> {
        Ok(XPaidTier::Basic)
    }

    async fn refresh_access_token(
        &self,
        _refresh_token: &str,
        strategy: &ClientAuthStrategy,
    ) -> Result<TokenResponse, EngineError> {
        let client_id = match strategy {
            ClientAuthStrategy::PublicClient { client_id } => Some(client_id.clone()),
            ClientAuthStrategy::BasicClientId { client_id, .. } => Some(client_id.clone()),
            ClientAuthStrategy::BasicApiKey { .. } => None,
            ClientAuthStrategy::BasicApiKeyWithClientId { client_id, .. } => {
                Some(client_id.clone())
            }
        };
        self.refresh_attempts
            .lock()
            .push((strategy.label().to_string(), client_id));

        let mut script = self.refresh_script.lock();
        if script.is_empty() {
            return Err(EngineError::ThirdPartyApi {
                status: 401,
                body: "refresh not scripted".to_string(),
            });
        }
        script.remove(0)
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _code_verifier: &str,
        _creds: &AppOAuthCredentials,
    ) -> Result<TokenResponse, EngineError> {
        Ok(TokenResponse {
            access_token: "exchanged-access".to_string(),
            token_type: "bearer".to_string(),
            expires_in: Some(7200),
            refresh_token: Some("exchanged-refresh".to_string()),
            scope: Some("tweet.read".to_string()),
        })
    }
}

/// Generator whose post output can be scripted; replies and moderation fall
/// through to the deterministic offline implementation.
#[derive(Default)]
pub struct MockGenerator {
    offline: OfflineTextGenerator,
    post_parts: Mutex<Option<Vec<String>>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_post_parts(&self, parts: Vec<String>) {
        *self.post_parts.lock() = Some(parts);
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate_reply(&self, prompt: &ReplyPrompt) -> anyhow::Result<String> {
        self.offline.generate_reply(prompt).await
    }

    async fn generate_post(&self, prompt: &PostPrompt) -> anyhow::Result<Vec<String>> {
        if let Some(parts) = self.post_parts.lock().clone() {
            return Ok(parts);
        }
        self.offline.generate_post(prompt).await
    }

    async fn moderate(&self, text: &str) -> anyhow::Result<Moderation> {
        self.offline.moderate(text).await
    }
}

/// Full service bundle over in-memory implementations, with handles onto the
/// pieces tests assert against.
pub struct TestHarness {
    pub services: Services,
    pub api: Arc<MockXApi>,
    pub generator: Arc<MockGenerator>,
    pub usage: Arc<MemoryUsageStorage>,
    pub audit: Arc<MemoryAuditStorage>,
    pub now: DateTime<Utc>,
}

/// A clock pinned to noon today (UTC) keeps "earlier today but outside the
/// last hour" constructible at any wall-clock time.
fn fixed_noon() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    Utc.from_utc_datetime(&today.and_hms_opt(12, 0, 0).expect("noon"))
}

pub fn default_test_credentials() -> AppOAuthCredentials {
    AppOAuthCredentials {
        client_id: "defaultclient1234".to_string(),
        client_secret: Some("default-secret".to_string()),
        callback_url: Some("https://app.example.com/callback".to_string()),
    }
}

impl TestHarness {
    pub async fn new() -> Self {
        let api = Arc::new(MockXApi::new());
        let generator = Arc::new(MockGenerator::new());
        let usage = Arc::new(MemoryUsageStorage::new());
        let audit = Arc::new(MemoryAuditStorage::new());
        let now = fixed_noon();

        let services = Services {
            accounts: Arc::new(MemoryAccountStorage::new()),
            topics: Arc::new(MemoryTopicStorage::new()),
            candidates: Arc::new(MemoryCandidateStorage::new()),
            configs: Arc::new(MemoryConfigStorage::new()),
            posts: Arc::new(MemoryGeneratedPostStorage::new()),
            usage: usage.clone(),
            audit: audit.clone(),
            coordination: Arc::new(MemoryCoordination::new()),
            secrets: Arc::new(TestCodec),
            generator: generator.clone(),
            x_api: api.clone(),
            default_credentials: Some(default_test_credentials()),
            pacing: PacingPolicy::disabled(),
            clock: Arc::new(fixed_noon),
        };

        Self {
            services,
            api,
            generator,
            usage,
            audit,
            now,
        }
    }

    /// Connect a user on a permissive plan combination (PRO x PRO).
    pub async fn connect_user(&self, user_id: &str) {
        self.connect_user_with_plan(user_id, InternalPlan::Pro, XPaidTier::Pro)
            .await;
    }

    pub async fn connect_user_with_plan(&self, user_id: &str, plan: InternalPlan, tier: XPaidTier) {
        self.services
            .accounts
            .upsert_user(&User {
                id: user_id.to_string(),
                email: format!("{user_id}@xgrowth.app"),
                internal_plan: plan,
            })
            .await
            .unwrap();
        self.services
            .accounts
            .upsert_connection(&Connection {
                user_id: user_id.to_string(),
                x_user_id: format!("x-{user_id}"),
                handle: Some(user_id.to_string()),
                access_token_enc: TestCodec.encrypt("valid-access").unwrap(),
                refresh_token_enc: Some(TestCodec.encrypt("valid-refresh").unwrap()),
                token_expires_at: Some(Utc::now() + Duration::hours(2)),
                scope: None,
                x_paid_tier: tier,
            })
            .await
            .unwrap();
    }

    /// Connect a user whose token is inside the refresh margin.
    pub async fn connect_expired_user(&self, user_id: &str) {
        self.connect_user(user_id).await;
        self.services
            .accounts
            .update_connection_tokens(
                user_id,
                &TestCodec.encrypt("stale-access").unwrap(),
                None,
                Some(Utc::now() + Duration::seconds(10)),
                None,
            )
            .await
            .unwrap();
    }

    pub async fn insert_candidate(&self, user_id: &str, post: &SearchPost) {
        self.services
            .candidates
            .insert_candidate(&NewCandidate {
                user_id: user_id.to_string(),
                post_id: post.id.clone(),
                author_id: post.author_id.clone(),
                author_handle: post.author_handle.clone(),
                text: post.text.clone(),
                language: post.language.clone(),
                like_count: post.like_count,
                duplicate_fingerprint: fingerprint_text(&post.text),
            })
            .await
            .unwrap();
    }

    /// Record `count` usage events stamped earlier today, outside the
    /// harness clock's hourly window.
    pub async fn record_usage_outside_hour(&self, user_id: &str, action: UsageAction, count: usize) {
        let at = self.now - Duration::hours(2);
        for i in 0..count {
            let meta = match action {
                UsageAction::Reply => UsageMeta::Reply {
                    post_id: format!("seed-{i}"),
                },
                UsageAction::Like => UsageMeta::Like {
                    post_id: format!("seed-{i}"),
                },
                UsageAction::Follow => UsageMeta::Follow {
                    author_id: format!("seed-{i}"),
                },
                UsageAction::Tweet => UsageMeta::Tweet {
                    post_id: format!("seed-{i}"),
                    fingerprint: format!("fp-{i}"),
                },
                UsageAction::Discovery => UsageMeta::Discovery {
                    topic_id: format!("seed-{i}"),
                    keyword: "seed".to_string(),
                },
            };
            self.usage.record_at(user_id, action, meta, at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trips() {
        let codec = TestCodec;
        let enc = codec.encrypt("value").unwrap();
        assert_eq!(enc, "enc[value]");
        assert_eq!(codec.decrypt(&enc).unwrap(), "value");
        assert!(codec.decrypt("plaintext").is_err());
    }

    #[tokio::test]
    async fn mock_api_publish_indexes_count_failures() {
        let api = MockXApi::new();
        api.fail_publish_at(1, EngineError::NetworkBlocked);

        assert!(api.publish_post("t", "one", None).await.is_ok());
        assert!(api.publish_post("t", "two", None).await.is_err());
        assert!(api.publish_post("t", "three", None).await.is_ok());

        let published = api.published();
        assert_eq!(published.len(), 2);
        assert_eq!(api.post_id(1), "x-post-1");
    }

    #[tokio::test]
    async fn harness_connects_users_with_fresh_tokens() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        let connection = harness
            .services
            .accounts
            .get_connection("u1")
            .await
            .unwrap()
            .unwrap();
        assert!(connection.access_token_enc.starts_with("enc["));
        assert!(connection.token_expires_at.unwrap() > Utc::now());
    }
}

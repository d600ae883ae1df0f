//! OAuth plumbing for the X authorization server.
//!
//! Covers PKCE pair generation, the HMAC-signed `state` parameter, the
//! authorize-URL builder, client-id sanity checks for BYOA credentials, and
//! the ordered list of client-authentication strategies tried during token
//! refresh.

use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::constants::OAUTH_PENDING_TTL_SECS;
use crate::coordination::CoordinationCache;
use crate::errors::EngineError;
use crate::storage::cache::keys;
use crate::x::client::XApi;
use crate::x::types::TokenResponse;

type HmacSha256 = Hmac<Sha256>;

/// How long a signed state parameter stays valid.
const STATE_MAX_AGE_MS: i64 = 10 * 60 * 1000;

/// Resolved OAuth app credentials, either BYOA or process-wide defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct AppOAuthCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub callback_url: Option<String>,
}

/// One way of authenticating the client against the token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAuthStrategy {
    /// Public PKCE client: client id in the form body, no Authorization header.
    PublicClient { client_id: String },
    /// Confidential client: HTTP Basic keyed by the client id.
    BasicClientId {
        client_id: String,
        client_secret: String,
    },
    /// Confidential client: Basic keyed by the API key decoded out of the
    /// client id.
    BasicApiKey {
        api_key: String,
        client_secret: String,
    },
    /// Same as `BasicApiKey`, with the client id also sent as a form param.
    BasicApiKeyWithClientId {
        api_key: String,
        client_secret: String,
        client_id: String,
    },
}

impl ClientAuthStrategy {
    /// Short label used when aggregating per-strategy failures.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PublicClient { .. } => "public-client",
            Self::BasicClientId { .. } => "basic-client-id",
            Self::BasicApiKey { .. } => "basic-api-key",
            Self::BasicApiKeyWithClientId { .. } => "basic-api-key-with-client-id",
        }
    }
}

/// Trim surrounding whitespace and a leading '@' that users paste in from
/// profile handles.
pub fn normalize_client_id(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_string()
}

/// Format sanity check for a client id: length >= 10, no leading '@', no
/// internal whitespace.
pub fn is_likely_client_id(candidate: &str) -> bool {
    candidate.len() >= 10
        && !candidate.starts_with('@')
        && !candidate.chars().any(char::is_whitespace)
}

/// Some X client ids are a base64 wrapper around an `<api-key>:<suffix>`
/// value. When that holds, the decoded API key is usable as a Basic-auth
/// username against the token endpoint.
pub fn decode_api_key(client_id: &str) -> Option<String> {
    let decoded = STANDARD_NO_PAD
        .decode(client_id.trim_end_matches('=').as_bytes())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let api_key = text.split(':').next()?;
    if api_key.len() >= 10 && api_key.chars().all(|c| c.is_ascii_graphic()) {
        Some(api_key.to_string())
    } else {
        None
    }
}

/// Ordered strategies to try for a token refresh. Public PKCE first, then
/// increasingly specific confidential variants; confidential strategies are
/// only emitted when a client secret is configured.
pub fn refresh_strategies(creds: &AppOAuthCredentials) -> Vec<ClientAuthStrategy> {
    let mut strategies = vec![ClientAuthStrategy::PublicClient {
        client_id: creds.client_id.clone(),
    }];

    if let Some(secret) = &creds.client_secret {
        strategies.push(ClientAuthStrategy::BasicClientId {
            client_id: creds.client_id.clone(),
            client_secret: secret.clone(),
        });

        if let Some(api_key) = decode_api_key(&creds.client_id) {
            strategies.push(ClientAuthStrategy::BasicApiKey {
                api_key: api_key.clone(),
                client_secret: secret.clone(),
            });
            strategies.push(ClientAuthStrategy::BasicApiKeyWithClientId {
                api_key,
                client_secret: secret.clone(),
                client_id: creds.client_id.clone(),
            });
        }
    }

    strategies
}

/// PKCE verifier plus its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

pub fn create_pkce_pair() -> PkcePair {
    let mut verifier_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut verifier_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    PkcePair {
        verifier,
        challenge,
    }
}

fn sign_state(signing_key: &str, raw: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key length");
    mac.update(raw.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in mac.finalize().into_bytes() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Build a signed state parameter binding the authorization to a user id.
pub fn create_oauth_state(signing_key: &str, user_id: &str) -> String {
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = URL_SAFE_NO_PAD.encode(nonce_bytes);
    let raw = format!("{}.{}.{}", user_id, nonce, Utc::now().timestamp_millis());
    let signature = sign_state(signing_key, &raw);
    format!("{raw}.{signature}")
}

/// Verify a state parameter and return the bound user id. Rejects bad
/// signatures (constant-time compare) and states older than ten minutes.
pub fn verify_oauth_state(signing_key: &str, state: &str) -> Option<String> {
    let parts: Vec<&str> = state.split('.').collect();
    let [user_id, nonce, ts_raw, signature] = parts.as_slice() else {
        return None;
    };

    let raw = format!("{user_id}.{nonce}.{ts_raw}");
    let mut mac =
        HmacSha256::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key length");
    mac.update(raw.as_bytes());

    let mut expected = Vec::with_capacity(32);
    for chunk in signature.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        expected.push(u8::from_str_radix(pair, 16).ok()?);
    }
    mac.verify_slice(&expected).ok()?;

    let ts: i64 = ts_raw.parse().ok()?;
    if Utc::now().timestamp_millis() - ts > STATE_MAX_AGE_MS {
        return None;
    }
    Some(user_id.to_string())
}

/// Construct the user-facing authorize URL for the PKCE flow.
pub fn build_authorize_url(
    authorize_endpoint: &str,
    creds: &AppOAuthCredentials,
    scopes: &str,
    state: &str,
    code_challenge: &str,
) -> Option<String> {
    let callback_url = creds.callback_url.as_deref()?;
    let mut url = url::Url::parse(authorize_endpoint).ok()?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &creds.client_id)
        .append_pair("redirect_uri", callback_url)
        .append_pair("scope", scopes)
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256");
    Some(url.to_string())
}

/// A started authorization: the URL to send the user to, plus the state
/// that will come back on the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub authorize_url: String,
    pub state: String,
}

/// Begin the PKCE authorization flow for a user: generate the verifier and
/// signed state, park the verifier under the state key, and build the
/// authorize URL.
pub async fn begin_authorization(
    coordination: &dyn CoordinationCache,
    signing_key: &str,
    authorize_endpoint: &str,
    creds: &AppOAuthCredentials,
    scopes: &str,
    user_id: &str,
) -> Result<AuthorizationStart> {
    let pkce = create_pkce_pair();
    let state = create_oauth_state(signing_key, user_id);

    let authorize_url =
        build_authorize_url(authorize_endpoint, creds, scopes, &state, &pkce.challenge)
            .ok_or(EngineError::MissingAppCredentials)?;

    coordination
        .put_pending(
            &keys::oauth_pending_key(&state),
            &pkce.verifier,
            Duration::from_secs(OAUTH_PENDING_TTL_SECS),
        )
        .await?;

    Ok(AuthorizationStart {
        authorize_url,
        state,
    })
}

/// Complete the callback half of the flow: verify the state, consume the
/// parked verifier exactly once, and exchange the authorization code.
/// Returns the user id bound into the state along with the token response.
pub async fn complete_authorization(
    coordination: &dyn CoordinationCache,
    api: &dyn XApi,
    signing_key: &str,
    state: &str,
    code: &str,
    creds: &AppOAuthCredentials,
) -> Result<(String, TokenResponse)> {
    let user_id = verify_oauth_state(signing_key, state)
        .ok_or_else(|| anyhow!("OAuth state is invalid or expired"))?;

    let verifier = coordination
        .take_pending(&keys::oauth_pending_key(state))
        .await?
        .ok_or_else(|| anyhow!("No pending authorization for this state"))?;

    let token = api.exchange_code(code, &verifier, creds).await?;
    Ok((user_id, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_normalization_and_sanity() {
        assert_eq!(normalize_client_id("  @clientid1234 "), "clientid1234");
        assert!(is_likely_client_id("clientid1234"));
        assert!(!is_likely_client_id("short"));
        assert!(!is_likely_client_id("@clientid1234"));
        assert!(!is_likely_client_id("client id 1234"));
    }

    #[test]
    fn api_key_decoding() {
        // base64("myapikey12345:1:ci")
        let client_id = STANDARD_NO_PAD.encode("myapikey12345:1:ci");
        assert_eq!(decode_api_key(&client_id), Some("myapikey12345".to_string()));

        assert_eq!(decode_api_key("not base64!!!"), None);
        // Decodes but the prefix is too short to be an API key.
        assert_eq!(decode_api_key(&STANDARD_NO_PAD.encode("short:1:ci")), None);
    }

    #[test]
    fn strategy_list_shapes() {
        let public_only = refresh_strategies(&AppOAuthCredentials {
            client_id: "clientid1234".to_string(),
            client_secret: None,
            callback_url: None,
        });
        assert_eq!(public_only.len(), 1);
        assert_eq!(public_only[0].label(), "public-client");

        let confidential = refresh_strategies(&AppOAuthCredentials {
            client_id: "plainclientid".to_string(),
            client_secret: Some("secret".to_string()),
            callback_url: None,
        });
        assert_eq!(
            confidential.iter().map(|s| s.label()).collect::<Vec<_>>(),
            vec!["public-client", "basic-client-id"]
        );

        let decodable = refresh_strategies(&AppOAuthCredentials {
            client_id: STANDARD_NO_PAD.encode("myapikey12345:1:ci"),
            client_secret: Some("secret".to_string()),
            callback_url: None,
        });
        assert_eq!(
            decodable.iter().map(|s| s.label()).collect::<Vec<_>>(),
            vec![
                "public-client",
                "basic-client-id",
                "basic-api-key",
                "basic-api-key-with-client-id"
            ]
        );
    }

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let pair = create_pkce_pair();
        let mut hasher = Sha256::new();
        hasher.update(pair.verifier.as_bytes());
        assert_eq!(pair.challenge, URL_SAFE_NO_PAD.encode(hasher.finalize()));
        assert!(pair.verifier.len() >= 43);
    }

    #[test]
    fn state_round_trip_and_tamper_rejection() {
        let state = create_oauth_state("signing-key", "u1");
        assert_eq!(
            verify_oauth_state("signing-key", &state),
            Some("u1".to_string())
        );

        assert_eq!(verify_oauth_state("other-key", &state), None);
        let tampered = state.replacen("u1", "u2", 1);
        assert_eq!(verify_oauth_state("signing-key", &tampered), None);
        assert_eq!(verify_oauth_state("signing-key", "garbage"), None);
    }

    #[test]
    fn expired_state_is_rejected() {
        let stale_ts = Utc::now().timestamp_millis() - STATE_MAX_AGE_MS - 1000;
        let raw = format!("u1.nonce.{stale_ts}");
        let state = format!("{raw}.{}", sign_state("signing-key", &raw));
        assert_eq!(verify_oauth_state("signing-key", &state), None);
    }

    #[tokio::test]
    async fn authorization_flow_round_trips_and_consumes_state_once() {
        use crate::coordination::MemoryCoordination;
        use crate::test_helpers::MockXApi;

        let coordination = MemoryCoordination::new();
        let api = MockXApi::new();
        let creds = AppOAuthCredentials {
            client_id: "clientid1234".to_string(),
            client_secret: Some("secret".to_string()),
            callback_url: Some("https://app.example.com/callback".to_string()),
        };

        let start = begin_authorization(
            &coordination,
            "signing-key",
            "https://x.com/i/oauth2/authorize",
            &creds,
            "tweet.read tweet.write",
            "u1",
        )
        .await
        .unwrap();
        assert!(start.authorize_url.contains("code_challenge="));

        let (user_id, token) = complete_authorization(
            &coordination,
            &api,
            "signing-key",
            &start.state,
            "auth-code",
            &creds,
        )
        .await
        .unwrap();
        assert_eq!(user_id, "u1");
        assert_eq!(token.access_token, "exchanged-access");

        // The verifier is consumed; replaying the callback fails.
        let replay = complete_authorization(
            &coordination,
            &api,
            "signing-key",
            &start.state,
            "auth-code",
            &creds,
        )
        .await;
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn completion_rejects_foreign_state() {
        use crate::coordination::MemoryCoordination;
        use crate::test_helpers::MockXApi;

        let coordination = MemoryCoordination::new();
        let api = MockXApi::new();
        let creds = AppOAuthCredentials {
            client_id: "clientid1234".to_string(),
            client_secret: None,
            callback_url: Some("https://app.example.com/callback".to_string()),
        };

        let result = complete_authorization(
            &coordination,
            &api,
            "signing-key",
            "forged.state.0.deadbeef",
            "auth-code",
            &creds,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn authorize_url_contains_pkce_params() {
        let creds = AppOAuthCredentials {
            client_id: "clientid1234".to_string(),
            client_secret: None,
            callback_url: Some("https://app.example.com/callback".to_string()),
        };
        let url = build_authorize_url(
            "https://x.com/i/oauth2/authorize",
            &creds,
            "tweet.read tweet.write",
            "state123",
            "challenge456",
        )
        .unwrap();
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=clientid1234"));
        assert!(url.contains("code_challenge=challenge456"));
        assert!(url.contains("code_challenge_method=S256"));

        let missing_callback = AppOAuthCredentials {
            callback_url: None,
            ..creds
        };
        assert!(
            build_authorize_url(
                "https://x.com/i/oauth2/authorize",
                &missing_callback,
                "tweet.read",
                "s",
                "c"
            )
            .is_none()
        );
    }
}

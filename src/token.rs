//! Client-credentials bearer token for the ICD API, refreshed on expiry.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{BridgeError, Result};

/// Tokens are treated as expired this long before the server says they are.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: String,
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TokenManager {
    client: Client,
    config: IdentityConfig,
    credential: Mutex<Option<Credential>>,
}

impl TokenManager {
    pub fn new(client: Client, config: IdentityConfig) -> Self {
        Self {
            client,
            config,
            credential: Mutex::new(None),
        }
    }

    /// Returns a bearer token that is valid now, exchanging credentials first
    /// when there is none or it has expired.
    ///
    /// The check and the refresh run under one lock, so concurrent callers
    /// that find the token expired trigger a single exchange.
    pub async fn ensure_valid(&self) -> Result<String> {
        let mut slot = self.credential.lock().await;
        if let Some(cred) = slot.as_ref() {
            if cred.is_valid(Instant::now()) {
                return Ok(cred.token.clone());
            }
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }

    async fn exchange(&self) -> Result<Credential> {
        let credential_error = |reason: String| BridgeError::Credential { reason };

        tracing::info!("Requesting ICD API token from {}", self.config.token_url);
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| credential_error(format!("token request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| credential_error(format!("read token body failed: {e}")))?;
        if status != reqwest::StatusCode::OK {
            return Err(credential_error(format!(
                "bad token response {}: {}",
                status,
                crate::error::truncate_for_log(&body)
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| credential_error(format!("decode token failed: {e}")))?;

        tracing::debug!(
            "Received {} token valid for {}s",
            parsed.token_type,
            parsed.expires_in
        );
        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_SKEW);
        Ok(Credential {
            token: parsed.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Form, Json, Router};

    use super::*;
    use crate::testutil;

    #[derive(Clone)]
    struct Identity {
        calls: Arc<AtomicUsize>,
        expires_in: u64,
        /// Lifetime granted from the second exchange on.
        renewed_expires_in: u64,
        fail_after: Option<usize>,
    }

    async fn token_endpoint(
        State(st): State<Identity>,
        Form(form): Form<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let n = st.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if st.fail_after.is_some_and(|limit| n > limit) {
            return (StatusCode::UNAUTHORIZED, "invalid_client").into_response();
        }
        assert_eq!(form.get("grant_type").map(String::as_str), Some("client_credentials"));
        assert_eq!(form.get("scope").map(String::as_str), Some("icdapi_access"));
        // Give concurrent callers time to pile up behind the lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Json(serde_json::json!({
            "access_token": format!("token-{n}"),
            "expires_in": if n == 1 { st.expires_in } else { st.renewed_expires_in },
            "token_type": "Bearer",
        }))
        .into_response()
    }

    async fn manager(
        expires_in: u64,
        fail_after: Option<usize>,
    ) -> (TokenManager, Arc<AtomicUsize>) {
        renewing_manager(expires_in, expires_in, fail_after).await
    }

    async fn renewing_manager(
        expires_in: u64,
        renewed_expires_in: u64,
        fail_after: Option<usize>,
    ) -> (TokenManager, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/connect/token", post(token_endpoint))
            .with_state(Identity {
                calls: Arc::clone(&calls),
                expires_in,
                renewed_expires_in,
                fail_after,
            });
        let base = testutil::serve(router).await;
        let config = IdentityConfig {
            token_url: format!("{base}/connect/token"),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scope: "icdapi_access".to_string(),
        };
        (TokenManager::new(Client::new(), config), calls)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let (mgr, calls) = manager(3600, None).await;
        let (a, b) = tokio::join!(mgr.ensure_valid(), mgr.ensure_valid());
        assert_eq!(a.unwrap(), "token-1");
        assert_eq!(b.unwrap(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.ensure_valid().await.unwrap(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh_of_an_expired_token() {
        // The first token's lifetime is inside the skew, so it is expired on arrival.
        let (mgr, calls) = renewing_manager(30, 3600, None).await;
        assert_eq!(mgr.ensure_valid().await.unwrap(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (a, b) = tokio::join!(mgr.ensure_valid(), mgr.ensure_valid());
        assert_eq!(a.unwrap(), "token-2");
        assert_eq!(b.unwrap(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lifetime_inside_skew_forces_refresh() {
        let (mgr, calls) = manager(30, None).await;
        assert_eq!(mgr.ensure_valid().await.unwrap(), "token-1");
        assert_eq!(mgr.ensure_valid().await.unwrap(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_exchange_is_a_credential_error() {
        let (mgr, _calls) = manager(30, Some(1)).await;
        mgr.ensure_valid().await.unwrap();

        let err = mgr.ensure_valid().await.unwrap_err();
        match err {
            BridgeError::Credential { reason } => assert!(reason.contains("401"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
        // Prior credential is left as it was.
        assert_eq!(
            mgr.credential.lock().await.as_ref().map(|c| c.token.clone()),
            Some("token-1".to_string())
        );
    }
}

//! Credential lifecycle: authorization, refresh and status.
//!
//! A [`TokenManager`] owns exactly one [`Credential`] and is the only place
//! that mutates it. Callers hold an `Arc<TokenManager>` and ask it for an
//! [`AccessToken`] right before each remote call.
//!
//! ```text
//! draft --request_authorization--> pending --complete_authorization--> authorized
//! authorized --token stale--> expired --refresh ok--> authorized
//! any refresh failure --> error (until re-authorized)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use cloudshelf_common::types::chrono_duration;
use cloudshelf_common::{
    AccessToken, BackoffExecutor, Credential, CredentialState, Error, RemoteResult, Result,
};

use crate::store::{AccountInfo, RemoteStore};

/// Tokens returned by an authorization code exchange or a refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent on most refresh responses; the old refresh token stays valid.
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

/// OAuth2 server operations needed by the lifecycle.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// URL the user visits to grant access. `nonce` comes back as `state`.
    fn authorization_url(
        &self,
        credential: &Credential,
        redirect_uri: &str,
        nonce: &str,
    ) -> Result<String>;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(
        &self,
        credential: &Credential,
        code: &str,
        redirect_uri: &str,
    ) -> RemoteResult<TokenGrant>;

    /// Obtain a new access token.
    ///
    /// # Errors
    /// - `Unauthorized` when the refresh token was revoked (`invalid_grant`)
    async fn refresh(
        &self,
        credential: &Credential,
        refresh_token: &str,
    ) -> RemoteResult<TokenGrant>;
}

/// Persists a credential after every state change.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, credential: &Credential) -> Result<()>;
}

/// Read-only view returned by [`TokenManager::check_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub state: CredentialState,
    /// Seconds until the access token expires; negative once it has.
    pub remaining_seconds: i64,
}

/// Owns one credential's state machine.
pub struct TokenManager {
    name: String,
    credential: RwLock<Credential>,
    /// Serializes refreshes so concurrent callers trigger only one.
    refresh_gate: Mutex<()>,
    endpoint: Arc<dyn TokenEndpoint>,
    backoff: BackoffExecutor,
    store: Option<Arc<dyn CredentialStore>>,
}

impl TokenManager {
    /// Create a manager for `credential`.
    pub fn new(
        credential: Credential,
        endpoint: Arc<dyn TokenEndpoint>,
        backoff: BackoffExecutor,
    ) -> Self {
        Self {
            name: credential.name.clone(),
            credential: RwLock::new(credential),
            refresh_gate: Mutex::new(()),
            endpoint,
            backoff,
            store: None,
        }
    }

    /// Persist the credential through `store` after every change.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Name of the managed credential.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the current credential.
    pub async fn snapshot(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Start the authorization flow.
    ///
    /// # Postconditions
    /// - `state == pending`, a fresh one-time nonce is bound to the credential
    /// - Returns the authorization URL and the nonce
    ///
    /// # Errors
    /// - `Validation` if client id or secret is missing, or the redirect URI
    ///   is not an absolute URL
    pub async fn request_authorization(&self, redirect_uri: &str) -> Result<(String, String)> {
        Url::parse(redirect_uri).map_err(|e| {
            Error::Validation(format!("Invalid redirect URI {}: {}", redirect_uri, e))
        })?;

        let (credential, url, nonce) = {
            let mut credential = self.credential.write().await;
            if !credential.has_client_registration() {
                return Err(Error::Validation(format!(
                    "Credential {} needs a client id and secret",
                    self.name
                )));
            }

            let nonce = Uuid::new_v4().simple().to_string();
            let url = self.endpoint.authorization_url(&credential, redirect_uri, &nonce)?;

            credential.pending_nonce = Some(nonce.clone());
            credential.redirect_uri = Some(redirect_uri.to_string());
            credential.state = CredentialState::Pending;
            (credential.clone(), url, nonce)
        };

        self.persist(&credential).await;
        info!("Authorization requested for credential {}", self.name);
        Ok((url, nonce))
    }

    /// Finish the authorization flow with the callback's code and state.
    ///
    /// # Preconditions
    /// - [`request_authorization`](Self::request_authorization) issued `nonce`
    ///
    /// # Postconditions
    /// - `state == authorized`, tokens stored, nonce consumed
    ///
    /// # Errors
    /// - `Auth` if the nonce does not match the one issued
    /// - `Auth` / `PermanentRemote` / `TransientNetwork` if the exchange fails;
    ///   the credential moves to `error`
    pub async fn complete_authorization(&self, code: &str, nonce: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(Error::Validation("Authorization code is empty".to_string()));
        }

        let (credential, redirect_uri) = {
            let credential = self.credential.read().await;
            if !nonce_matches(credential.pending_nonce.as_deref(), nonce) {
                warn!("Authorization state mismatch for credential {}", self.name);
                return Err(Error::Auth("Authorization state mismatch".to_string()));
            }
            let redirect_uri = credential.redirect_uri.clone().unwrap_or_default();
            (credential.clone(), redirect_uri)
        };

        let result = self
            .backoff
            .execute("token exchange", || {
                self.endpoint.exchange_code(&credential, code, &redirect_uri)
            })
            .await;

        let (credential, outcome) = {
            let mut current = self.credential.write().await;
            if !nonce_matches(current.pending_nonce.as_deref(), nonce) {
                return Err(Error::Auth(
                    "Authorization state was consumed concurrently".to_string(),
                ));
            }
            current.pending_nonce = None;
            current.redirect_uri = None;

            let outcome = match result {
                Ok(grant) => {
                    let refresh_token = grant
                        .refresh_token
                        .clone()
                        .or_else(|| current.refresh_token.clone());
                    match refresh_token {
                        Some(refresh_token) => {
                            current.access_token = Some(grant.access_token.clone());
                            current.refresh_token = Some(refresh_token);
                            current.token_expiry =
                                Some(Utc::now() + chrono_duration(grant.expires_in));
                            current.state = CredentialState::Authorized;
                            Ok(())
                        }
                        None => {
                            current.state = CredentialState::Error;
                            Err(Error::Auth(
                                "No refresh token received. Offline access must be granted."
                                    .to_string(),
                            ))
                        }
                    }
                }
                Err(err) => {
                    current.state = CredentialState::Error;
                    Err(err)
                }
            };
            (current.clone(), outcome)
        };

        self.persist(&credential).await;
        match &outcome {
            Ok(()) => info!("Credential {} authorized", self.name),
            Err(err) => error!("Authorization of credential {} failed: {}", self.name, err),
        }
        outcome
    }

    /// Get a usable access token, refreshing when less than five minutes remain.
    ///
    /// Concurrent callers on a stale credential cause exactly one refresh.
    ///
    /// # Errors
    /// - `Auth` if the credential is not authorized, needs re-authorization,
    ///   or its refresh token was revoked
    /// - `TransientNetwork` if refreshing kept failing; the credential moves
    ///   to `error`
    pub async fn ensure_valid_token(&self) -> Result<AccessToken> {
        if let Some(token) = self.usable_token().await? {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.usable_token().await? {
            return Ok(token);
        }

        self.refresh_locked().await
    }

    /// Refresh the access token even if it is still fresh.
    ///
    /// # Errors
    /// - same as [`ensure_valid_token`](Self::ensure_valid_token)
    pub async fn force_refresh(&self) -> Result<AccessToken> {
        let _gate = self.refresh_gate.lock().await;
        self.ensure_refreshable().await?;
        self.refresh_locked().await
    }

    /// Current state and remaining token lifetime. Never mutates.
    ///
    /// An authorized credential whose token is stale reports `expired`.
    pub async fn check_status(&self) -> TokenStatus {
        let credential = self.credential.read().await;
        let now = Utc::now();
        let state = match credential.state {
            CredentialState::Authorized if !credential.token_is_fresh(now) => {
                CredentialState::Expired
            }
            state => state,
        };
        TokenStatus {
            state,
            remaining_seconds: credential.remaining_seconds(now),
        }
    }

    /// Verify the credential works by asking the remote for the account identity.
    pub async fn test_connection(&self, remote: &dyn RemoteStore) -> Result<AccountInfo> {
        let token = self.ensure_valid_token().await?;
        self.backoff
            .execute("account lookup", || remote.account(&token))
            .await
    }

    async fn usable_token(&self) -> Result<Option<AccessToken>> {
        let credential = self.credential.read().await;
        match credential.state {
            CredentialState::Error => Err(Error::Auth(format!(
                "Credential {} must be re-authorized",
                self.name
            ))),
            CredentialState::Draft | CredentialState::Pending => Err(Error::Auth(format!(
                "Credential {} is not authorized",
                self.name
            ))),
            CredentialState::Authorized | CredentialState::Expired => {
                if credential.token_is_fresh(Utc::now()) {
                    Ok(credential.access_token.clone().map(AccessToken::new))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn ensure_refreshable(&self) -> Result<()> {
        match self.credential.read().await.state {
            CredentialState::Authorized | CredentialState::Expired => Ok(()),
            state => Err(Error::Auth(format!(
                "Credential {} cannot be refreshed in state {}",
                self.name, state
            ))),
        }
    }

    /// Refresh the token. Caller holds `refresh_gate`.
    async fn refresh_locked(&self) -> Result<AccessToken> {
        let (credential, refresh_token) = {
            let mut credential = self.credential.write().await;
            match credential.refresh_token.clone() {
                Some(refresh_token) => {
                    credential.state = CredentialState::Expired;
                    (credential.clone(), refresh_token)
                }
                None => {
                    credential.state = CredentialState::Error;
                    let snapshot = credential.clone();
                    drop(credential);
                    self.persist(&snapshot).await;
                    error!("Credential {} has no refresh token", self.name);
                    return Err(Error::Auth(format!(
                        "Credential {} has no refresh token",
                        self.name
                    )));
                }
            }
        };

        info!("Refreshing access token for credential {}", self.name);
        let result = self
            .backoff
            .execute("token refresh", || self.endpoint.refresh(&credential, &refresh_token))
            .await;

        let (snapshot, outcome) = {
            let mut current = self.credential.write().await;
            let outcome = match result {
                Ok(grant) => {
                    let token = AccessToken::new(grant.access_token.clone());
                    current.access_token = Some(grant.access_token);
                    if let Some(rotated) = grant.refresh_token {
                        current.refresh_token = Some(rotated);
                    }
                    current.token_expiry = Some(Utc::now() + chrono_duration(grant.expires_in));
                    current.state = CredentialState::Authorized;
                    Ok(token)
                }
                Err(Error::Auth(message)) => {
                    current.state = CredentialState::Error;
                    Err(Error::Auth(format!("Refresh token rejected: {}", message)))
                }
                Err(err) => {
                    current.state = CredentialState::Error;
                    Err(err)
                }
            };
            (current.clone(), outcome)
        };

        self.persist(&snapshot).await;
        if let Err(err) = &outcome {
            error!("Token refresh for credential {} failed: {}", self.name, err);
        }
        outcome
    }

    async fn persist(&self, credential: &Credential) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(credential).await {
                warn!("Failed to persist credential {}: {}", self.name, err);
            }
        }
    }
}

fn nonce_matches(expected: Option<&str>, presented: &str) -> bool {
    match expected {
        Some(expected) => bool::from(expected.as_bytes().ct_eq(presented.as_bytes())),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, MemoryTokenEndpoint};
    use chrono::Duration as ChronoDuration;
    use cloudshelf_common::{BackoffConfig, RemoteError};
    use std::sync::Mutex as StdMutex;

    fn fast_backoff() -> BackoffExecutor {
        BackoffExecutor::new(
            BackoffConfig::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        )
    }

    fn authorized(expires_in: ChronoDuration) -> Credential {
        let mut credential = Credential::new("main", "client", "secret");
        credential.state = CredentialState::Authorized;
        credential.access_token = Some("old-access".to_string());
        credential.refresh_token = Some("refresh".to_string());
        credential.token_expiry = Some(Utc::now() + expires_in);
        credential
    }

    fn manager(credential: Credential, endpoint: Arc<MemoryTokenEndpoint>) -> TokenManager {
        TokenManager::new(credential, endpoint, fast_backoff())
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: StdMutex<Vec<CredentialState>>,
    }

    #[async_trait]
    impl CredentialStore for RecordingStore {
        async fn save(&self, credential: &Credential) -> Result<()> {
            self.saved.lock().unwrap().push(credential.state);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_authorization_flow() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let store = Arc::new(RecordingStore::default());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint.clone())
            .with_store(store.clone());

        let (url, nonce) = manager
            .request_authorization("http://localhost:8080/oauth/callback")
            .await
            .unwrap();
        assert!(url.contains(&nonce));
        assert_eq!(manager.check_status().await.state, CredentialState::Pending);

        manager.complete_authorization("good-code", &nonce).await.unwrap();

        let status = manager.check_status().await;
        assert_eq!(status.state, CredentialState::Authorized);
        assert!(status.remaining_seconds > 55 * 60);
        assert!(manager.snapshot().await.pending_nonce.is_none());
        assert_eq!(
            *store.saved.lock().unwrap(),
            vec![CredentialState::Pending, CredentialState::Authorized]
        );
    }

    #[tokio::test]
    async fn test_request_authorization_requires_client_registration() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", ""), endpoint);

        let result = manager.request_authorization("http://localhost/cb").await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(manager.check_status().await.state, CredentialState::Draft);
    }

    #[tokio::test]
    async fn test_request_authorization_rejects_bad_redirect() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint);

        let result = manager.request_authorization("localhost callback").await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_nonce_mismatch_is_auth_error() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint.clone());

        manager.request_authorization("http://localhost/cb").await.unwrap();
        let result = manager.complete_authorization("good-code", "forged").await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(endpoint.exchange_count(), 0);
        assert_eq!(manager.check_status().await.state, CredentialState::Pending);
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint);

        let (_, nonce) = manager.request_authorization("http://localhost/cb").await.unwrap();
        manager.complete_authorization("good-code", &nonce).await.unwrap();

        let replay = manager.complete_authorization("good-code", &nonce).await;
        assert!(matches!(replay, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_rejected_code_moves_to_error() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint);

        let (_, nonce) = manager.request_authorization("http://localhost/cb").await.unwrap();
        let result = manager.complete_authorization("bad-code", &nonce).await;

        assert!(result.is_err());
        assert_eq!(manager.check_status().await.state, CredentialState::Error);
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_without_refresh() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(authorized(ChronoDuration::minutes(30)), endpoint.clone());

        let token = manager.ensure_valid_token().await.unwrap();
        assert_eq!(token.secret(), "old-access");
        assert_eq!(endpoint.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_near_expiry_token_is_refreshed() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(authorized(ChronoDuration::minutes(2)), endpoint.clone());

        let token = manager.ensure_valid_token().await.unwrap();

        assert_ne!(token.secret(), "old-access");
        assert_eq!(endpoint.refresh_count(), 1);
        let expiry = manager.snapshot().await.token_expiry.unwrap();
        assert!(expiry > Utc::now() + ChronoDuration::minutes(55));
        assert_eq!(manager.check_status().await.state, CredentialState::Authorized);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new().with_latency(Duration::from_millis(20)));
        let manager = Arc::new(manager(authorized(ChronoDuration::seconds(-10)), endpoint.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.ensure_valid_token().await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(endpoint.refresh_count(), 1);
        assert!(tokens.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_moves_to_error() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        endpoint.revoke();
        let manager = manager(authorized(ChronoDuration::minutes(1)), endpoint.clone());

        let result = manager.ensure_valid_token().await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(endpoint.refresh_count(), 1);
        assert_eq!(manager.check_status().await.state, CredentialState::Error);

        // Terminal: no further refresh attempts.
        assert!(matches!(manager.ensure_valid_token().await, Err(Error::Auth(_))));
        assert_eq!(endpoint.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_moves_to_error() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let mut credential = authorized(ChronoDuration::minutes(1));
        credential.refresh_token = None;
        let manager = manager(credential, endpoint.clone());

        assert!(matches!(manager.ensure_valid_token().await, Err(Error::Auth(_))));
        assert_eq!(endpoint.refresh_count(), 0);
        assert_eq!(manager.check_status().await.state, CredentialState::Error);
    }

    #[tokio::test]
    async fn test_transient_refresh_failures_are_retried() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        endpoint.fail_next_refreshes(2, RemoteError::server("503"));
        let manager = manager(authorized(ChronoDuration::minutes(1)), endpoint.clone());

        manager.ensure_valid_token().await.unwrap();
        assert_eq!(endpoint.refresh_count(), 3);
    }

    #[tokio::test]
    async fn test_refresh_exhaustion_moves_to_error() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        endpoint.fail_next_refreshes(10, RemoteError::network("unreachable"));
        let manager = manager(authorized(ChronoDuration::minutes(1)), endpoint.clone());

        let result = manager.ensure_valid_token().await;
        assert!(matches!(result, Err(Error::TransientNetwork(_))));
        assert_eq!(manager.check_status().await.state, CredentialState::Error);
    }

    #[tokio::test]
    async fn test_draft_credential_is_not_usable() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(Credential::new("main", "client", "secret"), endpoint.clone());

        assert!(matches!(manager.ensure_valid_token().await, Err(Error::Auth(_))));
        assert!(matches!(manager.force_refresh().await, Err(Error::Auth(_))));
        assert_eq!(endpoint.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_check_status_reports_stale_token_without_mutating() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(authorized(ChronoDuration::minutes(2)), endpoint.clone());

        let status = manager.check_status().await;
        assert_eq!(status.state, CredentialState::Expired);
        assert!(status.remaining_seconds <= 120);
        assert_eq!(manager.snapshot().await.state, CredentialState::Authorized);
        assert_eq!(endpoint.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_refreshes_fresh_token() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(authorized(ChronoDuration::minutes(50)), endpoint.clone());

        let token = manager.force_refresh().await.unwrap();
        assert_ne!(token.secret(), "old-access");
        assert_eq!(endpoint.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_reports_account() {
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let manager = manager(authorized(ChronoDuration::minutes(50)), endpoint);
        let remote = MemoryRemote::new();

        let account = manager.test_connection(&remote).await.unwrap();
        assert_eq!(account.email.as_deref(), Some("memory@example.com"));
    }
}

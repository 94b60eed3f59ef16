//! OAuth2 token endpoint for Google accounts.

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, StandardErrorResponse, TokenResponse,
    TokenUrl,
};
use std::time::Duration;

use cloudshelf_common::{Credential, Error, RemoteError, RemoteResult, Result};

use crate::token::{TokenEndpoint, TokenGrant};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Full Drive access; files created by other clients must stay readable.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Token endpoint talking to Google's OAuth2 server.
pub struct GoogleOAuth {
    http: oauth2::reqwest::Client,
    scope: String,
}

impl GoogleOAuth {
    /// Create an endpoint requesting full Drive access.
    ///
    /// # Errors
    /// - `Validation` if the HTTP client cannot be built
    pub fn new() -> Result<Self> {
        // Redirects are disabled to avoid SSRF through the token endpoint.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Validation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            scope: DRIVE_SCOPE.to_string(),
        })
    }

    /// Request a different scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    fn client(
        &self,
        credential: &Credential,
        redirect_uri: Option<&str>,
    ) -> Result<ConfiguredClient> {
        let mut client = BasicClient::new(ClientId::new(credential.client_id.clone()))
            .set_client_secret(ClientSecret::new(credential.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(GOOGLE_AUTH_URL.to_string())
                    .map_err(|e| Error::Validation(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
                    .map_err(|e| Error::Validation(format!("Invalid token URL: {}", e)))?,
            );

        if let Some(uri) = redirect_uri {
            client = client.set_redirect_uri(
                RedirectUrl::new(uri.to_string())
                    .map_err(|e| Error::Validation(format!("Invalid redirect URL: {}", e)))?,
            );
        }

        Ok(client)
    }
}

fn grant_from<T: TokenResponse>(token: &T) -> TokenGrant {
    TokenGrant {
        access_token: token.access_token().secret().clone(),
        refresh_token: token.refresh_token().map(|t| t.secret().clone()),
        expires_in: token.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
    }
}

/// Map a token endpoint failure onto the retry classification.
fn classify<RE>(
    err: RequestTokenError<RE, StandardErrorResponse<BasicErrorResponseType>>,
) -> RemoteError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => match response.error() {
            BasicErrorResponseType::InvalidGrant
            | BasicErrorResponseType::InvalidClient
            | BasicErrorResponseType::UnauthorizedClient => {
                RemoteError::unauthorized(response.to_string())
            }
            _ => RemoteError::rejected(response.to_string()),
        },
        RequestTokenError::Request(e) => RemoteError::network(e.to_string()),
        // Google answers outages with HTML bodies that fail to parse.
        RequestTokenError::Parse(e, _) => {
            RemoteError::server(format!("Unparseable token response: {}", e))
        }
        RequestTokenError::Other(message) => RemoteError::rejected(message),
    }
}

#[async_trait]
impl TokenEndpoint for GoogleOAuth {
    fn authorization_url(
        &self,
        credential: &Credential,
        redirect_uri: &str,
        nonce: &str,
    ) -> Result<String> {
        let client = self.client(credential, Some(redirect_uri))?;
        let nonce = nonce.to_string();
        let (url, _) = client
            .authorize_url(move || CsrfToken::new(nonce))
            .add_scope(Scope::new(self.scope.clone()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        credential: &Credential,
        code: &str,
        redirect_uri: &str,
    ) -> RemoteResult<TokenGrant> {
        let client = self
            .client(credential, Some(redirect_uri))
            .map_err(|e| RemoteError::rejected(e.to_string()))?;

        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(classify)?;

        Ok(grant_from(&token))
    }

    async fn refresh(
        &self,
        credential: &Credential,
        refresh_token: &str,
    ) -> RemoteResult<TokenGrant> {
        let client = self
            .client(credential, None)
            .map_err(|e| RemoteError::rejected(e.to_string()))?;

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(classify)?;

        Ok(grant_from(&token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url_generation() {
        let endpoint = GoogleOAuth::new().unwrap();
        let credential = Credential::new("main", "test_id", "test_secret");

        let url = endpoint
            .authorization_url(&credential, "http://localhost:8080/oauth/callback", "nonce-123")
            .unwrap();

        assert!(url.contains("accounts.google.com"));
        assert!(url.contains("client_id=test_id"));
        assert!(url.contains("state=nonce-123"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("scope="));
    }

    #[test]
    fn test_invalid_redirect_is_rejected() {
        let endpoint = GoogleOAuth::new().unwrap();
        let credential = Credential::new("main", "test_id", "test_secret");

        let result = endpoint.authorization_url(&credential, "not a url", "nonce");
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}

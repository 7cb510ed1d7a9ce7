use std::time::{Duration, Instant};

use log::debug;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthType, AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use tokio::sync::Mutex;

use crate::CloudError;

/// Tokens closer than this to expiry are renewed before use.
const RENEW_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Used when the token endpoint does not say how long a token lives.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// OAuth endpoints and the client registration used to refresh tokens.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

struct CachedToken {
    secret: String,
    expires_at: Instant,
}

/// Hands out access tokens obtained from a long-lived refresh token.
///
/// The cache sits behind an async mutex held for the whole exchange, so
/// callers arriving while a refresh is in flight wait for it and reuse its
/// result instead of starting their own.
pub struct TokenSource {
    client: BasicClient,
    refresh_token: RefreshToken,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(config: OAuthConfig, refresh_token: impl Into<String>) -> Result<Self, CloudError> {
        let auth_url = AuthUrl::new(config.auth_url).map_err(|e| CloudError::Auth(e.to_string()))?;
        let token_url = TokenUrl::new(config.token_url).map_err(|e| CloudError::Auth(e.to_string()))?;

        let client = BasicClient::new(
            ClientId::new(config.client_id),
            config.client_secret.map(ClientSecret::new),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody);

        Ok(Self {
            client,
            refresh_token: RefreshToken::new(refresh_token.into()),
            cached: Mutex::new(None),
        })
    }

    pub async fn access_token(&self) -> Result<String, CloudError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + RENEW_MARGIN {
                return Ok(token.secret.clone());
            }
        }

        debug!("Refreshing access token");
        let response = self
            .client
            .exchange_refresh_token(&self.refresh_token)
            .request_async(async_http_client)
            .await
            .map_err(|e| CloudError::Auth(e.to_string()))?;

        let lifetime = response.expires_in().unwrap_or(DEFAULT_LIFETIME);
        let secret = response.access_token().secret().clone();
        *cached = Some(CachedToken {
            secret: secret.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(secret)
    }

    /// Drops the cached token so the next call exchanges again.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

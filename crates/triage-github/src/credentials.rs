//! App credentials: a short-lived signed app assertion is exchanged for an
//! installation token, which is cached until shortly before it expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{build_http_client, ACCEPT_HEADER, USER_AGENT};
use crate::error::AuthError;

/// A cached token is reused only while it stays valid for longer than this.
pub const SAFETY_MARGIN_SECS: i64 = 60;

/// Source of bearer tokens for outbound tracker calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Installation token together with its absolute expiry.
pub struct InstallationToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl InstallationToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(SAFETY_MARGIN_SECS) < self.expires_at
    }
}

impl std::fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Performs one exchange of app credentials for a fresh installation token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<InstallationToken, AuthError>;
}

type Refresh = Shared<BoxFuture<'static, Result<Arc<InstallationToken>, AuthError>>>;

#[derive(Default)]
struct CacheState {
    current: Option<Arc<InstallationToken>>,
    in_flight: Option<(u64, Refresh)>,
    generation: u64,
}

/// Caches the installation token and refreshes it at most once at a time.
///
/// Callers arriving while a refresh is running await that same refresh and
/// all receive its outcome, token or error. The lock is never held across
/// the exchange itself.
pub struct CredentialCache {
    exchange: Arc<dyn TokenExchange>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl CredentialCache {
    pub fn new(exchange: Arc<dyn TokenExchange>) -> Self {
        Self::with_clock(exchange, Arc::new(SystemClock))
    }

    pub fn with_clock(exchange: Arc<dyn TokenExchange>, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchange,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn get_token(&self) -> Result<String, AuthError> {
        let (generation, refresh) = {
            let mut state = self.state.lock().await;

            if let Some(current) = state.current.as_ref() {
                if current.is_usable_at(self.clock.now()) {
                    debug!("Using cached installation token");
                    return Ok(current.token.expose_secret().to_string());
                }
            }

            if let Some(joined) = state.in_flight.clone() {
                debug!("Joining in-flight installation token refresh");
                joined
            } else {
                state.generation += 1;
                let generation = state.generation;
                let refresh = exchange_fresh_token(self.exchange.clone(), self.clock.clone())
                    .boxed()
                    .shared();
                state.in_flight = Some((generation, refresh.clone()));
                (generation, refresh)
            }
        };

        let outcome = refresh.await;

        let mut state = self.state.lock().await;
        if matches!(&state.in_flight, Some((current, _)) if *current == generation) {
            state.in_flight = None;
            if let Ok(fresh) = &outcome {
                state.current = Some(fresh.clone());
            }
        }
        drop(state);

        outcome.map(|fresh| fresh.token.expose_secret().to_string())
    }
}

async fn exchange_fresh_token(
    exchange: Arc<dyn TokenExchange>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<InstallationToken>, AuthError> {
    info!("Generating new installation token");
    let fresh = exchange.exchange().await.inspect_err(|err| {
        warn!(error = %err, "installation token exchange failed");
    })?;

    if !fresh.is_usable_at(clock.now()) {
        return Err(AuthError::credential(format!(
            "token expiring at {} is inside the refresh margin",
            fresh.expires_at
        )));
    }
    Ok(Arc::new(fresh))
}

#[async_trait]
impl TokenSource for CredentialCache {
    async fn token(&self) -> Result<String, AuthError> {
        self.get_token().await
    }
}

/// Identity of the tracker app and its installation.
pub struct AppCredentials {
    pub app_id: String,
    pub installation_id: String,
    pub private_key: SecretString,
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges an RS256 app assertion at
/// `POST {api}/app/installations/{installation_id}/access_tokens`.
pub struct GithubAppTokenExchange {
    http: reqwest::Client,
    api_base: String,
    credentials: AppCredentials,
    clock: Arc<dyn Clock>,
}

impl GithubAppTokenExchange {
    pub fn new(api_base: impl Into<String>, credentials: AppCredentials) -> Result<Self, AuthError> {
        let http = build_http_client()
            .map_err(|err| AuthError::credential(format!("http client: {err}")))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            credentials,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Signed app assertion valid from one minute ago for ten minutes.
    pub fn app_assertion(&self) -> Result<String, AuthError> {
        let now = self.clock.now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.credentials.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.expose_secret().as_bytes())
            .map_err(|err| AuthError::credential(format!("invalid private key: {err}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| AuthError::credential(format!("signing failed: {err}")))
    }
}

#[async_trait]
impl TokenExchange for GithubAppTokenExchange {
    async fn exchange(&self) -> Result<InstallationToken, AuthError> {
        let assertion = self.app_assertion()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.credentials.installation_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(assertion)
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|err| AuthError::credential(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::credential(format!("status {status}: {body}")));
        }

        let payload: AccessTokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::credential(format!("malformed response: {err}")))?;
        Ok(InstallationToken::new(payload.token, payload.expires_at))
    }
}

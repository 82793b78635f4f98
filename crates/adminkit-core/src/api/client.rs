//! API client for the admin console backend.
//!
//! `ApiClient` is the request gateway: it reads the current access token
//! from the session manager, attaches it as a bearer credential, and on a
//! token rejection drives the refresh protocol and retries the original
//! request exactly once. It also carries the auth flow itself (captcha,
//! login, register, logout) and the protected data endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{SessionManager, TokenPair, TokenRefresher, TokenStore};
use crate::config::Config;
use crate::models::{AuthUser, CaptchaChallenge, LoginRequest, RegisterRequest, UserPage, UserQuery};

use super::ApiError;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Wire types (public models live in crate::models)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "userId")]
    user_id: i64,
    username: String,
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    avatar: String,
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: Option<i64>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: Option<i64>,
}

/// Check if a response is successful, mapping everything else onto the
/// failure taxonomy.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    response
        .json()
        .await
        .map_err(|err| ApiError::InvalidResponse(format!("malformed response body: {}", err)))
}

// ============================================================================
// Refresh transport
// ============================================================================

/// Refresh transport used by the session manager. Holds its own handle to
/// the shared connection pool, so a refresh never routes back through the
/// gateway it is unblocking.
#[derive(Clone)]
pub struct RefreshEndpoint {
    client: Client,
    base_url: String,
}

impl RefreshEndpoint {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl TokenRefresher for RefreshEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let url = format!("{}/auth/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        let response = check_response(response).await?;
        let parsed: RefreshResponse = parse_json(response).await?;
        Ok(TokenPair::new(
            parsed.access_token,
            parsed.refresh_token,
            parsed.expires_in,
        ))
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// API client for the admin console backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl ApiClient {
    /// Wire up the client, the refresh endpoint, and the session manager
    /// against one shared connection pool.
    pub fn connect(config: &Config, store: TokenStore) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let refresher = Arc::new(RefreshEndpoint::new(client.clone(), base_url.clone()));
        let session = Arc::new(SessionManager::new(store, refresher));
        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    /// The session manager backing this client.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Execute a request with the session credential attached, recovering
    /// once from an access-token rejection.
    ///
    /// With no session present the request goes out unauthenticated and a
    /// 401 passes straight through: there is nothing to refresh. With a
    /// token attached, a 401 hands the rejected token to the session
    /// manager and, if recovery produces a fresh one, the original
    /// request is retried exactly once. A rejection of the fresh token is
    /// terminal for this call.
    async fn execute_raw(&self, builder: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let token = self.session.access_token().await;
        let attempt = builder.try_clone().ok_or_else(|| {
            ApiError::InvalidResponse("request body cannot be cloned for retry".to_string())
        })?;
        let attempt = match token.as_deref() {
            Some(token) => attempt.bearer_auth(token),
            None => attempt,
        };
        let response = attempt.send().await?;
        match check_response(response).await {
            Ok(response) => Ok(response),
            Err(ApiError::Unauthorized) => {
                let rejected = match token {
                    Some(token) => token,
                    None => return Err(ApiError::Unauthorized),
                };
                let fresh = self.session.recover(&rejected).await?;
                debug!("retrying request with refreshed credential");
                let response = builder.bearer_auth(&fresh).send().await?;
                match check_response(response).await {
                    Ok(response) => Ok(response),
                    // The server rejected a token it just issued; do not
                    // loop on refresh, end this call here.
                    Err(ApiError::Unauthorized) => Err(ApiError::SessionExpired),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.execute_raw(builder).await?;
        parse_json(response).await
    }

    /// GET a JSON resource through the gateway.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(self.client.get(self.url(path))).await
    }

    /// GET a JSON resource with query parameters through the gateway.
    pub async fn get_query<T, Q>(&self, path: &str, query: &Q) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.execute(self.client.get(self.url(path)).query(query))
            .await
    }

    /// POST a JSON body through the gateway.
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.execute(self.client.post(self.url(path)).json(body))
            .await
    }

    // ===== Auth flow =====

    /// Fetch a fresh captcha challenge for the external widget to render.
    /// Each challenge is consumable at most once.
    pub async fn fetch_captcha(&self) -> Result<CaptchaChallenge, ApiError> {
        self.execute(self.client.get(self.url("/auth/captcha")))
            .await
    }

    /// Authenticate and install the issued credential pair.
    ///
    /// On a business rejection (bad credentials, wrong or already-consumed
    /// captcha answer) the session is left untouched; the caller must
    /// obtain a fresh challenge before retrying, since the submitted one
    /// is spent either way.
    pub async fn login(&self, request: &LoginRequest) -> Result<AuthUser, ApiError> {
        let url = self.url("/auth/login");
        let response = self.client.post(&url).json(request).send().await?;
        let response = check_response(response).await?;
        let auth: AuthResponse = parse_json(response).await?;

        let pair = TokenPair::new(auth.access_token, auth.refresh_token, auth.expires_in);
        self.session.install(pair).await?;

        Ok(AuthUser {
            user_id: auth.user_id,
            username: auth.username,
            nickname: auth.nickname,
            avatar: auth.avatar,
            roles: auth.roles,
        })
    }

    /// Create a new account. The captcha challenge is consumed whether or
    /// not registration succeeds.
    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ApiError> {
        let url = self.url("/auth/register");
        let response = self.client.post(&url).json(request).send().await?;
        check_response(response).await?;
        Ok(())
    }

    /// End the session. The server notification is best effort; local
    /// state is cleared regardless of the network outcome.
    pub async fn logout(&self) {
        if let Some(token) = self.session.access_token().await {
            let url = self.url("/auth/logout");
            match self.client.post(&url).bearer_auth(&token).send().await {
                Ok(response) => {
                    if let Err(err) = check_response(response).await {
                        warn!(error = %err, "server rejected logout notification");
                    }
                }
                Err(err) => warn!(error = %err, "could not reach server for logout"),
            }
        }
        self.session.reset().await;
    }

    // ===== Protected endpoints =====

    /// Fetch one page of the user directory.
    pub async fn fetch_users(&self, query: &UserQuery) -> Result<UserPage, ApiError> {
        self.get_query("/admin/user/list", query).await
    }
}

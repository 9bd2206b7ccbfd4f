// =============================================================================
// Auth client — relays login / OTP / registration to the backend
// =============================================================================
//
// The backend owns every auth rule. This client only forwards requests and
// caches the bearer token it gets back in the credential provider.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::backend::client::ApiClient;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct VerifyOtpRequest<'a> {
    email: &'a str,
    otp: &'a str,
}

/// Registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// Account details as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "name")]
    pub full_name: Option<String>,
}

/// Shape shared by login / verify-otp responses.
#[derive(Debug, Clone, Default, Deserialize)]
struct AuthResponse {
    #[serde(default, alias = "token")]
    access_token: Option<String>,
    #[serde(default, alias = "otp_required")]
    requires_otp: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

/// An authenticated session; the token is already cached.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// The backend sent a one-time code; finish with [`AuthClient::verify_otp`].
    OtpRequired { message: Option<String> },
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    api: ApiClient,
}

impl AuthClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// POST /auth/login.
    #[instrument(skip(self, password), name = "auth::login")]
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<LoginOutcome> {
        let resp: AuthResponse = self
            .api
            .post_json("/auth/login", &LoginRequest { email, password })
            .await?;

        if let Some(token) = resp.access_token.filter(|t| !t.is_empty()) {
            self.api.credentials().set_token(token);
            info!(email, "logged in");
            return Ok(LoginOutcome::Authenticated(Session { user: resp.user }));
        }
        if resp.requires_otp {
            info!(email, "login requires OTP verification");
            return Ok(LoginOutcome::OtpRequired {
                message: resp.message,
            });
        }
        Err(SyncError::parse("login response carried neither a token nor an OTP challenge"))
    }

    /// POST /auth/verify-otp.
    #[instrument(skip(self, otp), name = "auth::verify_otp")]
    pub async fn verify_otp(&self, email: &str, otp: &str) -> SyncResult<Session> {
        let resp: AuthResponse = self
            .api
            .post_json("/auth/verify-otp", &VerifyOtpRequest { email, otp })
            .await?;

        let token = resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::parse("verify-otp response is missing the access token"))?;
        self.api.credentials().set_token(token);
        info!(email, "OTP verified");
        Ok(Session { user: resp.user })
    }

    /// POST /auth/register. Returns the backend's response body untouched.
    #[instrument(skip(self, request), fields(email = %request.email), name = "auth::register")]
    pub async fn register(&self, request: &RegisterRequest) -> SyncResult<serde_json::Value> {
        self.api.post_json("/auth/register", request).await
    }

    /// GET /auth/me.
    #[instrument(skip(self), name = "auth::current_user")]
    pub async fn current_user(&self) -> SyncResult<UserProfile> {
        self.api.get_json("/auth/me", &[]).await
    }

    /// Drop the cached token.
    pub fn logout(&self) {
        self.api.credentials().clear();
        info!("logged out");
    }

    pub fn is_authenticated(&self) -> bool {
        self.api.credentials().token().is_some()
    }
}

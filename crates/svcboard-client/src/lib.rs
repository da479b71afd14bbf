//! Typed HTTP client for the svcboard REST API, plus the client-side session gate.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use svcboard_core::{
    CreatedListing, ErrorBody, FormConfiguration, ListingId, ListingSummary, LoginRequest,
    LoginResponse, NewListing, ServiceListing, SessionStatus, UserInfo,
};
use thiserror::Error;
use tracing::{debug, warn};

mod console;
mod gate;

pub use console::AdminConsole;
pub use gate::{AuthGate, AuthState, ViewScope, ViewTicket};

pub const CRATE_NAME: &str = "svcboard-client";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5010/api".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SVCBOARD_API_URL").unwrap_or(defaults.base_url),
            timeout: std::env::var("SVCBOARD_API_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Pre-flight rejection; nothing was sent.
    #[error("submission blocked: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("request rejected: {}", .0.join("; "))]
    BadRequest(Vec<String>),
    #[error("login failed: {0}")]
    Authentication(String),
    #[error("an authenticated admin session is required")]
    Authorization,
    #[error("resource not found")]
    NotFound,
    #[error("transport failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: u16, message: Option<String> },
}

impl ClientError {
    /// Single message suitable for showing to the person at the form.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(errors) | Self::BadRequest(errors) => errors.join("\n"),
            Self::Authentication(message) => message.clone(),
            Self::Authorization => "Your session has ended. Please log in again.".to_string(),
            Self::NotFound => "The requested listing does not exist.".to_string(),
            Self::Network(_) => "Could not reach the server. Please try again.".to_string(),
            Self::Status { status, message } => match message {
                Some(message) => format!("Server error ({status}): {message}"),
                None => format!("Server error ({status})."),
            },
        }
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Authorization)
    }
}

/// One method per lifecycle action. The session cookie travels in the client's cookie
/// store; no call attaches credentials by hand.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn get_config(&self) -> Result<FormConfiguration, ClientError> {
        let resp = self.http.get(self.url("/config")).send().await?;
        decode(resp).await
    }

    /// Callers must not rely on the order of the returned summaries.
    pub async fn list_listings(&self) -> Result<Vec<ListingSummary>, ClientError> {
        let resp = self.http.get(self.url("/servicos")).send().await?;
        decode(resp).await
    }

    pub async fn get_listing(&self, id: ListingId) -> Result<ServiceListing, ClientError> {
        let resp = self.http.get(self.url(&format!("/servicos/{id}"))).send().await?;
        decode(resp).await
    }

    /// Runs the pre-flight checks first; a blocked submission never reaches the network.
    pub async fn submit_listing(&self, listing: &NewListing) -> Result<ListingId, ClientError> {
        let violations = listing.preflight();
        if !violations.is_empty() {
            debug!(violations = violations.len(), "submission blocked before dispatch");
            return Err(ClientError::Validation(violations));
        }
        let resp = self.http.post(self.url("/servicos")).json(listing).send().await?;
        let created: CreatedListing = decode(resp).await?;
        Ok(created.id)
    }

    pub async fn delete_listing(&self, id: ListingId) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url(&format!("/admin/servicos/{id}")))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(failure(resp, false).await)
    }

    /// Download reference for a listing's CSV. Resolving it is left to the caller.
    pub fn export_url(&self, id: ListingId) -> String {
        self.url(&format!("/servicos/{id}/export"))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserInfo, ClientError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self.http.post(self.url("/auth/login")).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(failure(resp, true).await);
        }
        let login: LoginResponse = resp.json().await?;
        Ok(login.user)
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let resp = self.http.post(self.url("/auth/logout")).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(failure(resp, false).await)
    }

    pub async fn check_session(&self) -> Result<SessionStatus, ClientError> {
        let resp = self.http.get(self.url("/auth/check")).send().await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    if resp.status().is_success() {
        return Ok(resp.json().await?);
    }
    Err(failure(resp, false).await)
}

async fn failure(resp: Response, during_login: bool) -> ClientError {
    let status = resp.status();
    let body = match resp.json::<ErrorBody>().await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, %status, "error response without a JSON body");
            ErrorBody::default()
        }
    };
    classify(status, body, during_login)
}

fn classify(status: StatusCode, body: ErrorBody, during_login: bool) -> ClientError {
    match status {
        StatusCode::BAD_REQUEST if !body.errors.is_empty() => ClientError::BadRequest(body.errors),
        StatusCode::BAD_REQUEST => ClientError::BadRequest(
            body.error.into_iter().collect::<Vec<_>>(),
        ),
        StatusCode::UNAUTHORIZED if during_login => ClientError::Authentication(
            body.error.unwrap_or_else(|| "Invalid credentials".to_string()),
        ),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Authorization,
        StatusCode::NOT_FOUND => ClientError::NotFound,
        other => {
            warn!(status = %other, "unexpected response status");
            ClientError::Status {
                status: other.as_u16(),
                message: body.error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new(ClientConfig {
            // Discard port: any request that slips through fails as a network error.
            base_url: "http://127.0.0.1:9/api/".to_string(),
            timeout: Duration::from_millis(200),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn blocked_submission_reports_every_violation_without_dispatch() {
        let listing = NewListing {
            house_number: "12A".into(),
            expiration_deadline: "2024-01-01".into(),
            ..NewListing::default()
        };
        let err = client().submit_listing(&listing).await.unwrap_err();
        match &err {
            ClientError::Validation(violations) => assert_eq!(violations.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(err.user_message().lines().count(), 2);
    }

    #[test]
    fn export_url_is_built_from_base() {
        assert_eq!(
            client().export_url(ListingId(5)),
            "http://127.0.0.1:9/api/servicos/5/export"
        );
    }

    #[test]
    fn server_validation_errors_join_into_one_message() {
        let err = classify(
            StatusCode::BAD_REQUEST,
            ErrorBody::field_errors(vec!["Title is required.".into(), "Unknown payment method: Pix.".into()]),
            false,
        );
        assert_eq!(err.user_message(), "Title is required.\nUnknown payment method: Pix.");
    }

    #[test]
    fn unauthorized_means_bad_credentials_only_during_login() {
        let login = classify(StatusCode::UNAUTHORIZED, ErrorBody::message("Invalid credentials"), true);
        assert!(matches!(login, ClientError::Authentication(ref m) if m == "Invalid credentials"));
        assert!(!login.requires_login());

        let protected = classify(StatusCode::UNAUTHORIZED, ErrorBody::default(), false);
        assert!(protected.requires_login());
        assert!(classify(StatusCode::FORBIDDEN, ErrorBody::default(), false).requires_login());
    }

    #[test]
    fn other_statuses_keep_code_and_message() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, ErrorBody::default(), false),
            ClientError::NotFound
        ));
        let err = classify(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::message("Storage unavailable"),
            false,
        );
        assert!(matches!(err, ClientError::Status { status: 500, .. }));
        assert_eq!(err.user_message(), "Server error (500): Storage unavailable");
    }

    #[test]
    fn default_config_points_at_local_api() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:5010/api");
        assert_eq!(config.timeout, Duration::from_secs(20));
    }
}

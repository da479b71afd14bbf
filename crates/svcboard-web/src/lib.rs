//! Axum JSON API + Askama pages for svcboard.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Local, Utc};
use serde_json::json;
use svcboard_core::{
    CreatedListing, ErrorBody, DATE_PATTERN, ListingId, ListingSummary, LoginRequest, LoginResponse, NewListing,
    ServiceListing, SessionContext, SessionStatus,
};
use svcboard_storage::{
    load_form_configuration, AdminDirectory, CsvExport, ListingError, ListingService, ListingStore,
    MemoryListingStore, PgListingStore, StaticAdminDirectory,
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod auth;

use auth::{AdminAuthenticator, CurrentSession, FallbackAdmin, SessionStore};

pub const CRATE_NAME: &str = "svcboard-web";

/// Server settings, read from the environment.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    pub database_url: Option<String>,
    pub refs_dir: PathBuf,
    pub admin_username: String,
    pub admin_password: Option<String>,
    pub admin_password_hash: Option<String>,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
    pub cors_origins: Vec<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let admin_password_hash = std::env::var("ADMIN_PASSWORD_HASH")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            host: std::env::var("SVCBOARD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SVCBOARD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5010),
            api_prefix: normalize_prefix(
                &std::env::var("SVCBOARD_API_PREFIX").unwrap_or_else(|_| "/api".to_string()),
            ),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            refs_dir: std::env::var("SVCBOARD_REFS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./refs")),
            admin_username: std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            admin_password: match std::env::var("ADMIN_PASSWORD") {
                Ok(v) => Some(v),
                Err(_) if admin_password_hash.is_none() => Some("admin".to_string()),
                Err(_) => None,
            },
            admin_password_hash,
            session_ttl: session_ttl_from(std::env::var("SESSION_TTL_MINUTES").ok().as_deref()),
            cookie_secure: std::env::var("SESSION_COOKIE_SECURE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cors_origins: std::env::var("SVCBOARD_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_else(|_| {
                    vec![
                        "http://localhost:3000".to_string(),
                        "http://localhost:5173".to_string(),
                    ]
                }),
        }
    }

    pub fn fallback_admin(&self) -> Option<FallbackAdmin> {
        let secret = self
            .admin_password_hash
            .clone()
            .or_else(|| self.admin_password.clone())?;
        Some(FallbackAdmin {
            username: self.admin_username.clone(),
            secret,
        })
    }
}

const DEFAULT_SESSION_TTL_MINUTES: i64 = 720;

fn session_ttl_from(raw: Option<&str>) -> Duration {
    let Some(raw) = raw else {
        return Duration::minutes(DEFAULT_SESSION_TTL_MINUTES);
    };
    match raw.trim().parse::<i64>().ok().filter(|m| *m > 0).and_then(Duration::try_minutes) {
        Some(ttl) => ttl,
        None => {
            warn!(value = %raw, "SESSION_TTL_MINUTES is not a usable minute count; using 720");
            Duration::minutes(DEFAULT_SESSION_TTL_MINUTES)
        }
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub struct AppState {
    pub listings: ListingService,
    pub sessions: SessionStore,
    pub auth: AdminAuthenticator,
    pub api_prefix: String,
    pub cookie_secure: bool,
}

impl AppState {
    pub fn new(
        listings: ListingService,
        auth: AdminAuthenticator,
        session_ttl: Duration,
        api_prefix: impl Into<String>,
    ) -> Self {
        Self {
            listings,
            sessions: SessionStore::new(session_ttl),
            auth,
            api_prefix: normalize_prefix(&api_prefix.into()),
            cookie_secure: false,
        }
    }

    /// Wire the configured backends: Postgres when `DATABASE_URL` is set, memory otherwise.
    pub async fn from_config(config: &WebConfig) -> anyhow::Result<Self> {
        let form = load_form_configuration(&config.refs_dir, Local::now().date_naive())?;
        let (store, directory) = match &config.database_url {
            Some(url) => {
                let pg = Arc::new(PgListingStore::connect(url).await?);
                pg.migrate().await?;
                let store: Arc<dyn ListingStore> = pg.clone();
                let directory: Arc<dyn AdminDirectory> = pg;
                (store, directory)
            }
            None => {
                warn!("DATABASE_URL not set; listings are kept in memory only");
                let store: Arc<dyn ListingStore> = Arc::new(MemoryListingStore::new());
                let directory: Arc<dyn AdminDirectory> = Arc::new(StaticAdminDirectory::default());
                (store, directory)
            }
        };
        if config.admin_password_hash.is_none() && config.admin_password.as_deref() == Some("admin") {
            warn!("fallback admin uses the default password; set ADMIN_PASSWORD_HASH");
        }
        let mut state = Self::new(
            ListingService::new(store, form),
            AdminAuthenticator::new(directory, config.fallback_admin()),
            config.session_ttl,
            config.api_prefix.clone(),
        );
        state.cookie_secure = config.cookie_secure;
        Ok(state)
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::message(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ListingError> for ApiError {
    fn from(err: ListingError) -> Self {
        match err {
            ListingError::Invalid(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                body: ErrorBody::field_errors(errors),
            },
            ListingError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "Listing not found"),
            ListingError::Unauthorized => Self::new(StatusCode::UNAUTHORIZED, "Not authorized"),
            ListingError::Storage(err) => {
                tracing::error!(error = %format!("{err:#}"), "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable")
            }
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_listings: usize,
    api_prefix: String,
}

#[derive(Template)]
#[template(path = "listings.html")]
struct ListingsTemplate {
    listings: Vec<ListingRow>,
}

#[derive(Template)]
#[template(path = "listing_detail.html")]
struct ListingDetailTemplate {
    listing: DetailView,
    export_url: String,
}

#[derive(Template)]
#[template(path = "admin_dashboard.html")]
struct AdminDashboardTemplate {
    username: String,
    listings: Vec<ListingRow>,
    api_prefix: String,
}

#[derive(Template)]
#[template(path = "admin_login.html")]
struct AdminLoginTemplate {
    api_prefix: String,
}

#[derive(Template)]
#[template(path = "listing_form.html")]
struct ListingFormTemplate {
    agencies: Vec<String>,
    activity_types: Vec<String>,
    payment_methods: Vec<String>,
    today: String,
    specifications_json: String,
    date_pattern_json: String,
    api_prefix: String,
}

#[derive(Debug, Clone)]
struct ListingRow {
    id: ListingId,
    title: String,
    agency: String,
    activity_type: String,
    neighborhood: String,
    expires: String,
}

impl From<ListingSummary> for ListingRow {
    fn from(s: ListingSummary) -> Self {
        Self {
            id: s.id,
            title: s.title,
            agency: s.requesting_agency,
            activity_type: s.activity_type,
            neighborhood: s.neighborhood,
            expires: s.expiration_deadline.format("%d/%m/%Y").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct DetailView {
    title: String,
    agency: String,
    activity_type: String,
    specification: String,
    description: String,
    additional_information: String,
    address: String,
    neighborhood: String,
    payment_method: String,
    payment_term: String,
    expires: String,
    execute_by: String,
}

impl From<ServiceListing> for DetailView {
    fn from(listing: ServiceListing) -> Self {
        let f = listing.fields;
        Self {
            address: format!("{}, {}", f.address, f.house_number),
            title: f.title,
            agency: f.requesting_agency,
            activity_type: f.activity_type,
            specification: f.activity_specification,
            description: f.description,
            additional_information: f.additional_information.unwrap_or_else(|| "-".to_string()),
            neighborhood: f.neighborhood,
            payment_method: f.payment_method,
            payment_term: f.payment_term,
            expires: f.expiration_deadline.format("%d/%m/%Y").to_string(),
            execute_by: f.execution_deadline.format("%d/%m/%Y").to_string(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let prefix = state.api_prefix.clone();
    let state = Arc::new(state);
    let pages = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/vagas", get(listings_page_handler))
        .route("/vagas/nova", get(listing_form_handler))
        .route("/vagas/{id}", get(listing_page_handler))
        .route("/admin", get(admin_dashboard_handler))
        .route("/admin/login", get(admin_login_page_handler));
    let api = Router::new()
        .route("/config", get(config_handler))
        .route("/servicos", get(list_handler).post(create_handler))
        .route("/servicos/{id}", get(get_handler))
        .route("/servicos/{id}/export", get(export_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/check", get(check_handler))
        .route("/admin/servicos/export", get(export_all_handler))
        .route("/admin/servicos/{id}", delete(delete_handler));

    let router = if prefix.is_empty() {
        pages.merge(api.route("/api-info", get(api_info_handler)))
    } else {
        pages.nest(&prefix, api.route("/", get(api_info_handler)))
    };
    router.with_state(state).layer(TraceLayer::new_for_http())
}

/// Credentialed CORS for browser front-ends served from other origins.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config).await?;
    let router = app(state).layer(cors_layer(&config.cors_origins));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, api_prefix = %config.api_prefix, "svcboard listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn api_info_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let p = &state.api_prefix;
    Json(json!({
        "name": "svcboard",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "online",
        "endpoints": {
            "config": format!("GET {p}/config"),
            "list_servicos": format!("GET {p}/servicos"),
            "get_servico": format!("GET {p}/servicos/<id>"),
            "create_servico": format!("POST {p}/servicos"),
            "export_csv": format!("GET {p}/servicos/<id>/export"),
            "login": format!("POST {p}/auth/login"),
            "logout": format!("POST {p}/auth/logout"),
            "check_auth": format!("GET {p}/auth/check"),
            "delete_servico": format!("DELETE {p}/admin/servicos/<id>"),
            "export_all": format!("GET {p}/admin/servicos/export"),
        }
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": "svcboard"}))
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.listings.form_configuration(Local::now().date_naive())).into_response()
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ListingSummary>>, ApiError> {
    Ok(Json(state.listings.list().await?))
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ServiceListing>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.listings.get(id).await?))
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewListing>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedListing>), ApiError> {
    let Json(input) = payload.map_err(|rejection| ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorBody::field_errors(vec![rejection.body_text()]),
    })?;
    let listing = state.listings.create(&input).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedListing {
            message: "Listing created".to_string(),
            id: listing.id,
        }),
    ))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    Ok(csv_response(state.listings.export_csv(id, Utc::now()).await?))
}

async fn export_all_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
) -> Result<Response, ApiError> {
    Ok(csv_response(state.listings.export_all_csv(&session, Utc::now()).await?))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    if session.admin().is_none() {
        return Err(ListingError::Unauthorized.into());
    }
    let id = parse_id(&id)?;
    state.listings.delete(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let Json(input) = payload.map_err(|r| ApiError::new(StatusCode::BAD_REQUEST, r.body_text()))?;
    let username = input.username.trim();
    if username.is_empty() || input.password.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Username and password are required",
        ));
    }
    let Some(user) = state.auth.verify(username, &input.password).await else {
        warn!(username = %username, "admin login rejected");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    };
    let session = state.sessions.open(&user).await;
    info!(username = %user.username, session_id = %session.id, "admin logged in");
    let jar = jar.add(auth::session_cookie(&session, state.cookie_secure));
    Ok((
        jar,
        Json(LoginResponse {
            message: "Login successful".to_string(),
            user,
        }),
    ))
}

async fn logout_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Json<serde_json::Value>) {
    if let Some(id) = auth::session_id(&jar) {
        if state.sessions.close(id).await {
            info!(session_id = %id, "admin logged out");
        }
    }
    let jar = jar.remove(auth::expired_session_cookie());
    (jar, Json(json!({"message": "Logout successful"})))
}

async fn check_handler(CurrentSession(session): CurrentSession) -> Json<SessionStatus> {
    Json(match session.admin() {
        Some(admin) => SessionStatus::for_session(admin),
        None => SessionStatus::anonymous(),
    })
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.listings.list().await {
        Ok(listings) => render_html(IndexTemplate {
            total_listings: listings.len(),
            api_prefix: state.api_prefix.clone(),
        }),
        Err(err) => server_error(err),
    }
}

async fn listings_page_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.listings.list().await {
        Ok(listings) => render_html(ListingsTemplate {
            listings: listings.into_iter().map(ListingRow::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn listing_form_handler(State(state): State<Arc<AppState>>) -> Response {
    let form = state.listings.form_configuration(Local::now().date_naive());
    let (specifications_json, date_pattern_json) = match (
        serde_json::to_string(&form.specifications),
        serde_json::to_string(DATE_PATTERN),
    ) {
        (Ok(specs), Ok(pattern)) => (script_safe(specs), script_safe(pattern)),
        (Err(err), _) | (_, Err(err)) => return server_error(err),
    };
    render_html(ListingFormTemplate {
        today: form.today.format("%d/%m/%Y").to_string(),
        agencies: form.agencies,
        activity_types: form.activity_types,
        payment_methods: form.payment_methods,
        specifications_json,
        date_pattern_json,
        api_prefix: state.api_prefix.clone(),
    })
}

/// JSON embedded in a `<script>` block must not close the tag early.
fn script_safe(json: String) -> String {
    json.replace("</", "<\\/")
}

async fn listing_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = id.parse::<ListingId>() else {
        return not_found_page();
    };
    match state.listings.get(id).await {
        Ok(listing) => render_html(ListingDetailTemplate {
            export_url: format!("{}/servicos/{}/export", state.api_prefix, listing.id),
            listing: DetailView::from(listing),
        }),
        Err(ListingError::NotFound(_)) => not_found_page(),
        Err(err) => server_error(err),
    }
}

async fn admin_dashboard_handler(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
) -> Response {
    let SessionContext::Admin(admin) = session else {
        return Redirect::to("/admin/login").into_response();
    };
    match state.listings.list().await {
        Ok(listings) => render_html(AdminDashboardTemplate {
            username: admin.username,
            listings: listings.into_iter().map(ListingRow::from).collect(),
            api_prefix: state.api_prefix.clone(),
        }),
        Err(err) => server_error(err),
    }
}

async fn admin_login_page_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(AdminLoginTemplate {
        api_prefix: state.api_prefix.clone(),
    })
}

fn parse_id(raw: &str) -> Result<ListingId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "Listing not found"))
}

fn csv_response(export: CsvExport) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.filename),
            ),
        ],
        export.body,
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found_page() -> Response {
    (StatusCode::NOT_FOUND, Html("Listing not found".to_string())).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "page rendering failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("Server error".to_string()),
    )
        .into_response()
}

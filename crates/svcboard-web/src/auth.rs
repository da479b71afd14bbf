//! Admin credential checks and the server-side session store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use svcboard_core::{AdminSession, SessionContext, UserInfo};
use svcboard_storage::AdminDirectory;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;

pub const SESSION_COOKIE: &str = "svcboard_session";

/// Hash a password into an argon2 PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hashing password: {e}"))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored secret. PHC strings are verified with argon2;
/// anything else is a legacy plain-text secret compared directly.
pub fn verify_secret(password: &str, stored: &str) -> bool {
    if stored.starts_with("$argon2") {
        return match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(err) => {
                warn!(error = %err, "stored admin hash is malformed");
                false
            }
        };
    }
    warn!("admin secret stored without hashing");
    password == stored
}

/// Environment-configured administrator used when the directory has no match.
#[derive(Debug, Clone)]
pub struct FallbackAdmin {
    pub username: String,
    pub secret: String,
}

#[derive(Clone)]
pub struct AdminAuthenticator {
    directory: Arc<dyn AdminDirectory>,
    fallback: Option<FallbackAdmin>,
}

impl AdminAuthenticator {
    pub fn new(directory: Arc<dyn AdminDirectory>, fallback: Option<FallbackAdmin>) -> Self {
        Self { directory, fallback }
    }

    /// Directory accounts win; directory failures fall through to the fallback admin.
    pub async fn verify(&self, username: &str, password: &str) -> Option<UserInfo> {
        match self.directory.find_account(username).await {
            Ok(Some(account)) if verify_secret(password, &account.password_hash) => {
                return Some(UserInfo {
                    id: account.id,
                    username: account.login,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "admin directory lookup failed"),
        }

        let fallback = self.fallback.as_ref()?;
        if fallback.username == username && verify_secret(password, &fallback.secret) {
            return Some(UserInfo {
                id: 0,
                username: fallback.username.clone(),
            });
        }
        None
    }
}

/// In-process session table keyed by the random id carried in [`SESSION_COOKIE`].
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<Uuid, AdminSession>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, user: &UserInfo) -> AdminSession {
        let session = AdminSession {
            id: Uuid::new_v4(),
            user_id: user.id,
            username: user.username.clone(),
            expires_at: Utc::now()
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| !s.is_expired(Utc::now()));
        sessions.insert(session.id, session.clone());
        session
    }

    /// Live session for `id`; an expired one is dropped and reported as absent.
    pub async fn resolve(&self, id: Uuid) -> Option<AdminSession> {
        let found = self.sessions.read().await.get(&id).cloned()?;
        if found.is_expired(Utc::now()) {
            debug!(session_id = %id, "session expired");
            self.sessions.write().await.remove(&id);
            return None;
        }
        Some(found)
    }

    pub async fn close(&self, id: Uuid) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    pub async fn context_for(&self, jar: &CookieJar) -> SessionContext {
        match session_id(jar) {
            Some(id) => self
                .resolve(id)
                .await
                .map(SessionContext::Admin)
                .unwrap_or_default(),
            None => SessionContext::Anonymous,
        }
    }
}

pub fn session_id(jar: &CookieJar) -> Option<Uuid> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

pub fn session_cookie(session: &AdminSession, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session.id.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

pub fn expired_session_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

/// Caller identity resolved from the session cookie. Never rejects: missing, unknown
/// and expired cookies all resolve to [`SessionContext::Anonymous`].
pub struct CurrentSession(pub SessionContext);

impl FromRequestParts<Arc<AppState>> for CurrentSession {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        Ok(Self(state.sessions.context_for(&jar).await))
    }
}

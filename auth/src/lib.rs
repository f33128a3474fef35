//! Authentication module for the photo journal backend.
//!
//! A [`SessionAuth`] signs in against the backend token endpoint and keeps the
//! resulting [`Session`] in memory and in the system keyring (or a JSON file
//! when the `file-store` feature is enabled and requested). Everything else in
//! the workspace only depends on the [`AuthContext`] trait.

use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(feature = "file-store")]
use std::path::PathBuf;

const KEYRING_SERVICE_NAME: &str = "PhotoJournal";
const KEYRING_SESSION_ENTRY: &str = "session";
pub const USE_FILE_STORE_ENV: &str = "USE_FILE_STORE";

/// Sessions this close to expiry are refreshed before use.
const EXPIRY_LEEWAY_SECS: i64 = 60;

/// How often the background task checks the session. Shorter than the expiry
/// leeway so a session is refreshed before it lapses.
pub const DEFAULT_TOKEN_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("Not signed in")]
    Unauthenticated,
    #[error("Keyring Error: {0}")]
    Keyring(String),
    #[error("HTTP Error: {0}")]
    Http(String),
    #[error("Sign-in rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Storage Error: {0}")]
    Storage(String),
    #[error("Other Error: {0}")]
    Other(String),
}

/// Identity of the signed-in user, as seen by the rest of the workspace.
///
/// Per-user operations must call [`AuthContext::require_user`] and fail fast
/// instead of proceeding without an identity.
pub trait AuthContext: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    fn access_token(&self) -> Option<String> {
        None
    }

    fn require_user(&self) -> Result<String, AuthError> {
        self.current_user_id().ok_or(AuthError::Unauthenticated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: String,
    pub email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_LEEWAY_SECS) >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user_id: self.user.id,
            email: self.user.email,
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
        }
    }
}

/// Where a session survives process restarts.
#[derive(Debug, Clone)]
pub enum SessionStore {
    Keyring,
    #[cfg(feature = "file-store")]
    File(PathBuf),
    /// Nothing is persisted.
    Memory,
}

impl SessionStore {
    /// Keyring by default, the JSON file when `USE_FILE_STORE` is set.
    #[cfg(feature = "file-store")]
    pub fn from_env() -> Self {
        if std::env::var(USE_FILE_STORE_ENV).is_ok() {
            SessionStore::File(default_session_file())
        } else {
            SessionStore::Keyring
        }
    }

    #[cfg(not(feature = "file-store"))]
    pub fn from_env() -> Self {
        SessionStore::Keyring
    }

    pub fn load(&self) -> Result<Option<Session>, AuthError> {
        let raw = match self {
            SessionStore::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE_NAME, KEYRING_SESSION_ENTRY)
                    .map_err(|e| AuthError::Keyring(e.to_string()))?;
                match entry.get_password() {
                    Ok(raw) => raw,
                    Err(keyring::Error::NoEntry) => return Ok(None),
                    Err(e) => return Err(AuthError::Keyring(e.to_string())),
                }
            }
            #[cfg(feature = "file-store")]
            SessionStore::File(path) => match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(AuthError::Storage(e.to_string())),
            },
            SessionStore::Memory => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "Stored session is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        let raw = serde_json::to_string(session).map_err(|e| AuthError::Storage(e.to_string()))?;
        match self {
            SessionStore::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE_NAME, KEYRING_SESSION_ENTRY)
                    .map_err(|e| AuthError::Keyring(e.to_string()))?;
                entry
                    .set_password(&raw)
                    .map_err(|e| AuthError::Keyring(e.to_string()))
            }
            #[cfg(feature = "file-store")]
            SessionStore::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| AuthError::Storage(e.to_string()))?;
                }
                std::fs::write(path, raw).map_err(|e| AuthError::Storage(e.to_string()))
            }
            SessionStore::Memory => Ok(()),
        }
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        match self {
            SessionStore::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE_NAME, KEYRING_SESSION_ENTRY)
                    .map_err(|e| AuthError::Keyring(e.to_string()))?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(e) => Err(AuthError::Keyring(e.to_string())),
                }
            }
            #[cfg(feature = "file-store")]
            SessionStore::File(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AuthError::Storage(e.to_string())),
            },
            SessionStore::Memory => Ok(()),
        }
    }
}

#[cfg(feature = "file-store")]
fn default_session_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".photojournal")
        .join("session.json")
}

pub struct SessionAuth {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    store: SessionStore,
    session: RwLock<Option<Session>>,
}

impl SessionAuth {
    pub fn new(base_url: &str, api_key: &str, store: SessionStore) -> Self {
        SessionAuth {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            store,
            session: RwLock::new(None),
        }
    }

    pub fn session(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_session(&self, session: Option<Session>) {
        match self.session.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    /// Load a previously persisted session, if any.
    pub fn restore(&self) -> Result<Option<Session>, AuthError> {
        let session = self.store.load()?;
        if let Some(s) = &session {
            tracing::info!(user_id = %s.user_id, "Restored stored session");
        }
        self.set_session(session.clone());
        Ok(session)
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, password)))]
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let session = self
            .token_request("password", json!({ "email": email, "password": password }))
            .await?;
        self.persist(&session);
        self.set_session(Some(session.clone()));
        tracing::info!(user_id = %session.user_id, "Signed in");
        Ok(session)
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let refresh_token = self
            .session()
            .and_then(|s| s.refresh_token)
            .ok_or(AuthError::Unauthenticated)?;
        let session = self
            .token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        self.persist(&session);
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Current session, refreshed first when it is about to expire.
    pub async fn ensure_valid(&self) -> Result<Session, AuthError> {
        let session = self.session().ok_or(AuthError::Unauthenticated)?;
        if session.is_expired(Utc::now()) {
            tracing::info!("Session expired, refreshing");
            return self.refresh_session().await;
        }
        Ok(session)
    }

    pub fn sign_out(&self) -> Result<(), AuthError> {
        self.set_session(None);
        self.store.clear()
    }

    /// Keep the session valid in the background.
    ///
    /// Every `interval` the task runs [`ensure_valid`](Self::ensure_valid) and
    /// hands the resulting session to `on_session`, so holders of a copied
    /// access token can pick up a refreshed one. Failures are logged and
    /// forwarded to `error_tx`. Stops when the returned sender fires or is
    /// dropped.
    pub fn start_token_refresh_task<F>(
        self: Arc<Self>,
        interval: std::time::Duration,
        on_session: F,
        error_tx: Option<mpsc::UnboundedSender<AuthError>>,
    ) -> (JoinHandle<()>, oneshot::Sender<()>)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut last_success = Utc::now();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Token refresh task stopped");
                        break;
                    }
                    _ = async {
                        tokio::time::sleep(interval).await;
                        match self.ensure_valid().await {
                            Ok(session) => {
                                last_success = Utc::now();
                                on_session(&session);
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    last_success = %last_success.to_rfc3339(),
                                    "Token refresh failed"
                                );
                                if let Some(tx) = &error_tx {
                                    if let Err(send_err) = tx.send(e) {
                                        tracing::error!(error = ?send_err, "Failed to forward token refresh error");
                                    }
                                }
                            }
                        }
                    } => {}
                }
            }
        });
        (handle, shutdown_tx)
    }

    fn persist(&self, session: &Session) {
        // A session that cannot be stored still works for this process.
        if let Err(e) = self.store.save(session) {
            tracing::error!(error = %e, "Failed to persist session");
        }
    }

    async fn token_request(&self, grant_type: &str, body: serde_json::Value) -> Result<Session, AuthError> {
        let url = format!("{}/auth/v1/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;
        Ok(token.into_session())
    }
}

impl AuthContext for SessionAuth {
    fn current_user_id(&self) -> Option<String> {
        self.session().map(|s| s.user_id)
    }

    fn access_token(&self) -> Option<String> {
        self.session().map(|s| s.access_token)
    }
}

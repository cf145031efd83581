// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pre-flight authentication.
//!
//! An [`Authenticator`] runs once per session start, before any replication
//! traffic. Whatever it returns (headers, cookies) is installed on the
//! [`PeerClient`] and sent with every later request. A failure here is
//! session-fatal.
//!
//! Built-ins, selected from [`AuthConfig`] by [`from_config`]:
//!
//! | Authenticator | Handshake | Carries |
//! |---|---|---|
//! | [`BasicAuthenticator`] | none | `Authorization: Basic ...` |
//! | [`SessionAuthenticator`] | `POST _session {name, password}` | session cookie |
//! | [`TokenAuthenticator`] | `GET _session`, then `POST <login_path> {access_token}` | session cookie |

use crate::config::AuthConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::PeerClient;
use crate::transport::Method;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Cookie names servers use for session auth.
pub const SESSION_COOKIES: [&str; 2] = ["SyncGatewaySession", "AuthSession"];

/// Headers and cookies to apply to all later requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthOutcome {
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

impl AuthOutcome {
    /// Install on the client.
    pub fn apply(&self, peer: &PeerClient) {
        for (name, value) in &self.headers {
            peer.set_auth_header(name, value);
        }
        for (name, value) in &self.cookies {
            peer.set_cookie(name, value);
        }
    }
}

/// Type alias for the boxed handshake future.
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = Result<AuthOutcome>> + Send + 'a>>;

/// Extension point for credential handshakes.
pub trait Authenticator: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Perform the handshake. Any error is treated as an auth failure.
    fn authenticate<'a>(&'a self, peer: &'a PeerClient) -> AuthFuture<'a>;
}

/// Build the authenticator configured for a session. `None` for
/// [`AuthConfig::None`].
pub fn from_config(config: &AuthConfig) -> Option<Arc<dyn Authenticator>> {
    match config {
        AuthConfig::None => None,
        AuthConfig::Basic { username, password } => {
            Some(Arc::new(BasicAuthenticator::new(username, password)))
        }
        AuthConfig::Session { username, password } => {
            Some(Arc::new(SessionAuthenticator::new(username, password)))
        }
        AuthConfig::Token {
            login_path,
            access_token,
        } => Some(Arc::new(TokenAuthenticator::new(login_path, access_token))),
    }
}

/// Run `authenticator` against `peer` and install the result.
///
/// Errors that are not already authentication errors are reported as
/// authentication failures with the status they carried, or as the
/// original error when there is none (e.g. the peer was unreachable).
pub async fn run(authenticator: &dyn Authenticator, peer: &PeerClient) -> Result<()> {
    debug!(authenticator = authenticator.name(), "Authenticating");
    match authenticator.authenticate(peer).await {
        Ok(outcome) => {
            outcome.apply(peer);
            metrics::record_auth("success");
            info!(authenticator = authenticator.name(), "Authenticated with peer");
            Ok(())
        }
        Err(e) => {
            metrics::record_auth("failure");
            match e.status() {
                Some(status) if !e.is_retryable() => Err(ReplicationError::Authentication {
                    operation: authenticator.name().to_string(),
                    status,
                }),
                _ => Err(e),
            }
        }
    }
}

fn session_cookie(peer: &PeerClient) -> Option<(String, String)> {
    SESSION_COOKIES
        .iter()
        .find_map(|name| peer.cookie(name).map(|v| (name.to_string(), v)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Basic
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP Basic credentials on every request. No handshake.
pub struct BasicAuthenticator {
    header: String,
}

impl BasicAuthenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            header: format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn authenticate<'a>(&'a self, _peer: &'a PeerClient) -> AuthFuture<'a> {
        Box::pin(async move {
            Ok(AuthOutcome {
                headers: vec![("Authorization".to_string(), self.header.clone())],
                cookies: Vec::new(),
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════════

/// Name/password login through `POST _session`.
pub struct SessionAuthenticator {
    username: String,
    password: String,
}

impl SessionAuthenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl Authenticator for SessionAuthenticator {
    fn name(&self) -> &'static str {
        "session"
    }

    fn authenticate<'a>(&'a self, peer: &'a PeerClient) -> AuthFuture<'a> {
        Box::pin(async move {
            let body = json!({"name": self.username, "password": self.password});
            peer.send_json("_session", Method::Post, "_session", &body).await?;
            let cookie = session_cookie(peer).ok_or_else(|| {
                ReplicationError::protocol("_session", "login succeeded but no session cookie was set")
            })?;
            Ok(AuthOutcome {
                headers: Vec::new(),
                cookies: vec![cookie],
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token
// ═══════════════════════════════════════════════════════════════════════════════

/// Access-token login (e.g. `POST _facebook`).
///
/// If `GET _session` already reports a logged-in user the login POST is
/// skipped.
pub struct TokenAuthenticator {
    login_path: String,
    access_token: String,
}

impl TokenAuthenticator {
    pub fn new(login_path: &str, access_token: &str) -> Self {
        Self {
            login_path: login_path.to_string(),
            access_token: access_token.to_string(),
        }
    }
}

fn session_user(session: &Value) -> Option<&str> {
    session
        .get("userCtx")
        .and_then(|ctx| ctx.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
}

impl Authenticator for TokenAuthenticator {
    fn name(&self) -> &'static str {
        "token"
    }

    fn authenticate<'a>(&'a self, peer: &'a PeerClient) -> AuthFuture<'a> {
        Box::pin(async move {
            let session = peer.get_json("_session", "_session").await?;
            if let Some(user) = session_user(&session) {
                debug!(user, "Existing session is valid");
                return Ok(AuthOutcome {
                    headers: Vec::new(),
                    cookies: session_cookie(peer).into_iter().collect(),
                });
            }

            let body = json!({"access_token": self.access_token});
            peer.send_json(&self.login_path, Method::Post, &self.login_path, &body)
                .await?;
            let cookie = session_cookie(peer).ok_or_else(|| {
                ReplicationError::protocol(self.login_path.as_str(), "login succeeded but no session cookie was set")
            })?;
            Ok(AuthOutcome {
                headers: Vec::new(),
                cookies: vec![cookie],
            })
        })
    }
}

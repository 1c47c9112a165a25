//! Session authentication
//!
//! [`Session`] owns the login flow and hands out navigations that are guaranteed to run
//! against a logged-in browsing capability. When a navigation lands on the login page the
//! session logs in again and repeats the navigation once.
//!
//! The browsing capability itself sits behind the [`Browser`] trait:
//! - [`HttpBrowser`] - reqwest client with a cookie jar (the shipped implementation)
//! - test doubles script locations and payloads directly

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

mod http;

pub use http::HttpBrowser;

/// Account identifier and secret, held in memory for one process run
#[derive(Clone)]
pub struct Credential {
    identifier: String,
    secret: String,
}

impl Credential {
    /// Create a credential
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    /// Account identifier (the login e-mail)
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Secret
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Read both fields from the environment variables named in `auth`
    ///
    /// Returns `None` unless both are set and non-empty.
    pub fn from_env(auth: &AuthConfig) -> Option<Self> {
        let identifier = env_value(&auth.username_env)?;
        let secret = env_value(&auth.password_env)?;
        Some(Self::new(identifier, secret))
    }

    /// Read each field from the environment, prompting for whatever is missing
    ///
    /// The secret prompt goes through [`Prompt::read_secret`], which must not echo.
    pub fn from_env_or_prompt(auth: &AuthConfig, prompt: &dyn Prompt) -> Result<Self> {
        let identifier = match env_value(&auth.username_env) {
            Some(value) => value,
            None => prompt.read_line("Enter Qualer Email: ")?,
        };
        let secret = match env_value(&auth.password_env) {
            Some(value) => value,
            None => prompt.read_secret("Enter Qualer Password: ")?,
        };

        if identifier.trim().is_empty() || secret.is_empty() {
            return Err(Error::Authentication {
                message: "no credentials supplied".into(),
            });
        }
        Ok(Self::new(identifier.trim(), secret))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Interactive source for credentials missing from the environment
pub trait Prompt {
    /// Read one line of visible input
    fn read_line(&self, message: &str) -> io::Result<String>;

    /// Read one line without echoing it
    fn read_secret(&self, message: &str) -> io::Result<String>;
}

/// [`Prompt`] on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn read_line(&self, message: &str) -> io::Result<String> {
        print!("{}", message);
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_secret(&self, message: &str) -> io::Result<String> {
        rpassword::prompt_password(message)
    }
}

/// Result of one navigation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    /// Where the navigation ended, after redirects
    pub location: Url,
    /// The page's primary text content
    pub text: String,
}

/// A capability that can navigate and log in
///
/// Implementations must be safe for concurrent navigations; the fan-out issues many at
/// once through one shared instance.
#[async_trait::async_trait]
pub trait Browser: Send + Sync {
    /// Load `url` and return the final location and primary text content
    async fn open(&self, url: &Url) -> Result<Page>;

    /// Fill in and submit the login form, returning the location reached afterwards
    async fn submit_login(
        &self,
        login_url: &Url,
        auth: &AuthConfig,
        credential: &Credential,
    ) -> Result<Url>;

    /// Release the capability; later navigations fail
    async fn close(&self);
}

/// The one authenticated browsing context of a run
pub struct Session {
    browser: Arc<dyn Browser>,
    auth: AuthConfig,
    login_url: Url,
    credential: Credential,
    /// Serializes logins so concurrent expiry detections coalesce
    login_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful login; 0 means never logged in
    generation: AtomicU64,
}

impl Session {
    /// Create a session; no request is made until the first login or navigation
    pub fn new(
        browser: Arc<dyn Browser>,
        auth: AuthConfig,
        login_url: Url,
        credential: Credential,
    ) -> Self {
        Self {
            browser,
            auth,
            login_url,
            credential,
            login_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Log in unless a login has already succeeded
    pub async fn ensure_authenticated(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.generation.load(Ordering::Acquire) == 0 {
            self.login().await?;
        }
        Ok(())
    }

    /// Load `url`, re-authenticating and reloading once if it lands on the login page
    pub async fn navigate(&self, url: &Url) -> Result<Page> {
        let seen = self.generation.load(Ordering::Acquire);
        let page = self.browser.open(url).await?;
        if !self.auth.is_login_location(page.location.as_str()) {
            return Ok(page);
        }

        tracing::warn!(url = %url, "Session expired or re-authentication needed, logging in again");
        self.renew(seen).await?;

        let page = self.browser.open(url).await?;
        if self.auth.is_login_location(page.location.as_str()) {
            return Err(Error::SessionExpired {
                url: url.to_string(),
            });
        }
        Ok(page)
    }

    /// Number of successful logins so far
    pub fn login_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Release the browsing capability
    pub async fn close(&self) {
        self.browser.close().await;
    }

    /// Re-login unless another task already did so after `seen`
    async fn renew(&self, seen: u64) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            tracing::debug!("Session already renewed by a concurrent task");
            return Ok(());
        }
        self.login().await
    }

    /// Submit the login form. Caller holds `login_lock`.
    async fn login(&self) -> Result<()> {
        let submitted = self
            .browser
            .submit_login(&self.login_url, &self.auth, &self.credential)
            .await;

        let location = match submitted {
            Ok(location) => location,
            Err(e) => {
                tracing::error!(error = %e, "Login page unreachable");
                self.browser.close().await;
                return Err(match e {
                    Error::Authentication { .. } => e,
                    other => Error::Authentication {
                        message: format!("login page unreachable: {}", other),
                    },
                });
            }
        };

        if self.auth.is_login_location(location.as_str()) {
            tracing::error!(location = %location, "Login failed, check credentials");
            self.browser.close().await;
            return Err(Error::Authentication {
                message: format!("still on the login page after submit ({})", location),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            user = %self.credential.identifier(),
            generation,
            "Logged in"
        );
        Ok(())
    }
}

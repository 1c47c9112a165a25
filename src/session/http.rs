//! Browsing over plain HTTP with a shared cookie jar.
//!
//! Navigations are GET requests; the "rendered" text is the response body, or the
//! contents of its `<pre>` element when the server wraps JSON in an HTML page.
//! Session cookies can be seeded into the jar and exported from it, so a session
//! established elsewhere can be reused and vice versa.

use crate::config::{AuthConfig, Config, CookieConfig};
use crate::error::{Error, Result};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

use super::{Browser, Credential, Page};

/// [`super::Browser`] backed by `reqwest`
///
/// The client is `Send + Sync` and pools connections, so one instance serves every
/// concurrent fetch task.
pub struct HttpBrowser {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
    login_url: Url,
    timeout: Duration,
    markup: Markup,
    closed: AtomicBool,
}

impl HttpBrowser {
    /// Build a client from `config.http`, seeding the jar with `config.http.cookies`
    pub fn new(config: &Config) -> Result<Self> {
        let base = config.base()?;
        let jar = Arc::new(Jar::default());
        for cookie in &config.http.cookies {
            add_cookie(&jar, &base, cookie);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.http.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::Config {
                message: format!("invalid header name {:?}: {}", name, e),
                key: Some("http.headers".into()),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| Error::Config {
                message: format!("invalid value for header {}: {}", name, e),
                key: Some("http.headers".into()),
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .default_headers(headers)
            .user_agent(config.http.user_agent.clone())
            .timeout(config.http.navigation_timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            jar,
            base,
            login_url: config.login_url()?,
            timeout: config.http.navigation_timeout,
            markup: Markup::new()?,
            closed: AtomicBool::new(false),
        })
    }

    /// Build a client and transplant existing session cookies into it
    pub fn with_cookies(config: &Config, cookies: &[CookieConfig]) -> Result<Self> {
        let browser = Self::new(config)?;
        for cookie in cookies {
            browser.add_cookie(cookie);
        }
        Ok(browser)
    }

    /// Add one cookie scoped to the base URL
    pub fn add_cookie(&self, cookie: &CookieConfig) {
        add_cookie(&self.jar, &self.base, cookie);
    }

    /// Current `Cookie` header for the base URL, for handing the session to another client
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.base)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    fn classify(&self, url: &Url, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::NavigationTimeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else if e.is_body() || e.is_decode() {
            Error::TransientRender(format!("response from {} was cut off: {}", url, e))
        } else {
            Error::Network(e)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Other("browser has been closed".into()));
        }
        Ok(())
    }
}

fn add_cookie(jar: &Jar, base: &Url, cookie: &CookieConfig) {
    jar.add_cookie_str(&format!("{}={}; Path=/", cookie.name, cookie.value), base);
}

#[async_trait::async_trait]
impl Browser for HttpBrowser {
    async fn open(&self, url: &Url) -> Result<Page> {
        self.ensure_open()?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            // Treated like a redirect to the login page so the session renews itself
            return Ok(Page {
                location: self.login_url.clone(),
                text: String::new(),
            });
        }
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(Error::TransientRender(format!(
                "{} answered HTTP {}",
                url,
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(Error::Other(format!(
                "{} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }

        let location = response.url().clone();
        let body = response.text().await.map_err(|e| self.classify(url, e))?;
        Ok(Page {
            location,
            text: self.markup.primary_text(&body),
        })
    }

    async fn submit_login(
        &self,
        login_url: &Url,
        auth: &AuthConfig,
        credential: &Credential,
    ) -> Result<Url> {
        self.ensure_open()?;

        let login_page = self
            .client
            .get(login_url.clone())
            .send()
            .await
            .map_err(|e| self.classify(login_url, e))?;
        if !login_page.status().is_success() {
            return Err(Error::Authentication {
                message: format!("login page returned HTTP {}", login_page.status().as_u16()),
            });
        }
        let body = login_page
            .text()
            .await
            .map_err(|e| self.classify(login_url, e))?;

        let mut form = vec![
            (
                auth.username_field.clone(),
                credential.identifier().to_string(),
            ),
            (auth.password_field.clone(), credential.secret().to_string()),
        ];
        if let Some(token) = self.markup.hidden_input(&body, &auth.token_field) {
            form.push((auth.token_field.clone(), token));
        }

        let response = self
            .client
            .post(login_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| self.classify(login_url, e))?;

        Ok(response.url().clone())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("HTTP browser closed");
        }
    }
}

/// Compiled patterns for the little HTML this client has to look at
struct Markup {
    pre: Regex,
    input: Regex,
    value: Regex,
}

impl Markup {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Other(format!("invalid pattern {:?}: {}", pattern, e)))
        };
        Ok(Self {
            pre: compile(r"(?is)<pre[^>]*>(.*?)</pre>")?,
            input: compile(r"(?is)<input\b[^>]*>")?,
            value: compile(r#"(?i)\bvalue\s*=\s*"([^"]*)""#)?,
        })
    }

    /// Body of the first `<pre>` element, unescaped; the whole body otherwise
    fn primary_text(&self, body: &str) -> String {
        match self.pre.captures(body).and_then(|c| c.get(1)) {
            Some(inner) => unescape_html(inner.as_str()),
            None => body.trim().to_string(),
        }
    }

    /// Value of the `<input>` whose name is `name`
    fn hidden_input(&self, html: &str, name: &str) -> Option<String> {
        let name_attr = format!("name=\"{}\"", name);
        self.input
            .find_iter(html)
            .map(|tag| tag.as_str())
            .find(|tag| tag.contains(&name_attr))
            .and_then(|tag| self.value.captures(tag))
            .and_then(|c| c.get(1))
            .map(|v| unescape_html(v.as_str()))
    }
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

//! Scripted browser and session fixtures shared by unit tests.

use crate::config::{AuthConfig, Config};
use crate::error::{Error, Result};
use crate::session::{Browser, Credential, Page, Session};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub(crate) const BASE: &str = "https://qualer.test";

/// One scripted navigation outcome
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    /// Page text served at the requested location
    Text(String),
    /// Navigation lands on the login page
    LoginRedirect,
    /// Content detached while being read
    Stale,
    /// Navigation timed out
    Timeout,
}

/// [`Browser`] serving canned replies per URL
///
/// Each URL has a queue of replies; the last one repeats once the queue drains.
pub(crate) struct ScriptedBrowser {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    login_succeeds: AtomicBool,
    opens: AtomicUsize,
    logins: AtomicUsize,
    closed: AtomicBool,
    visits: Mutex<Vec<String>>,
}

impl ScriptedBrowser {
    pub(crate) fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            login_succeeds: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            visits: Mutex::new(Vec::new()),
        }
    }

    /// Queue replies for `url` (absolute, or a path joined onto [`BASE`])
    pub(crate) fn script(&self, url: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .insert(absolute(url), replies.into_iter().collect());
    }

    /// Serve `text` for `url` on every navigation
    pub(crate) fn serve(&self, url: &str, text: &str) {
        self.script(url, vec![Reply::Text(text.to_string())]);
    }

    pub(crate) fn reject_logins(&self) {
        self.login_succeeds.store(false, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

pub(crate) fn absolute(url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("{}{}", BASE, url)
    }
}

#[async_trait::async_trait]
impl Browser for ScriptedBrowser {
    async fn open(&self, url: &Url) -> Result<Page> {
        if self.is_closed() {
            return Err(Error::Other("browser has been closed".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.visits.lock().unwrap().push(url.to_string());

        match self.next_reply(url.as_str()) {
            Some(Reply::Text(text)) => Ok(Page {
                location: url.clone(),
                text,
            }),
            Some(Reply::LoginRedirect) => Ok(Page {
                location: Url::parse(&format!("{}/login?ReturnUrl=%2F", BASE)).unwrap(),
                text: "<html>Sign in</html>".into(),
            }),
            Some(Reply::Stale) => Err(Error::TransientRender(format!(
                "element detached reading {}",
                url
            ))),
            Some(Reply::Timeout) => Err(Error::NavigationTimeout {
                url: url.to_string(),
                timeout: Duration::from_secs(30),
            }),
            None => Err(Error::Other(format!("no scripted reply for {}", url))),
        }
    }

    async fn submit_login(
        &self,
        login_url: &Url,
        _auth: &AuthConfig,
        _credential: &Credential,
    ) -> Result<Url> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.login_succeeds.load(Ordering::SeqCst) {
            Ok(Url::parse(&format!("{}/Dashboard", BASE)).unwrap())
        } else {
            Ok(login_url.clone())
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn test_config() -> Config {
    let mut config = Config {
        base_url: BASE.into(),
        ..Default::default()
    };
    config.retry.initial_delay = Duration::from_millis(5);
    config
}

pub(crate) fn test_session(browser: Arc<ScriptedBrowser>) -> Arc<Session> {
    let config = test_config();
    Arc::new(Session::new(
        browser,
        config.auth.clone(),
        config.login_url().unwrap(),
        Credential::new("user@example.com", "hunter2"),
    ))
}

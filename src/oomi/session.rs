use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use reqwest::{
    blocking::Client,
    header::{UPGRADE_INSECURE_REQUESTS, USER_AGENT},
    StatusCode,
};
use reqwest_cookie_store::CookieStoreMutex;

use crate::error::SyncError;

const BROWSER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

lazy_static! {
    static ref VERIFICATION_TOKEN: Regex =
        Regex::new(r#"<input name="__RequestVerificationToken" type="hidden" value="([\w-]+)" />"#)
            .unwrap();
}

/// The Oomi online service before login.  Only [`Portal::login`] leads to an
/// [`AuthenticatedSession`], which every data fetch requires.
#[derive(Debug, Clone)]
pub struct Portal {
    pub base_url: String,
    pub timeout: Duration,
}

/// A logged-in portal session.  Lives for one sync cycle, after which the
/// portal may expire it at any time.
pub struct AuthenticatedSession {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    cookies: Arc<CookieStoreMutex>,
    username: String,
    verification_token: String,
}

impl Portal {
    pub fn new(base_url: &str) -> Portal {
        Portal {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    fn landing_url(&self) -> String {
        format!("{}/eServices/Online/IndexNoAuth", self.base_url)
    }

    fn login_url(&self) -> String {
        format!("{}/eServices/Online/Login", self.base_url)
    }

    /// Log in with a fresh cookie jar.
    ///
    /// Fetches the anti-forgery token from the landing page, posts the
    /// credentials, and checks that the returned page was rendered for
    /// `username`.  No retries.
    pub fn login(&self, username: &str, password: &str) -> Result<AuthenticatedSession, SyncError> {
        let cookies = Arc::new(CookieStoreMutex::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .timeout(self.timeout)
            .build()
            .map_err(|e| SyncError::Authentication(format!("cannot build http client: {}", e)))?;

        let landing = client
            .get(self.landing_url())
            .header(USER_AGENT, BROWSER_AGENT)
            .header(UPGRADE_INSECURE_REQUESTS, "1")
            .send()
            .and_then(|r| r.text())
            .map_err(|e| SyncError::Authentication(format!("landing page: {}", e)))?;
        let token = extract_verification_token(&landing).ok_or_else(|| {
            error!("No verification token found");
            SyncError::Authentication("no verification token found".to_string())
        })?;

        info!("login as {}", username);
        let response = client
            .post(self.login_url())
            .header(USER_AGENT, BROWSER_AGENT)
            .form(&[
                ("UserName", username),
                ("Password", password),
                ("__RequestVerificationToken", token.as_str()),
            ])
            .send()
            .map_err(|e| SyncError::Authentication(format!("login request: {}", e)))?;
        let status = response.status();
        if status != StatusCode::OK {
            error!("Login failed, status code: {}", status);
            return Err(SyncError::Authentication(format!("status code {}", status)));
        }
        let body = response
            .text()
            .map_err(|e| SyncError::Authentication(format!("login response: {}", e)))?;
        if !is_logged_in_as(&body, username) {
            error!("Login failed, username not found in response");
            return Err(SyncError::Authentication(format!(
                "response is not for user {}",
                username
            )));
        }

        if let Ok(store) = cookies.lock() {
            debug!("session holds {} cookies", store.iter_any().count());
        }
        info!("Login successful");
        Ok(AuthenticatedSession {
            client,
            base_url: self.base_url.clone(),
            cookies,
            username: username.to_string(),
            verification_token: token,
        })
    }
}

impl AuthenticatedSession {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The token that gated the login.  Data requests don't send it.
    pub fn verification_token(&self) -> &str {
        &self.verification_token
    }

    /// Number of cookies in the session jar, `None` if the jar is poisoned.
    pub fn cookie_count(&self) -> Option<usize> {
        match self.cookies.lock() {
            Ok(store) => Some(store.iter_any().count()),
            Err(e) => {
                warn!("Cookie jar of {} is poisoned: {}", self.username, e);
                None
            }
        }
    }
}

pub fn extract_verification_token(html: &str) -> Option<String> {
    VERIFICATION_TOKEN
        .captures(html)
        .map(|caps| caps[1].to_string())
}

/// The portal embeds `userName = "<name>";` in pages rendered for a
/// logged-in user.
pub fn is_logged_in_as(html: &str, username: &str) -> bool {
    html.contains(&format!("userName = \"{}\";", username))
}

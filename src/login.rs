use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::browser::{wait_for_url, wait_visible, Page, StoredCookie};
use crate::config::Config;

const PHONE_SWITCH: &str = ".btn-sign-switch.phone-switch";
const QR_SWITCH: &str = ".btn-sign-switch.ewm-switch";
const QR_BOX: &str = ".qr-img-box";
const SCAN_STEP_TITLE: &str = ".login-step-title";
const SCANNED_MARKER: &str = "扫描成功";
const EMAIL_DIALOG: &str = "div.dialog-container";
const EMAIL_DIALOG_CLOSE: &str = "div.dialog-container i.icon-close";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Could not reach the QR challenge after {0} attempts")]
    ChallengeUnavailable(u32),
    #[error("Login failed, still at {last_url}")]
    LoginFailed { last_url: String },
    #[error(transparent)]
    Page(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoginState {
    Unauthenticated,
    CredentialLoaded,
    ChallengeDisplayed,
    ChallengeRefreshing,
    Authenticated,
    Failed,
}

/// Outcome of a best-effort UI interaction; only real page errors propagate.
#[derive(Debug, PartialEq)]
pub enum Dismiss {
    Closed,
    NotPresent,
}

/// Establishes an authenticated session: cached cookies first, then the
/// QR-challenge loop. The challenge surface renders in more than one layout
/// and the code silently expires, hence the two-level bounded retry.
pub struct Authenticator<'a> {
    cfg: &'a Config,
}

impl<'a> Authenticator<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Authenticator { cfg }
    }

    pub async fn login(&self, page: &dyn Page) -> Result<(), AuthError> {
        let mut state = LoginState::Unauthenticated;
        let mut trials = 0u32;
        loop {
            state = match state {
                LoginState::Unauthenticated => {
                    self.apply_cached_credential(page).await?;
                    LoginState::CredentialLoaded
                }
                LoginState::CredentialLoaded => {
                    page.goto(&self.cfg.login_url).await?;
                    let url = page.url().await?;
                    if self.is_authenticated_url(&url) {
                        info!(url, "already logged in, skipping challenge");
                        LoginState::Authenticated
                    } else {
                        info!(url, "not logged in, starting QR challenge");
                        LoginState::ChallengeDisplayed
                    }
                }
                LoginState::ChallengeDisplayed => {
                    if trials >= self.cfg.max_login_trials {
                        LoginState::Failed
                    } else {
                        trials += 1;
                        info!(trial = trials, "waiting for QR scan");
                        self.run_challenge(page).await?
                    }
                }
                LoginState::ChallengeRefreshing => {
                    self.refresh_challenge(page).await?;
                    LoginState::ChallengeDisplayed
                }
                LoginState::Authenticated => {
                    self.save_credential(page).await;
                    self.dismiss_first_run_dialog(page).await?;
                    info!("login complete");
                    return Ok(());
                }
                LoginState::Failed => {
                    // Final check: a confirmation can land on the security
                    // interstitial instead of the recommend page.
                    let last_url = page.url().await.unwrap_or_default();
                    if self.is_authenticated_url(&last_url) {
                        LoginState::Authenticated
                    } else {
                        return Err(AuthError::LoginFailed { last_url });
                    }
                }
            };
        }
    }

    /// One outer challenge trial: reach the QR layout, wait for the scan,
    /// then wait for phone-side confirmation.
    async fn run_challenge(&self, page: &dyn Page) -> Result<LoginState, AuthError> {
        self.switch_to_qr(page).await?;

        if !self.wait_scanned(page).await? {
            info!("QR not scanned in time, refreshing challenge");
            return Ok(LoginState::ChallengeRefreshing);
        }

        info!("QR scanned, waiting for confirmation on the phone");
        let confirmed = wait_for_url(
            page,
            &self.cfg.recommend_url,
            self.cfg.confirm_timeout(),
            self.cfg.poll(),
        )
        .await?;
        if confirmed {
            Ok(LoginState::Authenticated)
        } else {
            info!("confirmation timed out, refreshing challenge");
            Ok(LoginState::ChallengeRefreshing)
        }
    }

    /// Bring the login surface into QR mode. Some layouts show the QR toggle
    /// directly, others need a double toggle through the phone-login pane.
    async fn switch_to_qr(&self, page: &dyn Page) -> Result<(), AuthError> {
        for _ in 0..self.cfg.max_switch_attempts {
            tokio::time::sleep(self.cfg.settle()).await;

            if page.is_visible(PHONE_SWITCH).await? {
                page.click(PHONE_SWITCH).await?;
                tokio::time::sleep(self.cfg.settle()).await;
                if page.is_visible(QR_SWITCH).await? {
                    page.click(QR_SWITCH).await?;
                    tokio::time::sleep(self.cfg.settle()).await;
                    if page.is_visible(QR_BOX).await? {
                        return Ok(());
                    }
                }
            } else if page.is_visible(QR_SWITCH).await? {
                page.click(QR_SWITCH).await?;
                tokio::time::sleep(self.cfg.settle()).await;
                if page.is_visible(QR_BOX).await? {
                    return Ok(());
                }
            }
        }
        Err(AuthError::ChallengeUnavailable(self.cfg.max_switch_attempts))
    }

    /// Bounded wait for the "scanned" step title; timing out is expected and
    /// recoverable.
    async fn wait_scanned(&self, page: &dyn Page) -> Result<bool, AuthError> {
        let deadline = tokio::time::Instant::now() + self.cfg.scan_timeout();
        loop {
            if page.is_visible(SCAN_STEP_TITLE).await? {
                if let Some(text) = page.text(SCAN_STEP_TITLE).await? {
                    if text.contains(SCANNED_MARKER) {
                        return Ok(true);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.cfg.poll()).await;
        }
    }

    /// Refresh an expired QR code by toggling away and back; if the surface
    /// changed under us, re-navigate to the login page instead.
    async fn refresh_challenge(&self, page: &dyn Page) -> Result<(), AuthError> {
        if page.is_visible(PHONE_SWITCH).await? {
            page.click(PHONE_SWITCH).await?;
            tokio::time::sleep(self.cfg.settle()).await;
            if page.is_visible(QR_SWITCH).await? {
                page.click(QR_SWITCH).await?;
            }
        } else {
            page.goto(&self.cfg.login_url).await?;
        }
        Ok(())
    }

    fn is_authenticated_url(&self, url: &str) -> bool {
        url.starts_with(&self.cfg.recommend_url)
            || url.starts_with(&self.cfg.security_url)
            || url.trim_end_matches('/') == self.cfg.base_url.trim_end_matches('/')
    }

    /// Load and apply a previously persisted credential. Missing or corrupt
    /// cache files are tolerated.
    async fn apply_cached_credential(&self, page: &dyn Page) -> Result<(), AuthError> {
        match load_cookies(&self.cfg.cookies_file) {
            Some(cookies) if !cookies.is_empty() => {
                info!(count = cookies.len(), "applying cached cookies");
                page.set_cookies(&cookies).await?;
            }
            Some(_) => info!("cookie cache is empty"),
            None => info!("no cookie cache, starting unauthenticated"),
        }
        Ok(())
    }

    /// Persist the session credential; failure here must not undo a
    /// successful login, so it is logged and swallowed.
    async fn save_credential(&self, page: &dyn Page) {
        match page.cookies().await {
            Ok(cookies) => {
                if let Err(e) = save_cookies(&self.cfg.cookies_file, &cookies) {
                    warn!(error = %e, "could not persist cookies");
                } else {
                    info!(count = cookies.len(), "cookies saved");
                }
            }
            Err(e) => warn!(error = %e, "could not read session cookies"),
        }
    }

    /// Close the first-run "set up email" dialog if it shows up.
    pub async fn dismiss_first_run_dialog(&self, page: &dyn Page) -> Result<Dismiss, AuthError> {
        let present = wait_visible(
            page,
            EMAIL_DIALOG,
            self.cfg.dialog_timeout(),
            self.cfg.poll(),
        )
        .await?;
        if !present {
            info!("first-run dialog not shown");
            return Ok(Dismiss::NotPresent);
        }
        page.click(EMAIL_DIALOG_CLOSE).await?;
        info!("first-run dialog closed");
        Ok(Dismiss::Closed)
    }
}

fn load_cookies(path: &Path) -> Option<Vec<StoredCookie>> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(cookies) => Some(cookies),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cookie cache unreadable, ignoring");
            None
        }
    }
}

fn save_cookies(path: &Path, cookies: &[StoredCookie]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(cookies)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ──

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration. Defaults match the zhipin.com endpoints; every field
/// can be overridden with a `BOSS_`-prefixed environment variable
/// (e.g. `BOSS_DATA_DIR`, `BOSS_SCAN_TIMEOUT_MS`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_recommend_url")]
    pub recommend_url: String,
    #[serde(default = "default_security_url")]
    pub security_url: String,
    #[serde(default = "default_interested_url")]
    pub interested_url: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_cookies_file")]
    pub cookies_file: PathBuf,

    /// First-run dialog dismissal wait.
    #[serde(default = "default_dialog_timeout_ms")]
    pub dialog_timeout_ms: u64,
    /// Wait for the "challenge scanned" indicator.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Wait for phone-side confirmation after a scan.
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    /// Wait for the listing container / detail page regions.
    #[serde(default = "default_page_load_timeout_ms")]
    pub page_load_timeout_ms: u64,
    /// Settle delay between UI interactions.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Politeness delay after each detail-page visit.
    #[serde(default = "default_politeness_ms")]
    pub politeness_ms: u64,
    /// Polling interval for bounded waits.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Outer QR-challenge trials before giving up.
    #[serde(default = "default_max_login_trials")]
    pub max_login_trials: u32,
    /// Inner attempts to toggle the login surface into QR mode.
    #[serde(default = "default_max_switch_attempts")]
    pub max_switch_attempts: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("BOSS"))
            .build()
            .context("Failed to read environment configuration")?
            .try_deserialize()
            .context("Invalid configuration value")
    }

    pub fn dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.dialog_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn politeness(&self) -> Duration {
        Duration::from_millis(self.politeness_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: default_base_url(),
            login_url: default_login_url(),
            recommend_url: default_recommend_url(),
            security_url: default_security_url(),
            interested_url: default_interested_url(),
            data_dir: default_data_dir(),
            cookies_file: default_cookies_file(),
            dialog_timeout_ms: default_dialog_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            page_load_timeout_ms: default_page_load_timeout_ms(),
            settle_ms: default_settle_ms(),
            politeness_ms: default_politeness_ms(),
            poll_ms: default_poll_ms(),
            max_login_trials: default_max_login_trials(),
            max_switch_attempts: default_max_switch_attempts(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.zhipin.com".to_string()
}

fn default_login_url() -> String {
    "https://www.zhipin.com/web/user/".to_string()
}

fn default_recommend_url() -> String {
    "https://www.zhipin.com/web/geek/job-recommend".to_string()
}

fn default_security_url() -> String {
    "https://www.zhipin.com/web/common/security-check.html".to_string()
}

fn default_interested_url() -> String {
    "https://www.zhipin.com/web/geek/recommend?tab=4&sub=1&page=1&tag=4&ka=header-personal"
        .to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("boss_data")
}

fn default_cookies_file() -> PathBuf {
    PathBuf::from("cookies.json")
}

fn default_dialog_timeout_ms() -> u64 {
    5_000
}

fn default_scan_timeout_ms() -> u64 {
    20_000
}

fn default_confirm_timeout_ms() -> u64 {
    60_000
}

fn default_page_load_timeout_ms() -> u64 {
    30_000
}

fn default_settle_ms() -> u64 {
    1_000
}

fn default_politeness_ms() -> u64 {
    1_000
}

fn default_poll_ms() -> u64 {
    250
}

fn default_max_login_trials() -> u32 {
    5
}

fn default_max_switch_attempts() -> u32 {
    5
}

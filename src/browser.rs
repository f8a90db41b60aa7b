use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cookie-equivalent session credential, persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
}

/// Primitives the authenticator, walker, and extraction pipeline need from a
/// browser page. Kept minimal so tests can script a fake implementation.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn url(&self) -> Result<String>;
    async fn is_visible(&self, selector: &str) -> Result<bool>;
    async fn text(&self, selector: &str) -> Result<Option<String>>;
    async fn attr(&self, selector: &str, name: &str) -> Result<Option<String>>;
    async fn attr_all(&self, selector: &str, name: &str) -> Result<Vec<String>>;
    async fn click(&self, selector: &str) -> Result<()>;
    /// Full serialized markup of the current document.
    async fn content(&self) -> Result<String>;
    /// Open `url` in an isolated tab; the caller must `close_tab` it.
    async fn open_tab(&self, url: &str) -> Result<Box<dyn Page>>;
    async fn close_tab(&self) -> Result<()>;
    async fn cookies(&self) -> Result<Vec<StoredCookie>>;
    async fn set_cookies(&self, cookies: &[StoredCookie]) -> Result<()>;
}

/// Poll until `selector` is visible or `timeout` elapses. `Ok(false)` is the
/// bounded-timeout outcome, distinct from a page error.
pub async fn wait_visible(
    page: &dyn Page,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if page.is_visible(selector).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Poll until the page URL starts with `prefix` or `timeout` elapses.
pub async fn wait_for_url(
    page: &dyn Page,
    prefix: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if page.url().await?.starts_with(prefix) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// A running Chrome instance plus the event handler task that drives it.
pub struct Session {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

impl Session {
    /// Launch Chrome and return the session together with its initial page.
    pub async fn launch(headless: bool) -> Result<(Session, Box<dyn Page>)> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|e| anyhow!(e))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .context("Failed to launch Chrome")?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let browser = Arc::new(Mutex::new(browser));
        let page = {
            let guard = browser.lock().await;
            guard
                .new_page("about:blank")
                .await
                .context("Failed to open initial page")?
        };

        let session = Session {
            browser: browser.clone(),
            handler,
        };
        Ok((session, Box::new(ChromePage { page, browser })))
    }

    /// Shut the browser down; always called, even after a failed run.
    pub async fn close(self) -> Result<()> {
        {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
        }
        self.handler.abort();
        Ok(())
    }
}

struct ChromePage {
    page: chromiumoxide::Page,
    browser: Arc<Mutex<Browser>>,
}

#[async_trait]
impl Page for ChromePage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigation to {} failed", url))?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn text(&self, selector: &str) -> Result<Option<String>> {
        match self.page.find_element(selector).await {
            Ok(element) => Ok(element.inner_text().await?),
            Err(_) => Ok(None),
        }
    }

    async fn attr(&self, selector: &str, name: &str) -> Result<Option<String>> {
        match self.page.find_element(selector).await {
            Ok(element) => Ok(element.attribute(name).await?),
            Err(_) => Ok(None),
        }
    }

    async fn attr_all(&self, selector: &str, name: &str) -> Result<Vec<String>> {
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(_) => return Ok(Vec::new()),
        };
        let mut values = Vec::new();
        for element in elements {
            if let Some(value) = element.attribute(name).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("No element matching {}", selector))?
            .click()
            .await?;
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn open_tab(&self, url: &str) -> Result<Box<dyn Page>> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page(url)
                .await
                .with_context(|| format!("Failed to open tab for {}", url))?
        };
        debug!(url, "opened detail tab");
        Ok(Box::new(ChromePage {
            page,
            browser: self.browser.clone(),
        }))
    }

    async fn close_tab(&self) -> Result<()> {
        self.page.clone().close().await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<StoredCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: Some(c.expires),
                http_only: Some(c.http_only),
                secure: Some(c.secure),
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: &[StoredCookie]) -> Result<()> {
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone());
            if let Some(expires) = cookie.expires {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }
            if let Some(http_only) = cookie.http_only {
                builder = builder.http_only(http_only);
            }
            if let Some(secure) = cookie.secure {
                builder = builder.secure(secure);
            }
            params.push(builder.build().map_err(|e| anyhow!(e))?);
        }
        self.page.set_cookies(params).await?;
        Ok(())
    }
}

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::browser::{wait_visible, Page};
use crate::config::Config;
use crate::extract;
use crate::store::{JobRecord, RunStore};

const JOB_LIST: &str = "ul.user-jobs-ul";
const JOB_LINK: &str = "ul.user-jobs-ul li.item-boss div.job-name a.name";
const NEXT_CONTROL: &str = "div.pagination-area a:has(i.ui-icon-arrow-right)";
const DETAIL_READY: &str = "div.info-primary";
const DISABLED_MARKER: &str = "disabled";

enum NextPage {
    Absent,
    Disabled,
    Advanced,
}

/// Walk every page of the interested-jobs listing, visiting each item in an
/// isolated tab and appending extracted records as they are produced.
/// Returns the number of records captured; a page that fails to load stops
/// the walk but keeps everything collected so far.
pub async fn walk(page: &dyn Page, store: &RunStore, cfg: &Config) -> Result<usize> {
    page.goto(&cfg.interested_url).await?;
    info!(url = %cfg.interested_url, "opened interested-jobs listing");

    let mut captured = 0usize;
    let mut page_number = 1u32;

    loop {
        let loaded = wait_visible(page, JOB_LIST, cfg.page_load_timeout(), cfg.poll()).await?;
        if !loaded {
            warn!(
                page = page_number,
                "listing did not load in time, stopping with partial results"
            );
            break;
        }
        // Give client-side rendering a moment to fill the list.
        tokio::time::sleep(cfg.settle()).await;

        // Snapshot the hrefs before navigating anywhere; once we leave the
        // page the remaining element references are stale.
        let hrefs = page.attr_all(JOB_LINK, "href").await?;
        if hrefs.is_empty() {
            info!(page = page_number, "no items on this page, walk complete");
            break;
        }
        info!(page = page_number, items = hrefs.len(), "visiting job links");

        let pb = ProgressBar::new(hrefs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=> "),
        );
        for href in &hrefs {
            let url = absolutize(&cfg.base_url, href);
            match visit_item(page, &url, cfg).await {
                Ok(Some(record)) => {
                    pb.set_message(record.title.clone());
                    store.append(&record)?;
                    captured += 1;
                }
                Ok(None) => warn!(url = %url, "could not extract job details, skipping"),
                Err(e) => warn!(url = %url, error = %e, "failed to visit job page, skipping"),
            }
            pb.inc(1);
            tokio::time::sleep(cfg.politeness()).await;
        }
        pb.finish_and_clear();

        match advance(page).await? {
            NextPage::Absent => {
                info!("no next-page control, walk complete");
                break;
            }
            NextPage::Disabled => {
                info!("next-page control disabled, reached the last page");
                break;
            }
            NextPage::Advanced => page_number += 1,
        }
    }

    info!(captured, pages = page_number, "pagination walk finished");
    Ok(captured)
}

/// Open one listing in its own tab and extract it. The tab is closed whatever
/// happens; failures are the caller's to log and skip.
async fn visit_item(page: &dyn Page, url: &str, cfg: &Config) -> Result<Option<JobRecord>> {
    let tab = page.open_tab(url).await?;
    let outcome = read_detail(tab.as_ref(), cfg).await;
    if let Err(e) = tab.close_tab().await {
        warn!(url = %url, error = %e, "failed to close detail tab");
    }
    outcome
}

async fn read_detail(tab: &dyn Page, cfg: &Config) -> Result<Option<JobRecord>> {
    if !wait_visible(tab, DETAIL_READY, cfg.page_load_timeout(), cfg.poll()).await? {
        return Ok(None);
    }
    let html = tab.content().await?;
    let url = tab.url().await?;
    Ok(extract::job_record(&html, &url))
}

async fn advance(page: &dyn Page) -> Result<NextPage> {
    if !page.is_visible(NEXT_CONTROL).await? {
        return Ok(NextPage::Absent);
    }
    let class = page.attr(NEXT_CONTROL, "class").await?.unwrap_or_default();
    if class.contains(DISABLED_MARKER) {
        return Ok(NextPage::Disabled);
    }
    page.click(NEXT_CONTROL).await?;
    Ok(NextPage::Advanced)
}

fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::browser::StoredCookie;
    use crate::store::read_table;

    fn job_html(title: &str) -> String {
        format!(
            "<html><body><div class=\"info-primary\"><h1>{}</h1>\
             <span class=\"salary\">20-30K</span>\
             <p><a class=\"text-city\">深圳</a>\
             <span class=\"text-experiece\">3-5年</span>\
             <span class=\"text-degree\">本科</span></p></div>\
             <div class=\"job-detail-section\"><h3>职位描述</h3>\
             <div class=\"job-sec-text\">写代码<br>改bug</div></div></body></html>",
            title
        )
    }

    struct BoardPage {
        loads: bool,
        hrefs: Vec<&'static str>,
        next_class: Option<&'static str>,
    }

    /// Scripted listing surface: a sequence of pages plus a map of detail
    /// documents keyed by absolute URL.
    struct FakeBoard {
        pages: Vec<BoardPage>,
        current: Mutex<usize>,
        details: HashMap<String, String>,
        tabs_closed: Arc<AtomicUsize>,
    }

    impl FakeBoard {
        fn new(pages: Vec<BoardPage>, details: HashMap<String, String>) -> Self {
            FakeBoard {
                pages,
                current: Mutex::new(0),
                details,
                tabs_closed: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn page(&self) -> &BoardPage {
            &self.pages[*self.current.lock().unwrap()]
        }
    }

    #[async_trait]
    impl Page for FakeBoard {
        async fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn url(&self) -> Result<String> {
            Ok(String::new())
        }

        async fn is_visible(&self, selector: &str) -> Result<bool> {
            Ok(match selector {
                JOB_LIST => self.page().loads,
                NEXT_CONTROL => self.page().next_class.is_some(),
                _ => false,
            })
        }

        async fn text(&self, _selector: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn attr(&self, selector: &str, name: &str) -> Result<Option<String>> {
            if selector == NEXT_CONTROL && name == "class" {
                return Ok(self.page().next_class.map(str::to_string));
            }
            Ok(None)
        }

        async fn attr_all(&self, selector: &str, name: &str) -> Result<Vec<String>> {
            if selector == JOB_LINK && name == "href" {
                return Ok(self.page().hrefs.iter().map(|h| h.to_string()).collect());
            }
            Ok(Vec::new())
        }

        async fn click(&self, selector: &str) -> Result<()> {
            if selector == NEXT_CONTROL {
                *self.current.lock().unwrap() += 1;
            }
            Ok(())
        }

        async fn content(&self) -> Result<String> {
            Ok(String::new())
        }

        async fn open_tab(&self, url: &str) -> Result<Box<dyn Page>> {
            Ok(Box::new(FakeDetail {
                url: url.to_string(),
                html: self.details.get(url).cloned().unwrap_or_default(),
                closed: self.tabs_closed.clone(),
            }))
        }

        async fn close_tab(&self) -> Result<()> {
            Ok(())
        }

        async fn cookies(&self) -> Result<Vec<StoredCookie>> {
            Ok(Vec::new())
        }

        async fn set_cookies(&self, _cookies: &[StoredCookie]) -> Result<()> {
            Ok(())
        }
    }

    struct FakeDetail {
        url: String,
        html: String,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Page for FakeDetail {
        async fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn url(&self) -> Result<String> {
            Ok(self.url.clone())
        }

        async fn is_visible(&self, selector: &str) -> Result<bool> {
            Ok(selector == DETAIL_READY && self.html.contains("info-primary"))
        }

        async fn text(&self, _selector: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn attr(&self, _selector: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn attr_all(&self, _selector: &str, _name: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn click(&self, _selector: &str) -> Result<()> {
            Ok(())
        }

        async fn content(&self) -> Result<String> {
            Ok(self.html.clone())
        }

        async fn open_tab(&self, _url: &str) -> Result<Box<dyn Page>> {
            anyhow::bail!("detail tabs do not nest")
        }

        async fn close_tab(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cookies(&self) -> Result<Vec<StoredCookie>> {
            Ok(Vec::new())
        }

        async fn set_cookies(&self, _cookies: &[StoredCookie]) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            page_load_timeout_ms: 0,
            settle_ms: 0,
            politeness_ms: 0,
            poll_ms: 1,
            ..Config::default()
        }
    }

    fn detail_url(cfg: &Config, href: &str) -> String {
        absolutize(&cfg.base_url, href)
    }

    #[tokio::test]
    async fn walks_pages_in_order_until_next_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = RunStore::open(dir.path(), "run.csv").unwrap();

        let mut details = HashMap::new();
        details.insert(detail_url(&cfg, "/job_detail/a.html?lid=1"), job_html("甲"));
        details.insert(detail_url(&cfg, "/job_detail/b.html?lid=2"), job_html("乙"));
        details.insert(detail_url(&cfg, "/job_detail/c.html?lid=3"), job_html("丙"));

        let board = FakeBoard::new(
            vec![
                BoardPage {
                    loads: true,
                    hrefs: vec!["/job_detail/a.html?lid=1", "/job_detail/b.html?lid=2"],
                    next_class: Some("ui-icon-arrow-right"),
                },
                BoardPage {
                    loads: true,
                    hrefs: vec!["/job_detail/c.html?lid=3"],
                    next_class: Some("ui-icon-arrow-right disabled"),
                },
            ],
            details,
        );

        let captured = walk(&board, &store, &cfg).await.unwrap();
        assert_eq!(captured, 3);
        assert_eq!(board.tabs_closed.load(Ordering::SeqCst), 3);

        let rows = read_table(store.csv_path()).unwrap();
        let titles: Vec<&str> = rows.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["甲", "乙", "丙"]);
        // Query strings are stripped from the dedup key.
        assert_eq!(rows[0].source_url, detail_url(&cfg, "/job_detail/a.html"));
    }

    #[tokio::test]
    async fn page_load_timeout_preserves_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = RunStore::open(dir.path(), "run.csv").unwrap();

        let mut details = HashMap::new();
        details.insert(detail_url(&cfg, "/a"), job_html("甲"));
        details.insert(detail_url(&cfg, "/b"), job_html("乙"));

        let board = FakeBoard::new(
            vec![
                BoardPage {
                    loads: true,
                    hrefs: vec!["/a"],
                    next_class: Some("x"),
                },
                BoardPage {
                    loads: true,
                    hrefs: vec!["/b"],
                    next_class: Some("x"),
                },
                // Page 3 never renders its listing container.
                BoardPage {
                    loads: false,
                    hrefs: vec![],
                    next_class: None,
                },
            ],
            details,
        );

        let captured = walk(&board, &store, &cfg).await.unwrap();
        assert_eq!(captured, 2);
        let rows = read_table(store.csv_path()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn per_item_failures_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = RunStore::open(dir.path(), "run.csv").unwrap();

        let mut details = HashMap::new();
        details.insert(detail_url(&cfg, "/ok"), job_html("甲"));
        // "/empty" renders nothing; "/partial" has the region but no title.
        details.insert(detail_url(&cfg, "/empty"), String::new());
        details.insert(
            detail_url(&cfg, "/partial"),
            "<div class=\"info-primary\"><span class=\"salary\">1K</span></div>".to_string(),
        );

        let board = FakeBoard::new(
            vec![BoardPage {
                loads: true,
                hrefs: vec!["/empty", "/partial", "/ok"],
                next_class: None,
            }],
            details,
        );

        let captured = walk(&board, &store, &cfg).await.unwrap();
        assert_eq!(captured, 1);
        // Every tab gets closed, including the failed ones.
        assert_eq!(board.tabs_closed.load(Ordering::SeqCst), 3);
        let rows = read_table(store.csv_path()).unwrap();
        assert_eq!(rows[0].title, "甲");
    }

    #[tokio::test]
    async fn empty_listing_stops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = RunStore::open(dir.path(), "run.csv").unwrap();

        let board = FakeBoard::new(
            vec![BoardPage {
                loads: true,
                hrefs: vec![],
                next_class: Some("x"),
            }],
            HashMap::new(),
        );

        let captured = walk(&board, &store, &cfg).await.unwrap();
        assert_eq!(captured, 0);
        assert!(!store.csv_path().exists());
    }
}

use std::sync::LazyLock;

use chrono::Local;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::store::JobRecord;

const PRIMARY_INFO: &str = "div.info-primary";
const TITLE: &str = "h1";
const SALARY: &str = "span.salary";
const CITY: &str = "p a.text-city";
const DEGREE: &str = "p span.text-degree";
// The site has shipped both spellings of this class.
const EXPERIENCE: &[&str] = &["p span.text-experiece", "p span.text-experience"];
const COMPANY_NAME: &str = ".company-info-box .company-name";
const RECRUITER_INFO: &str = ".boss-info-attr";
const WELFARE_TAGS: &str = ".job-banner .tag-container-new .tag-all.job-tags span";
const KEYWORD_TAGS: &str = "ul.job-keyword-list li";
const DETAIL_SECTION: &str = ".job-detail-section";
const DETAIL_HEADING: &str = "h3";
const DETAIL_TEXT: &str = ".job-sec-text";
const DESCRIPTION_HEADING: &str = "职位描述";

static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Extract a job record from a loaded detail-page document. Returns `None`
/// when any required region is missing; the caller logs and moves on.
pub fn job_record(html: &str, url: &str) -> Option<JobRecord> {
    let doc = Html::parse_document(html);
    let primary = doc.select(&sel(PRIMARY_INFO)).next()?;

    let title = text_of(primary, TITLE)?;
    let salary = text_of(primary, SALARY)?;
    let location = text_of(primary, CITY)?;
    let education = text_of(primary, DEGREE)?;

    let experience = first_match(primary, EXPERIENCE).unwrap_or_else(|| "N/A".to_string());
    let company = company_name(&doc);
    let benefits = join_tags(&doc, WELFARE_TAGS);
    let domain_tags = join_tags(&doc, KEYWORD_TAGS);
    let description = description(&doc)?;

    let source_url = canonical_url(url);
    let display_link = display_link(url, &title, &location, &company);
    let captured_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    Some(JobRecord {
        title,
        salary,
        company,
        location,
        experience,
        education,
        benefits,
        domain_tags,
        description,
        display_link,
        source_url,
        captured_at,
    })
}

/// Company name with a two-tier fallback: the structural company box, then the
/// first segment of the recruiter-info line ("张三·HRBP·某某科技" → "张三").
fn company_name(doc: &Html) -> String {
    if let Some(name) = doc
        .select(&sel(COMPANY_NAME))
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
    {
        return name;
    }
    doc.select(&sel(RECRUITER_INFO))
        .next()
        .map(element_text)
        .and_then(|info| info.split('·').next().map(|s| s.trim().to_string()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "N/A".to_string())
}

/// Raw markup of the 职位描述 section, line breaks normalized to `\n`, all
/// remaining markup stripped, entities decoded.
fn description(doc: &Html) -> Option<String> {
    let section = doc
        .select(&sel(DETAIL_SECTION))
        .find(|section| {
            section
                .select(&sel(DETAIL_HEADING))
                .any(|h| element_text(h).contains(DESCRIPTION_HEADING))
        })?;
    let raw = section.select(&sel(DETAIL_TEXT)).next()?.inner_html();
    let with_breaks = BR_RE.replace_all(&raw, "\n");
    let stripped = TAG_RE.replace_all(&with_breaks, "");
    Some(
        html_escape::decode_html_entities(stripped.as_ref())
            .trim()
            .to_string(),
    )
}

/// A spreadsheet hyperlink combining the listing URL with a readable label.
/// Double quotes in the label are doubled so the formula stays one string.
fn display_link(url: &str, title: &str, location: &str, company: &str) -> String {
    let label = format!("{}-{}-{}", title, location, company).replace('"', "\"\"");
    format!("=HYPERLINK(\"{}\", \"{}\")", url, label)
}

/// Canonical listing address: the URL with its query string stripped.
fn canonical_url(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).unwrap()
}

fn element_text(el: ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn text_of(scope: ElementRef, selector: &str) -> Option<String> {
    scope.select(&sel(selector)).next().map(element_text)
}

fn first_match(scope: ElementRef, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|s| text_of(scope, s))
}

/// All matching elements' text, trimmed and comma-joined; "N/A" when empty.
fn join_tags(doc: &Html, selector: &str) -> String {
    let tags: Vec<String> = doc
        .select(&sel(selector))
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if tags.is_empty() {
        "N/A".to_string()
    } else {
        tags.join(", ")
    }
}

// ── Tests ──

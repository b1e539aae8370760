use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::errors::StageError;
use crate::pipeline::collaborators::DiscoveryService;
use crate::pipeline::models::{DiscoveredPage, DiscoveryOutput, ElementDescriptor};
use crate::util::truncate_chars;

const MAX_ELEMENTS_PER_PAGE: usize = 50;
const MAX_TEXT_CHARS: usize = 80;

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#).unwrap());

static ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(button|a|input|select|textarea|form|h1|h2|h3)\b([^>]*)>").unwrap()
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(id|name|placeholder|aria-label|value)\s*=\s*["']([^"']*)["']"#).unwrap()
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

#[derive(Debug, Default)]
struct Attributes {
    id: Option<String>,
    name: Option<String>,
    label: Option<String>,
}

fn parse_attributes(raw: &str) -> Attributes {
    let mut attrs = Attributes::default();
    for cap in ATTRIBUTE.captures_iter(raw) {
        let value = cap[2].trim().to_string();
        if value.is_empty() {
            continue;
        }
        match cap[1].to_ascii_lowercase().as_str() {
            "id" => attrs.id = Some(value),
            "name" => attrs.name = Some(value),
            _ => {
                attrs.label.get_or_insert(value);
            }
        }
    }
    attrs
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text following an opening tag, up to the next tag.
fn inline_text(html: &str, from: usize) -> Option<String> {
    let rest = &html[from..];
    let end = rest.find('<').unwrap_or(rest.len());
    let text = collapse_whitespace(&rest[..end]);
    (!text.is_empty()).then(|| truncate_chars(&text, MAX_TEXT_CHARS))
}

/// Best selector candidate: id, then name, then visible text, then tag.
fn selector_for(tag: &str, attrs: &Attributes, text: Option<&str>) -> String {
    if let Some(id) = &attrs.id {
        format!("#{}", id)
    } else if let Some(name) = &attrs.name {
        format!("{}[name=\"{}\"]", tag, name)
    } else if let Some(text) = text {
        format!("text={}", text)
    } else {
        tag.to_string()
    }
}

/// Parse one page: its title, interactive elements and outgoing links.
pub fn extract_page(url: &str, html: &str) -> (DiscoveredPage, Vec<String>) {
    let title = TITLE
        .captures(html)
        .map(|c| collapse_whitespace(&TAG.replace_all(&c[1], "")))
        .filter(|t| !t.is_empty());

    let elements = ELEMENT
        .captures_iter(html)
        .take(MAX_ELEMENTS_PER_PAGE)
        .map(|cap| {
            let tag = cap[1].to_ascii_lowercase();
            let attrs = parse_attributes(&cap[2]);
            let end = cap.get(0).map_or(0, |m| m.end());
            let text = inline_text(html, end).or_else(|| attrs.label.clone());
            ElementDescriptor {
                selector: selector_for(&tag, &attrs, text.as_deref()),
                tag,
                text,
            }
        })
        .collect();

    let links = LINK
        .captures_iter(html)
        .map(|c| c[1].trim().to_string())
        .collect();

    (
        DiscoveredPage {
            url: url.to_string(),
            title,
            elements,
        },
        links,
    )
}

/// Absolute same-host http(s) URL for a link, without its fragment.
fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
        return None;
    }
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    let same_host = url.host_str() == base.host_str();
    let http = matches!(url.scheme(), "http" | "https");
    (same_host && http).then_some(url)
}

/// Breadth-first, same-host crawler.
pub struct HttpCrawler {
    client: reqwest::Client,
}

impl HttpCrawler {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("testsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build crawler HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &Url) -> Result<String, reqwest::Error> {
        self.client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl DiscoveryService for HttpCrawler {
    async fn discover(&self, url: &str, depth: u32, page_limit: u32) -> Result<DiscoveryOutput> {
        let root = Url::parse(url).with_context(|| format!("Invalid target URL: {}", url))?;
        let page_limit = page_limit.max(1) as usize;

        let mut output = DiscoveryOutput::default();
        let mut seen: HashSet<Url> = HashSet::from([root.clone()]);
        let mut frontier: VecDeque<(Url, u32)> = VecDeque::from([(root.clone(), 0)]);

        while let Some((page_url, level)) = frontier.pop_front() {
            if output.pages.len() >= page_limit {
                break;
            }

            let html = match self.fetch(&page_url).await {
                Ok(html) => html,
                Err(e) if page_url == root && e.is_connect() => {
                    return Err(StageError::CollaboratorUnreachable(format!(
                        "target {} is unreachable: {}",
                        root, e
                    ))
                    .into());
                }
                Err(e) if page_url == root => {
                    return Err(anyhow::Error::new(e).context(format!("Failed to fetch {}", root)));
                }
                Err(e) => {
                    warn!(url = %page_url, error = %e, "skipping page");
                    continue;
                }
            };

            let (page, links) = extract_page(page_url.as_str(), &html);
            debug!(url = %page_url, elements = page.elements.len(), links = links.len(), "page parsed");
            output.pages.push(page);

            if level < depth {
                for href in links {
                    if let Some(next) = resolve_link(&page_url, &href)
                        && seen.insert(next.clone())
                    {
                        frontier.push_back((next, level + 1));
                    }
                }
            }
        }

        info!(
            url,
            pages = output.pages.len(),
            elements = output.element_count(),
            "discovery finished"
        );
        Ok(output)
    }
}

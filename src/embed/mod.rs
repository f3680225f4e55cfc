//! Embed-time helpers: deciding which images go through the cache and
//! rewriting HTML so they do.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use reqwest::Url;
use scraper::{Html, Selector};

use crate::cache::ImageCache;
use crate::config::ImageCacheSettings;

lazy_static! {
    static ref PROTOCOL: Regex = Regex::new(r"(?i)^https?://").unwrap();
    static ref IMG_SELECTOR: Selector = Selector::parse("img[src]").unwrap();
    static ref IMG_TAG: Regex = Regex::new(r"(?is)<img\b[^>]*>").unwrap();
    // The leading whitespace keeps data-src and friends out
    static ref SRC_ATTR: Regex =
        Regex::new(r#"(?is)(\s)src\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap();
}

/// Prefixes `http://` onto URLs without a scheme and lowercases an
/// existing http(s) scheme.
pub fn add_protocol(url: &str) -> String {
    let url = url.trim();

    if let Some(found) = PROTOCOL.find(url) {
        return format!("{}{}", found.as_str().to_ascii_lowercase(), &url[found.end()..]);
    }

    // Protocol relative
    if let Some(rest) = url.strip_prefix("//") {
        return format!("http://{}", rest);
    }

    format!("http://{}", url)
}

/// Whether an image at `url`, shown on `site`, should be served from the
/// cache.
///
/// Images from the site itself never are. Otherwise, unless `always` is set,
/// only insecure images embedded in a secure site are.
pub fn needs_caching(url: &str, site: &Url, always: bool) -> bool {
    if is_site_relative(url) {
        return false;
    }

    let image = match Url::parse(&add_protocol(url)) {
        Ok(image) => image,
        Err(_) => return false,
    };

    let (image_host, site_host) = match (image.host_str(), site.host_str()) {
        (Some(image_host), Some(site_host)) => (image_host, site_host),
        _ => return false,
    };

    if image_host.eq_ignore_ascii_case(site_host) {
        return false;
    }

    if !always && (site.scheme() == "http" || site.scheme() == image.scheme()) {
        return false;
    }

    true
}

// Paths resolved against the page, served by the site itself
fn is_site_relative(url: &str) -> bool {
    let url = url.trim();
    (url.starts_with('/') && !url.starts_with("//")) || url.starts_with("./") || url.starts_with("../")
}

/// Context for rewriting the images of one rendered page.
///
/// Tracks whether anything was rewritten, so the caller knows to include the
/// client-side loader exactly once per page.
pub struct RenderPass<'a> {
    cache: &'a ImageCache,
    settings: ImageCacheSettings,
    needs_loader: bool,
}

impl<'a> RenderPass<'a> {
    pub fn new(cache: &'a ImageCache) -> Self {
        Self {
            cache,
            settings: cache.settings().get(),
            needs_loader: false,
        }
    }

    pub fn needs_loader(&self) -> bool {
        self.needs_loader
    }

    /// Points every cacheable `<img src>` in `html` at the local cache,
    /// fetching images that were never seen before.
    pub async fn rewrite(&mut self, html: &str) -> String {
        if !self.settings.enabled {
            return html.to_string();
        }

        let mut replacements = HashMap::new();

        for src in image_sources(html) {
            if !self.cache.needs_caching(&src) {
                continue;
            }

            let absolute = add_protocol(&src);
            self.needs_loader = true;
            let proxied = self.cache.proxify(&absolute).await;
            let decorated = self.decorate(&proxied, &absolute);
            replacements.insert(src, decorated);
        }

        if replacements.is_empty() {
            return html.to_string();
        }

        replace_sources(html, &replacements)
    }

    fn decorate(&self, proxied: &str, original: &str) -> String {
        if self.settings.nolink {
            return format!("src=\"{}\"", escape_attribute(proxied));
        }

        format!(
            "src=\"{}\" rel=\"cached\" data-url=\"{}\"",
            escape_attribute(proxied),
            escape_attribute(original)
        )
    }
}

// Distinct img sources in document order
fn image_sources(html: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(html);
    let mut sources: Vec<String> = Vec::new();

    for element in fragment.select(&IMG_SELECTOR) {
        if let Some(src) = element.value().attr("src") {
            let src = src.trim();
            if !src.is_empty() && !sources.iter().any(|s| s == src) {
                sources.push(src.to_string());
            }
        }
    }

    sources
}

// Swaps the src attribute of <img> tags whose decoded value has a replacement
fn replace_sources(html: &str, replacements: &HashMap<String, String>) -> String {
    IMG_TAG
        .replace_all(html, |tag: &Captures| {
            SRC_ATTR
                .replacen(&tag[0], 1, |attr: &Captures| {
                    let value = attr
                        .get(2)
                        .or_else(|| attr.get(3))
                        .or_else(|| attr.get(4))
                        .map_or("", |value| value.as_str());

                    match replacements.get(unescape_attribute(value).trim()) {
                        Some(replacement) => format!("{}{}", &attr[1], replacement),
                        None => attr[0].to_string(),
                    }
                })
                .into_owned()
        })
        .into_owned()
}

fn unescape_attribute(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

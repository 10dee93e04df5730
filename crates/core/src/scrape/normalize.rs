//! HTML to plain text, URL canonical form, body decoding.

use crate::time::published::{first_published_date, parse_published_date};
use chrono::NaiveDate;
use encoding_rs::{Encoding, UTF_8};
use scraper::node::Element;
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::HashMap;
use url::Url;

/// Elements whose text never belongs to the article.
const BOILERPLATE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "form", "nav", "header",
    "footer", "aside",
];

/// Class/id fragments of cookie banners and consent dialogs.
const CONSENT_MARKERS: &[&str] = &["cookie", "consent", "gdpr", "onetrust", "cmp-"];

/// Tried in order; the first match is taken as the article root.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "div.content",
    "div.main-content",
    "div.article-content",
    "div.post-content",
    "div.entry-content",
    "div#content",
    "div#main-content",
    "div#article",
    "div#post",
];

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedHtml {
    pub title: String,
    pub text: String,
    pub published: Option<NaiveDate>,
}

pub fn normalize_html(html: &str) -> NormalizedHtml {
    let document = Html::parse_document(html);
    let meta = collect_meta(&document);

    let title = select_first(&document, "title")
        .map(|el| compact_ws(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
        .or_else(|| meta.get("og:title").map(|t| compact_ws(t)))
        .unwrap_or_default();

    let published = first_published_date(|k| meta.get(k).map(String::as_str)).or_else(|| {
        let sel = Selector::parse("time[datetime]").ok()?;
        document
            .select(&sel)
            .filter_map(|el| el.value().attr("datetime"))
            .find_map(parse_published_date)
    });

    let root = CONTENT_SELECTORS
        .iter()
        .find_map(|s| select_first(&document, s))
        .or_else(|| select_first(&document, "body"));

    let text = match root {
        Some(root) => article_text(root),
        None => String::new(),
    };

    NormalizedHtml {
        title,
        text,
        published,
    }
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    document.select(&sel).next()
}

fn article_text(root: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != root.id())
            .filter_map(|a| a.value().as_element())
            .any(is_boilerplate);
        if !hidden {
            parts.push(&**text);
        }
    }
    compact_ws(&parts.join(" "))
}

fn is_boilerplate(el: &Element) -> bool {
    if BOILERPLATE_TAGS.contains(&el.name()) {
        return true;
    }
    let marked = |v: &str| {
        let v = v.to_ascii_lowercase();
        CONSENT_MARKERS.iter().any(|m| v.contains(m))
    };
    el.attr("class").is_some_and(marked) || el.attr("id").is_some_and(marked)
}

/// `<meta>` content keyed by `property`, `name` or `itemprop`.
fn collect_meta(document: &Html) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Ok(sel) = Selector::parse("meta[content]") else {
        return out;
    };
    for el in document.select(&sel) {
        let v = el.value();
        let Some(content) = v.attr("content") else {
            continue;
        };
        for key in [v.attr("property"), v.attr("name"), v.attr("itemprop")]
            .into_iter()
            .flatten()
        {
            out.entry(key.to_string())
                .or_insert_with(|| content.to_string());
        }
    }
    out
}

pub fn compact_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form used as the page identity: lowercase scheme/host, no
/// fragment, no tracking params, no trailing slash on non-root paths.
/// Only http(s) URLs are accepted.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Registrable-ish host used for domain policy (`www.` dropped).
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Decodes a response body using the header charset, then `<meta charset>`,
/// then UTF-8. A BOM always wins.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_from_content_type)
        .or_else(|| sniff_meta_charset(bytes))
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn charset_from_content_type(ct: &str) -> Option<String> {
    ct.split(';')
        .map(str::trim)
        .find_map(|part| {
            let (k, v) = part.split_once('=')?;
            k.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| v.trim().trim_matches('"').to_string())
        })
        .filter(|s| !s.is_empty())
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(2048)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    let idx = head.find("charset=")?;
    let label: String = head[idx + "charset=".len()..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        .collect();
    (!label.is_empty()).then_some(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html><head>
  <title> 3 Undervalued Stocks </title>
  <meta property="article:published_time" content="2025-01-10T08:00:00Z">
  <script>var x = "Apple (AAPL) Sell";</script>
</head>
<body>
  <header><nav>Home | Markets | AAPL quote</nav></header>
  <div class="cookie-banner">We use cookies. Accept all</div>
  <main>
    <h1>Picks</h1>
    <p>Apple (AAPL, NASDAQ) is a <b>Strong Buy</b>.</p>
    <aside>Sponsored: buy gold</aside>
    <div id="consent-dialog">Manage consent</div>
    <p>Fair price $210, target $225.</p>
  </main>
  <footer>Copyright</footer>
</body></html>"#;

    #[test]
    fn strips_boilerplate_and_keeps_article_text() {
        let out = normalize_html(PAGE);
        assert_eq!(out.title, "3 Undervalued Stocks");
        assert_eq!(
            out.text,
            "Picks Apple (AAPL, NASDAQ) is a Strong Buy . Fair price $210, target $225."
        );
        assert_eq!(out.published, NaiveDate::from_ymd_opt(2025, 1, 10));
    }

    #[test]
    fn falls_back_to_body_and_time_element() {
        let html = r#"<html><body><div>Hold on <time datetime="2025-02-03">Feb 3</time></div>
            <script>ignored()</script></body></html>"#;
        let out = normalize_html(html);
        assert_eq!(out.text, "Hold on Feb 3");
        assert_eq!(out.published, NaiveDate::from_ymd_opt(2025, 2, 3));
        assert_eq!(out.title, "");
    }

    #[test]
    fn same_content_same_text() {
        let a = normalize_html(PAGE).text;
        let b = normalize_html(&PAGE.replace("  <main>", "\n\n<main>")).text;
        assert_eq!(a, b);
    }

    #[test]
    fn normalizes_urls() {
        assert_eq!(
            normalize_url("HTTPS://WWW.Fool.com/investing/picks/?utm_source=x&id=7#top").as_deref(),
            Some("https://www.fool.com/investing/picks?id=7")
        );
        assert_eq!(
            normalize_url("https://zacks.com/?gclid=abc").as_deref(),
            Some("https://zacks.com/")
        );
        assert_eq!(normalize_url("ftp://example.com/a"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn domain_drops_www() {
        assert_eq!(
            domain_of("https://WWW.Morningstar.com/stocks").as_deref(),
            Some("morningstar.com")
        );
    }

    #[test]
    fn decodes_declared_charsets() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1252.encode("Nestlé");
        assert_eq!(decode_body(&bytes, Some("text/html; charset=windows-1252")), "Nestlé");

        let mut html = b"<meta charset=\"iso-8859-1\"><p>".to_vec();
        html.extend_from_slice(&bytes);
        assert!(decode_body(&html, Some("text/html")).ends_with("Nestlé"));

        assert_eq!(decode_body("plain ü".as_bytes(), None), "plain ü");
    }
}

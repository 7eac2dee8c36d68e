/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Just enough microformats2 to find h-entries, their `url` and
//! `syndication` properties, and a page's rel links.

use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use url::Url;

static BASE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("base[href]").expect("valid base selector"));
static REL_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a[rel][href], link[rel][href], area[rel][href]").expect("valid rel selector")
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    /// e.g. `h-entry`.
    pub types: Vec<String>,
    /// Property name without prefix (`url`, `syndication`, `name`) to values.
    pub properties: BTreeMap<String, Vec<String>>,
    pub children: Vec<Item>,
}

impl Item {
    pub fn has_type(&self, t: &str) -> bool {
        self.types.iter().any(|x| x == t)
    }

    pub fn get(&self, prop: &str) -> &[String] {
        self.properties.get(prop).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, prop: &str) -> Option<&str> {
        self.get(prop).first().map(String::as_str)
    }

    fn push(&mut self, prop: &str, value: String) {
        if value.is_empty() {
            return;
        }
        self.properties.entry(prop.to_string()).or_default().push(value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelUrl {
    pub rels: Vec<String>,
    pub media_type: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Document {
    pub items: Vec<Item>,
    pub rels: BTreeMap<String, Vec<String>>,
    pub rel_urls: BTreeMap<String, RelUrl>,
}

impl Document {
    pub fn rel(&self, rel: &str) -> &[String] {
        self.rels.get(rel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries of the page's feed: the children of top-level h-feeds, plus
    /// any top-level items that aren't feeds.
    pub fn feed_entries(&self) -> Vec<&Item> {
        let mut out = Vec::new();
        for item in &self.items {
            if item.has_type("h-feed") {
                out.extend(item.children.iter());
            } else {
                out.push(item);
            }
        }
        out
    }

    /// Every h-entry anywhere on the page, depth first.
    pub fn entries(&self) -> Vec<&Item> {
        fn collect<'a>(items: &'a [Item], out: &mut Vec<&'a Item>) {
            for item in items {
                if item.has_type("h-entry") {
                    out.push(item);
                }
                collect(&item.children, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.items, &mut out);
        out
    }
}

pub fn parse(html: &str, doc_url: &str) -> Document {
    let page = Html::parse_document(html);
    let doc_base = Url::parse(doc_url).ok();
    let base = page
        .select(&BASE_SEL)
        .next()
        .and_then(|b| b.value().attr("href"))
        .and_then(|href| match &doc_base {
            Some(d) => d.join(href.trim()).ok(),
            None => Url::parse(href.trim()).ok(),
        })
        .or(doc_base);

    let mut doc = Document::default();
    let root = page.root_element();
    let types = root_classes(root);
    if types.is_empty() {
        find_items(root, base.as_ref(), &mut doc.items);
    } else {
        doc.items.push(parse_item(root, types, base.as_ref()));
    }

    for el in page.select(&REL_SEL) {
        let Some(href) = el.value().attr("href").and_then(|h| resolve(base.as_ref(), h)) else {
            continue;
        };
        let rels: Vec<String> = el
            .value()
            .attr("rel")
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(|r| r.to_ascii_lowercase())
            .collect();
        for rel in &rels {
            let urls = doc.rels.entry(rel.clone()).or_default();
            if !urls.contains(&href) {
                urls.push(href.clone());
            }
        }
        let entry = doc.rel_urls.entry(href).or_default();
        for rel in rels {
            if !entry.rels.contains(&rel) {
                entry.rels.push(rel);
            }
        }
        if entry.media_type.is_none() {
            entry.media_type = el
                .value()
                .attr("type")
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty());
        }
    }
    doc
}

fn find_items(el: ElementRef<'_>, base: Option<&Url>, out: &mut Vec<Item>) {
    for child in el.children().filter_map(ElementRef::wrap) {
        let types = root_classes(child);
        if types.is_empty() {
            find_items(child, base, out);
        } else {
            out.push(parse_item(child, types, base));
        }
    }
}

fn parse_item(el: ElementRef<'_>, types: Vec<String>, base: Option<&Url>) -> Item {
    let mut item = Item {
        types,
        ..Item::default()
    };
    collect_properties(el, base, &mut item);
    if item.get("url").is_empty() {
        if let Some(url) = implied_url(el, base) {
            item.push("url", url);
        }
    }
    item
}

fn collect_properties(el: ElementRef<'_>, base: Option<&Url>, item: &mut Item) {
    for child in el.children().filter_map(ElementRef::wrap) {
        let props = property_classes(child);
        let types = root_classes(child);
        if types.is_empty() {
            for (prefix, name) in &props {
                item.push(name, property_value(child, prefix, base));
            }
            collect_properties(child, base, item);
            continue;
        }

        let nested = parse_item(child, types, base);
        if props.is_empty() {
            item.children.push(nested);
            continue;
        }
        for (prefix, name) in &props {
            let value = match (prefix.as_str(), nested.first("url")) {
                ("u", Some(url)) => url.to_string(),
                _ => property_value(child, prefix, base),
            };
            item.push(name, value);
        }
    }
}

fn property_value(el: ElementRef<'_>, prefix: &str, base: Option<&Url>) -> String {
    if prefix == "u" {
        let v = el.value();
        let attr = match v.name() {
            "a" | "area" | "link" => v.attr("href"),
            "img" | "audio" | "video" | "source" | "iframe" => v.attr("src"),
            "object" => v.attr("data"),
            _ => None,
        };
        if let Some(url) = attr.and_then(|a| resolve(base, a)) {
            return url;
        }
        let text = text_of(el);
        return resolve(base, &text).unwrap_or(text);
    }
    if el.value().name() == "img" {
        if let Some(alt) = el.value().attr("alt") {
            return alt.trim().to_string();
        }
    }
    text_of(el)
}

fn implied_url(el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let v = el.value();
    if matches!(v.name(), "a" | "area") {
        return v.attr("href").and_then(|h| resolve(base, h));
    }
    let children: Vec<ElementRef<'_>> = el.children().filter_map(ElementRef::wrap).collect();
    let links: Vec<&ElementRef<'_>> = children
        .iter()
        .filter(|c| matches!(c.value().name(), "a" | "area") && c.value().attr("href").is_some())
        .collect();
    if links.len() == 1 && root_classes(*links[0]).is_empty() {
        return links[0].value().attr("href").and_then(|h| resolve(base, h));
    }
    if children.len() == 1 && root_classes(children[0]).is_empty() {
        let only = children[0];
        let grand: Vec<ElementRef<'_>> = only
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| matches!(c.value().name(), "a" | "area") && c.value().attr("href").is_some())
            .collect();
        if grand.len() == 1 && root_classes(grand[0]).is_empty() {
            return grand[0].value().attr("href").and_then(|h| resolve(base, h));
        }
    }
    None
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let joined = match base {
        Some(b) => b.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    Some(joined.to_string())
}

fn is_mf2_name(rest: &str) -> bool {
    !rest.is_empty()
        && !rest.starts_with('-')
        && rest
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn root_classes(el: ElementRef<'_>) -> Vec<String> {
    let mut out: Vec<String> = el
        .value()
        .classes()
        .filter(|c| c.strip_prefix("h-").is_some_and(is_mf2_name))
        .map(str::to_string)
        .collect();
    out.sort();
    out.dedup();
    out
}

fn property_classes(el: ElementRef<'_>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for class in el.value().classes() {
        for prefix in ["u", "p", "dt", "e"] {
            if let Some(name) = class
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('-'))
                .filter(|n| is_mf2_name(n))
            {
                let pair = (prefix.to_string(), name.to_string());
                if !out.contains(&pair) {
                    out.push(pair);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"
      <html><head>
        <link rel="feed" type="text/html" href="/notes">
        <link rel="alternate" type="application/rss+xml" href="/feed.xml">
      </head><body>
      <div class="h-feed">
        <div class="h-entry">
          <a class="u-url" href="/post">permalink</a>
          <a class="u-syndication" href="https://fa.ke/post/url">fa.ke</a>
          <a class="u-syndication h-cite" href="https://fa.ke/other">cite</a>
        </div>
        <article class="h-entry"><a href="/implied">only link</a></article>
      </div>
      <a rel="me syndication" href="https://fa.ke/me">me</a>
      </body></html>"#;

    #[test]
    fn parses_feed_entries_and_properties() {
        let doc = parse(FEED, "http://or.ig/");
        let entries = doc.feed_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].get("url"), ["http://or.ig/post"]);
        assert_eq!(
            entries[0].get("syndication"),
            ["https://fa.ke/post/url", "https://fa.ke/other"]
        );
        assert_eq!(entries[1].first("url"), Some("http://or.ig/implied"));
        assert_eq!(doc.entries().len(), 2);
    }

    #[test]
    fn collects_rels_with_types() {
        let doc = parse(FEED, "http://or.ig/");
        assert_eq!(doc.rel("feed"), ["http://or.ig/notes"]);
        assert_eq!(doc.rel("syndication"), ["https://fa.ke/me"]);
        assert_eq!(
            doc.rel_urls["http://or.ig/feed.xml"].media_type.as_deref(),
            Some("application/rss+xml")
        );
        assert_eq!(doc.rel_urls["https://fa.ke/me"].rels, ["me", "syndication"]);
    }

    #[test]
    fn base_href_wins_over_document_url() {
        let html = r#"<html><head><base href="https://cdn.or.ig/blog/"></head>
          <body><div class="h-entry"><a class="u-url" href="p1">x</a></div></body></html>"#;
        let doc = parse(html, "http://or.ig/");
        assert_eq!(doc.items[0].first("url"), Some("https://cdn.or.ig/blog/p1"));
    }

    #[test]
    fn top_level_entries_without_feed() {
        let html = r#"<main><div class="h-entry h-as-note"><a class="u-url" href="/a">a</a></div>
          <div class="not-mf"><div class="h-entry"><a class="u-url" href="/b">b</a></div></div></main>"#;
        let doc = parse(html, "http://or.ig/");
        let urls: Vec<_> = doc.feed_entries().iter().filter_map(|e| e.first("url")).collect();
        assert_eq!(urls, ["http://or.ig/a", "http://or.ig/b"]);
        assert!(doc.items[0].has_type("h-as-note"));
    }
}

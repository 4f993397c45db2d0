use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use url::{ParseError, Url};

/// Custom whitelist: category name -> normalized hosts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Whitelist {
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_category(&mut self, category: &str) {
        self.categories.entry(category.to_string()).or_default();
    }

    pub fn insert_host(&mut self, category: &str, host: &str) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(host.to_string());
    }

    pub fn contains_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    pub fn contains_host(&self, category: &str, host: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|hosts| hosts.contains(host))
    }

    /// The set of categories the time tracker reconciles against.
    pub fn known(&self) -> BTreeSet<String> {
        self.categories.keys().cloned().collect()
    }

    /// Categories with at least one host among `open_hosts`.
    ///
    /// A rule for `youtube.com` also matches `m.youtube.com`.
    pub fn open_categories(&self, open_hosts: &[String]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if open_hosts.is_empty() {
            return out;
        }
        for (category, hosts) in &self.categories {
            let hit = open_hosts
                .iter()
                .any(|h| host_suffixes(h).into_iter().any(|s| hosts.contains(s)));
            if hit {
                out.insert(category.clone());
            }
        }
        out
    }
}

/// `m.youtube.com` -> [`m.youtube.com`, `youtube.com`]. Stops before bare TLDs.
fn host_suffixes(host: &str) -> Vec<&str> {
    let mut out = vec![host];
    if !host.contains('.') {
        return out;
    }
    let mut candidate = host;
    while let Some((_left, rest)) = candidate.split_once('.') {
        if !rest.contains('.') {
            break;
        }
        out.push(rest);
        candidate = rest;
    }
    out
}

/// Trims a category name and replaces spaces with `_`. `None` when empty.
pub fn normalize_category(input: &str) -> Option<String> {
    let name = input.trim().replace(' ', "_");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Reduces a URL or bare host to a lowercase hostname without `www.`.
///
/// Only `http`/`https` URLs carry a host worth tracking; other schemes
/// (`mailto:`, `about:`, extension pages) give `None`, as do IPv6 literals and
/// empty strings. Bare hosts may keep a port (`localhost:3000`). Internationalized
/// names come back in their punycode form.
pub fn normalize_host(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let url = match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        // `localhost:3000` parses as scheme `localhost`.
        Ok(_) if !input.contains("://") && input.split_once(':').is_some_and(|(_, p)| is_port(p)) => {
            with_web_scheme(input)?
        }
        Ok(_) => return None,
        Err(ParseError::RelativeUrlWithoutBase) => with_web_scheme(input)?,
        Err(_) => return None,
    };

    let host = url.host_str()?.trim_end_matches('.');
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.is_empty()
        || host.starts_with('.')
        || host.contains("..")
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn with_web_scheme(bare: &str) -> Option<Url> {
    Url::parse(&format!("https://{bare}")).ok()
}

fn is_port(rest: &str) -> bool {
    let port = rest.split(['/', '?', '#']).next().unwrap_or("");
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

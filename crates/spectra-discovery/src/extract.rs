//! Link and mention extraction from message text and structured entities.
//!
//! Normal forms: public references become `@name`, private invites keep
//! their canonical `https://t.me/joinchat/<hash>` form.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use spectra_gateway::GatewayMessage;
use spectra_store::MentionSource;

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_]{5,32})\b").unwrap());

/// t.me links: invite (`joinchat/` or `+`), `resolve?domain=`, `c/<id>`
/// and plain `/name` forms, with or without scheme.
static TME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:https?://)?t\.me/(joinchat/|\+|resolve\?domain=|c/)?([A-Za-z0-9_-]+)")
        .unwrap()
});

/// Extract normalised group references from raw text.
pub fn extract_links(text: &str) -> BTreeSet<String> {
    let mut links = BTreeSet::new();

    for cap in USERNAME_RE.captures_iter(text) {
        links.insert(format!("@{}", &cap[1]));
    }

    for cap in TME_RE.captures_iter(text) {
        let prefix = cap.get(1).map_or("", |m| m.as_str());
        let name = &cap[2];
        match prefix {
            "joinchat/" | "+" => {
                links.insert(format!("https://t.me/joinchat/{name}"));
            }
            _ => {
                // resolve?domain=, c/<id> and bare names all normalise to
                // the first path segment.
                links.insert(format!("@{name}"));
            }
        }
    }

    links
}

/// Extract from a whole message: text plus the URLs carried in structured
/// entities.
pub fn extract_from_message(message: &GatewayMessage) -> BTreeSet<String> {
    let mut links = match &message.text {
        Some(text) => extract_links(text),
        None => BTreeSet::new(),
    };
    for url in &message.entity_urls {
        links.extend(extract_links(url));
    }
    links
}

/// Bare usernames mentioned by a message, with where each was seen. Used by
/// the archive pipeline's mention rows.
pub fn extract_mentions(message: &GatewayMessage) -> Vec<(String, MentionSource)> {
    let mut seen = BTreeSet::new();
    let mut mentions = Vec::new();

    if let Some(text) = &message.text {
        for cap in USERNAME_RE.captures_iter(text) {
            let name = cap[1].to_string();
            if seen.insert(name.clone()) {
                mentions.push((name, MentionSource::Text));
            }
        }
    }
    for url in &message.entity_urls {
        for link in extract_links(url) {
            if let Some(name) = link.strip_prefix('@') {
                if seen.insert(name.to_string()) {
                    mentions.push((name.to_string(), MentionSource::Entity));
                }
            }
        }
    }
    if let Some(from) = &message.forwarded_from {
        let name = from.trim_start_matches('@').to_string();
        if !name.is_empty() && seen.insert(name.clone()) {
            mentions.push((name, MentionSource::Forward));
        }
    }

    mentions
}

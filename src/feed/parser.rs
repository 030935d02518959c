use feed_rs::model::{Entry, Feed, FeedType};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::store::{Enclosure, ItemDescriptor, Validators};

/// The document could not be recognized as any supported feed dialect.
///
/// Soft, per-subscription: the poll scheduler records it and backs off, it
/// never fails sibling subscriptions or the engine.
#[derive(Debug, Error)]
#[error("Unsupported or malformed feed document: {0}")]
pub struct FeedFormatError(#[from] parser::ParseFeedError);

/// A successfully decoded feed document.
///
/// Entry conversion is lazy and restartable: [`ParsedFeed::items`] walks the
/// document in source order and can be called any number of times. Entries
/// that don't yield a usable descriptor (no enclosure, unusable URL) are
/// skipped individually — one corrupt entry never blocks its siblings.
pub struct ParsedFeed {
    feed: Feed,
}

impl ParsedFeed {
    /// Feed dialect as stored on the subscription.
    pub fn kind(&self) -> &'static str {
        match self.feed.feed_type {
            FeedType::Atom => "atom",
            FeedType::JSON => "json",
            FeedType::RSS0 | FeedType::RSS1 | FeedType::RSS2 => "rss",
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.feed.title.as_ref().map(|t| t.content.as_str())
    }

    /// Item descriptors in source order, skipping unusable entries.
    pub fn items(&self) -> impl Iterator<Item = ItemDescriptor> + '_ {
        self.feed.entries.iter().filter_map(entry_to_descriptor)
    }

    /// Total entry count, including entries `items()` will skip.
    pub fn entry_count(&self) -> usize {
        self.feed.entries.len()
    }
}

/// Decode raw feed bytes. Dialect is autodetected (RSS 0.x/1.0/2.0, Atom,
/// JSON Feed).
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FeedFormatError> {
    let feed = parser::parse(bytes)?;
    Ok(ParsedFeed { feed })
}

fn entry_to_descriptor(entry: &Entry) -> Option<ItemDescriptor> {
    let enclosures = collect_enclosures(entry);
    // An item without a downloadable enclosure isn't content we can carry.
    if enclosures.is_empty() {
        return None;
    }

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "Untitled".to_string());
    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp());

    let source_id = if entry.id.trim().is_empty() {
        None
    } else {
        Some(entry.id.trim())
    };
    let dedup_key = dedup_key(source_id, &title, &enclosures[0].url);

    Some(ItemDescriptor {
        dedup_key,
        title,
        published,
        enclosures,
        validators: Validators::default(),
    })
}

/// Gather enclosures from both the media metadata (RSS `<enclosure>`,
/// Media RSS) and Atom `rel="enclosure"` links, preserving source order and
/// dropping anything that isn't a well-formed http(s) URL.
fn collect_enclosures(entry: &Entry) -> Vec<Enclosure> {
    let mut out = Vec::new();

    for media in &entry.media {
        for content in &media.content {
            let Some(url) = content.url.as_ref() else {
                continue;
            };
            if !is_fetchable(url.as_str()) {
                continue;
            }
            out.push(Enclosure {
                url: url.to_string(),
                length: content.size.map(|s| s as i64),
                mime_type: content.content_type.as_ref().map(|m| m.to_string()),
            });
        }
    }

    for link in &entry.links {
        if link.rel.as_deref() != Some("enclosure") {
            continue;
        }
        if !is_fetchable(&link.href) {
            continue;
        }
        // Links can repeat what media already declared
        if out.iter().any(|e| e.url == link.href) {
            continue;
        }
        out.push(Enclosure {
            url: link.href.clone(),
            length: link.length.map(|l| l as i64),
            mime_type: link.media_type.clone(),
        });
    }

    out
}

fn is_fetchable(raw: &str) -> bool {
    matches!(
        Url::parse(raw).map(|u| u.scheme().to_ascii_lowercase()),
        Ok(s) if s == "http" || s == "https"
    )
}

/// Stable identity for recognizing an item across polls. The source id wins
/// when present; otherwise a content fingerprint of title + enclosure URL.
fn dedup_key(source_id: Option<&str>, title: &str, enclosure_url: &str) -> String {
    if let Some(id) = source_id {
        return id.to_string();
    }
    let hash = Sha256::digest(format!("{title}|{enclosure_url}").as_bytes());
    format!("{:x}", hash)
}

//! The forward dedup digest. Tokens are collected from the stable content
//! identifiers of a message, sorted, joined and hashed, so token discovery
//! order never changes the digest. Volatile fields (dates, views, chat
//! context) must never feed this hash or the at-most-once invariant breaks.

use sha2::{Digest, Sha256};
use spectra_gateway::GatewayMessage;

/// Compute the content hash of a message.
///
/// Token set: raw text; `media_id:`/`media_hash:` from the media;
/// `file_id:`/`file_size:` from the file view; `webpage_url:` for web
/// pages. A message with media but none of those identifiers falls back to
/// `media_type:<kind>`; a bare service message hashes `message_obj_id:<id>`.
pub fn content_hash(message: &GatewayMessage) -> String {
    let mut tokens: Vec<String> = Vec::new();

    if let Some(text) = &message.text {
        if !text.is_empty() {
            tokens.push(text.clone());
        }
    }

    if let Some(media) = &message.media {
        if let Some(id) = media.id {
            tokens.push(format!("media_id:{id}"));
        }
        if let Some(hash) = media.access_hash {
            tokens.push(format!("media_hash:{hash}"));
        }
        if let Some(url) = &media.url {
            if media.kind == Some(spectra_gateway::MediaKind::Webpage) {
                tokens.push(format!("webpage_url:{url}"));
            }
        }
    }

    if let Some(file) = &message.file {
        if let Some(id) = file.id {
            tokens.push(format!("file_id:{id}"));
        }
        if let Some(size) = file.size {
            tokens.push(format!("file_size:{size}"));
        }
    }

    if tokens.is_empty() {
        if let Some(media) = &message.media {
            let kind = media.kind.map(|k| k.as_str()).unwrap_or("unknown");
            tokens.push(format!("media_type:{kind}"));
        }
    }
    if tokens.is_empty() {
        tokens.push(format!("message_obj_id:{}", message.id));
    }

    tokens.sort();
    let joined = tokens.join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_gateway::{GatewayFile, GatewayMedia, MediaKind};

    fn base(id: i64) -> GatewayMessage {
        GatewayMessage {
            id,
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            edit_date: None,
            text: None,
            reply_to: None,
            sender: None,
            media: None,
            file: None,
            topic_id: None,
            entity_urls: Vec::new(),
            forwarded_from: None,
            is_service: false,
        }
    }

    fn photo(id: i64, access_hash: i64) -> GatewayMedia {
        GatewayMedia {
            id: Some(id),
            access_hash: Some(access_hash),
            kind: Some(MediaKind::Photo),
            ..GatewayMedia::default()
        }
    }

    #[test]
    fn identical_token_sets_hash_equal() {
        let mut a = base(1);
        a.media = Some(photo(42, 7));
        let mut b = base(999); // different message id is irrelevant
        b.media = Some(photo(42, 7));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn date_and_volatile_fields_do_not_affect_hash() {
        let mut a = base(1);
        a.media = Some(photo(42, 7));
        let mut b = a.clone();
        b.date = Utc.with_ymd_and_hms(2030, 12, 31, 23, 59, 59).unwrap();
        b.reply_to = Some(5);
        b.topic_id = Some(9);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn text_changes_the_hash() {
        let mut a = base(1);
        a.text = Some("hello".into());
        let mut b = base(1);
        b.text = Some("world".into());
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn file_identifiers_are_tokenised() {
        let mut a = base(1);
        a.file = Some(GatewayFile {
            id: Some(10),
            size: Some(2048),
            name: Some("x.zip".into()),
            mime: None,
        });
        let mut b = base(1);
        b.file = Some(GatewayFile {
            id: Some(10),
            size: Some(2048),
            name: Some("renamed.zip".into()), // name must not matter
            mime: None,
        });
        assert_eq!(content_hash(&a), content_hash(&b));

        let mut c = base(1);
        c.file = Some(GatewayFile {
            id: Some(10),
            size: Some(4096),
            name: None,
            mime: None,
        });
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn webpage_url_counts_for_webpages_only() {
        let mut page = base(1);
        page.media = Some(GatewayMedia {
            kind: Some(MediaKind::Webpage),
            url: Some("https://example.org/a".into()),
            ..GatewayMedia::default()
        });
        let mut other_page = base(1);
        other_page.media = Some(GatewayMedia {
            kind: Some(MediaKind::Webpage),
            url: Some("https://example.org/b".into()),
            ..GatewayMedia::default()
        });
        assert_ne!(content_hash(&page), content_hash(&other_page));
    }

    #[test]
    fn media_without_identifiers_falls_back_to_type() {
        let mut a = base(1);
        a.media = Some(GatewayMedia {
            kind: Some(MediaKind::Poll),
            ..GatewayMedia::default()
        });
        let mut b = base(2);
        b.media = Some(GatewayMedia {
            kind: Some(MediaKind::Poll),
            ..GatewayMedia::default()
        });
        assert_eq!(content_hash(&a), content_hash(&b));

        let mut c = base(3);
        c.media = Some(GatewayMedia {
            kind: Some(MediaKind::Contact),
            ..GatewayMedia::default()
        });
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn service_message_falls_back_to_object_id() {
        let a = base(17);
        let b = base(18);
        assert_ne!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a), content_hash(&base(17)));
    }

    #[test]
    fn token_order_is_canonical() {
        // Same tokens reached through different field population order.
        let mut a = base(1);
        a.text = Some("caption".into());
        a.media = Some(photo(42, 7));
        a.file = Some(GatewayFile {
            id: Some(10),
            size: Some(1),
            name: None,
            mime: None,
        });
        let hash_one = content_hash(&a);
        let hash_two = content_hash(&a.clone());
        assert_eq!(hash_one, hash_two);
        assert_eq!(hash_one.len(), 64);
    }
}

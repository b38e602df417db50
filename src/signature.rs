// src/signature.rs
//
// MIME decomposition into typed signatures. One message yields up to five
// signature sources, each behind its own minimum-size gate so tiny content
// never produces a meaningless digest:
//
//   normalized  canonical body, > MIN_BODY_LENGTH bytes
//   raw         text + html as received, same gate
//   url         >= 2 distinct normalized URLs, joined form > 100 bytes
//   subject     subjects over 30 chars, repeated to fingerprintable length
//   attachment  images over 50 KiB, anything else over 128 bytes

use std::sync::LazyLock;

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::fingerprint;
use crate::normalize::normalize_body;
use crate::types::{SignatureKind, TypedSignature};

/// Body signatures below this length are skipped entirely.
pub const MIN_BODY_LENGTH: usize = 200;

/// Attachments with an `image/*` content type only count past this size;
/// below it they are logos and tracking pixels.
pub const MIN_IMAGE_SIZE: usize = 50 * 1024;

/// Non-image attachments only count past this size.
pub const MIN_ATTACHMENT_SIZE: usize = 128;

const MIN_SUBJECT_LENGTH: usize = 30;
const SUBJECT_REPEAT: usize = 5;
const MIN_URL_COUNT: usize = 2;
const MIN_URL_JOINED_LENGTH: usize = 100;

static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap());
static RE_URL_TRACKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[?&](utm_[^=&]+|gclid|fbclid|mc_eid|mc_cid|ref|source|campaign)=[^&]*")
        .unwrap()
});

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid MIME envelope: {0}")]
    InvalidMime(String),
}

/// The pieces of a parsed message the analysis pipeline consumes.
#[derive(Debug, Default)]
pub struct Envelope {
    pub message_id:  Option<String>,
    pub subject:     Option<String>,
    pub from:        Option<String>,
    pub text:        String,
    pub html:        String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug)]
pub struct Attachment {
    pub content_type: String,
    pub filename:     Option<String>,
    pub content:      Vec<u8>,
}

/// Parse raw RFC 822 bytes into an [`Envelope`].
pub fn parse_envelope(raw: &[u8]) -> Result<Envelope, SignatureError> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| SignatureError::InvalidMime(e.to_string()))?;

    let mut env = Envelope {
        message_id: parsed.headers.get_first_value("Message-ID"),
        subject:    parsed.headers.get_first_value("Subject"),
        from:       parsed.headers.get_first_value("From"),
        ..Envelope::default()
    };
    collect_parts(&parsed, &mut env);
    Ok(env)
}

fn collect_parts(part: &ParsedMail, env: &mut Envelope) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, env);
        }
        return;
    }

    let mime = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == DispositionType::Attachment;

    if !is_attachment && mime == "text/plain" {
        env.text.push_str(&part.get_body().unwrap_or_default());
    } else if !is_attachment && mime == "text/html" {
        env.html.push_str(&part.get_body().unwrap_or_default());
    } else if !mime.starts_with("multipart/") {
        // Attachments proper, plus inline non-text leaves (embedded images).
        let Ok(content) = part.get_body_raw() else {
            return;
        };
        env.attachments.push(Attachment {
            content_type: mime,
            filename:     disposition.params.get("filename").cloned(),
            content,
        });
    }
}

/// Produce the typed signatures of a parsed message, in matching order.
/// Sources that fail their gate or fail to fingerprint are skipped.
pub fn extract_signatures(env: &Envelope) -> Vec<TypedSignature> {
    let mut signatures = Vec::new();
    let mut push = |content: &[u8], kind: SignatureKind| match fingerprint::compute(content) {
        Ok(digest) => signatures.push(TypedSignature { digest, kind }),
        Err(err) => debug!(kind = %kind, %err, "signature skipped"),
    };

    let normalized = normalize_body(&env.text, &env.html);
    if normalized.len() > MIN_BODY_LENGTH {
        push(normalized.as_bytes(), SignatureKind::Normalized);
    }

    let raw = format!("{}{}", env.text, env.html);
    if raw.len() > MIN_BODY_LENGTH {
        push(raw.as_bytes(), SignatureKind::Raw);
    }

    let urls = extract_urls(&raw);
    if urls.len() >= MIN_URL_COUNT {
        let joined = urls.join("\n");
        if joined.len() > MIN_URL_JOINED_LENGTH {
            push(joined.as_bytes(), SignatureKind::Url);
        }
    }

    if let Some(subject) = env.subject.as_deref() {
        if subject.len() > MIN_SUBJECT_LENGTH {
            let canon = format!("{} ", subject.trim().to_lowercase());
            push(canon.repeat(SUBJECT_REPEAT).as_bytes(), SignatureKind::Subject);
        }
    }

    for att in &env.attachments {
        let is_image = att.content_type.starts_with("image/");
        if (is_image && att.content.len() > MIN_IMAGE_SIZE)
            || (!is_image && att.content.len() > MIN_ATTACHMENT_SIZE)
        {
            push(&att.content, SignatureKind::Attachment);
        }
    }

    signatures
}

/// All distinct normalized `http(s)` URLs in `content`, in first-seen order.
/// Normalization drops tracking parameters and lower-cases the whole URL.
pub fn extract_urls(content: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for m in RE_URL.find_iter(content) {
        let stripped = RE_URL_TRACKERS.replace_all(m.as_str(), "");
        let normalized = stripped.trim_end_matches(['?', '&']).to_lowercase();
        if seen.insert(normalized.clone()) {
            urls.push(normalized);
        }
    }
    urls
}

/// Sender email and domain from a `From` header, handling both
/// `Name <user@host>` and bare `user@host` forms. Lower-cased.
pub fn sender_identities(from: &str) -> (Option<String>, Option<String>) {
    let mut addr = from.trim();
    if let Some(start) = addr.find('<') {
        addr = &addr[start + 1..];
        if let Some(end) = addr.find('>') {
            addr = &addr[..end];
        }
    }
    let addr = addr.trim().to_lowercase();
    if addr.is_empty() {
        return (None, None);
    }
    let domain = addr.split_once('@').map(|(_, d)| d.to_string());
    (Some(addr), domain)
}

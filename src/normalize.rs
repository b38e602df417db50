// src/normalize.rs
//
// Canonical byte form of a message body. Spam campaigns mutate per recipient
// through tracking IDs, inlined style noise, numeric tokens and case, so the
// pipeline strips exactly those axes while leaving the structural text the
// fuzzy hash depends on. Every step is idempotent; running the pipeline twice
// yields the same bytes.

use std::sync::LazyLock;

use regex::Regex;

static RE_IMG_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img([^>]*?)src="[^"]*"([^>]*?)>"#).unwrap());
static RE_HEX_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-fA-F]{8,}").unwrap());
static RE_DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{6,}").unwrap());
static RE_STYLE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\s*style\s*=\s*"[^"]*""#).unwrap());
static RE_TRACKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([?&])(utm_[^=&]+|gclid|fbclid|mc_eid|mc_cid)=[^&\s"'>]+"#).unwrap()
});
static RE_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static RE_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r?\n{2,}").unwrap());

/// Collapse text and HTML parts into the canonical form fed to the
/// fingerprint engine.
pub fn normalize_body(text: &str, html: &str) -> String {
    let mut body = format!("{text}\n\n{html}").trim().to_string();

    body = RE_IMG_SRC
        .replace_all(&body, r#"<img${1}src="imgurl"${2}>"#)
        .into_owned();
    body = RE_HEX_RUN.replace_all(&body, "****").into_owned();
    body = RE_DIGIT_RUN.replace_all(&body, "****").into_owned();
    body = RE_STYLE_ATTR.replace_all(&body, "").into_owned();
    body = RE_TRACKERS.replace_all(&body, "$1").into_owned();

    body = body.to_lowercase();
    body = RE_SPACES.replace_all(&body, " ").into_owned();
    body = RE_BLANK_LINES.replace_all(&body, "\n\n").into_owned();

    body
}

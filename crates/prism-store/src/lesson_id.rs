//! Stable lesson identifiers.
//!
//! Lesson topics are display strings and drift over time ("Redis Hashes",
//! "🎓 Redis hashes!", "Rédis Hashes"). Metadata is keyed by an id derived
//! from the normalized slug so that every variant lands on the same record.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Number of hex characters of the slug digest kept in an id.
const HASH_PREFIX_LEN: usize = 12;

static EXPLICIT_ID: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z0-9_-]{3,32}$").ok());

/// Normalizes a raw topic into a slug.
///
/// Diacritics are decomposed and dropped, emoji and punctuation removed,
/// case folded, and runs of whitespace, `_` and `-` collapsed into one `-`.
///
/// # Examples
///
/// ```
/// use prism_store::slugify;
///
/// assert_eq!(slugify("🎓 Rédis  Hashes!"), "redis-hashes");
/// ```
#[must_use]
pub fn slugify(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();

    let mut slug = String::with_capacity(folded.len());
    let mut pending_dash = false;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
    }
    slug
}

/// Derives the stable metadata id for a raw topic.
///
/// The id is a function of [`slugify`] only, so two topics with the same slug
/// always map to the same id.
#[must_use]
pub fn stable_lesson_id(raw_topic: &str) -> String {
    let digest = Sha256::digest(slugify(raw_topic).as_bytes());
    let hash = hex::encode(digest);
    format!("lesson-{}", &hash[..HASH_PREFIX_LEN])
}

/// Picks the id for a lesson: an explicit short id when one is given and
/// well-formed, otherwise the topic-derived [`stable_lesson_id`].
#[must_use]
pub fn resolve_lesson_id(explicit: Option<&str>, raw_topic: &str) -> String {
    if let (Some(id), Some(re)) = (explicit, EXPLICIT_ID.as_ref()) {
        let id = id.trim().to_lowercase();
        if re.is_match(&id) {
            return id;
        }
    }
    stable_lesson_id(raw_topic)
}

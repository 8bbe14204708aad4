//! Canned answers for free-text questions.
//!
//! Anything typed at the prompt that starts with an interrogative word is a
//! question, not a command attempt. Questions never move the lesson on.

const INTERROGATIVES: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "can", "could", "should", "is",
    "are", "does", "do", "explain",
];

const DEFAULT_ANSWER: &str = "That's a great question! I don't have a specific answer for \
    that one, so try breaking it down: what command are you working with, and what do you \
    expect to happen? Experimenting in the terminal is the best way to learn.";

/// Answers keyed by the words that must all appear in the question.
///
/// Entries are tried in order; the first whose words all appear wins.
const ANSWERS: &[(&[&str], &str)] = &[
    (
        &["difference", "list", "set"],
        "Lists keep order and allow duplicates; sets are unordered and keep each member once. \
         Use a list when order matters (a timeline), a set when uniqueness does (tags).",
    ),
    (
        &["hset"],
        "HSET sets fields in a hash: HSET key field value [field value ...]. \
         For example HSET user:1 name Alice age 30.",
    ),
    (
        &["hget"],
        "HGET reads one field from a hash: HGET key field. Use HGETALL for every field.",
    ),
    (
        &["lpush"],
        "LPUSH adds elements at the head of a list: LPUSH key value [value ...].",
    ),
    (
        &["rpush"],
        "RPUSH adds elements at the tail of a list: RPUSH key value [value ...].",
    ),
    (
        &["sadd"],
        "SADD adds members to a set: SADD key member [member ...]. Duplicates are ignored.",
    ),
    (
        &["when", "hash"],
        "Use a hash for an object with several fields. It is more compact than one key per \
         field and lets you update a single field without reading the rest.",
    ),
    (
        &["when", "list"],
        "Use a list for ordered collections you push to and pop from at either end: \
         queues, activity feeds, recent items.",
    ),
    (
        &["why", "redis"],
        "Redis is used for caching, sessions, real-time counters and queues. It answers in \
         well under a millisecond and has rich data types.",
    ),
    (
        &["what", "hash"],
        "A hash is a small field/value map stored under one key, like a row in a table. \
         It is a good fit for users or products.",
    ),
    (
        &["what", "list"],
        "A list is an ordered sequence of strings. Pushing and popping at either end is fast, \
         which makes lists good queues.",
    ),
    (
        &["what", "set"],
        "A set is an unordered collection of unique strings. Redis removes duplicates for \
         you and supports unions and intersections.",
    ),
    (
        &["ttl"],
        "TTL shows how many seconds until a key expires: -1 means it never expires, -2 means \
         the key does not exist. Set one with EXPIRE.",
    ),
    (
        &["what", "redis"],
        "Redis is an in-memory data structure store. Data lives in RAM, which makes it very \
         fast, and values can be strings, hashes, lists, sets or sorted sets.",
    ),
    (
        &["skip"],
        "You can skip with the Skip button, but give it a try first. Want a hint instead?",
    ),
];

/// Returns `true` if `input` reads as a question rather than a command.
#[must_use]
pub fn is_question(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return false;
    }
    let first = trimmed
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    INTERROGATIVES.contains(&first.as_str())
}

/// The canned answer for `question`, or a general nudge.
#[must_use]
pub fn answer_question(question: &str) -> &'static str {
    let q = question.to_lowercase();
    ANSWERS
        .iter()
        .find(|(words, _)| words.iter().all(|w| q.contains(w)))
        .map_or(DEFAULT_ANSWER, |(_, answer)| answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_question() {
        assert!(is_question("What is a hash?"));
        assert!(is_question("  how do I read a list"));
        assert!(is_question("why"));
        assert!(is_question("Can I skip this"));
        assert!(!is_question("HSET user:1 name Alice"));
        assert!(!is_question("EXISTS key"));
        assert!(!is_question("whatever"));
        assert!(!is_question(""));
    }

    #[test]
    fn test_answers() {
        assert!(answer_question("What is a hash?").starts_with("A hash"));
        assert!(answer_question("what does HSET do").starts_with("HSET"));
        assert!(answer_question("what's the difference between a list and a set").starts_with("Lists"));
        assert!(answer_question("what is redis").starts_with("Redis is an in-memory"));
        assert_eq!(answer_question("how do I bake bread"), DEFAULT_ANSWER);
    }
}

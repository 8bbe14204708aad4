//! Streaming prompt parser.
//!
//! Terminal output arrives in arbitrary chunks. The parser keeps one rolling
//! buffer per session, finds the last `<prompt><command>` line, and declares
//! the cycle complete once the buffer's tail is a bare prompt again. The
//! lines in between are the command's output.
//!
//! Line-editor redraws during history recall are not interpreted; the last
//! prompt occurrence on a line wins, which is usually right but not always.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::Result;

static ANSI: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",          // CSI
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)", // OSC
        r"|\x1b[@-Z\\-_]",                   // two-byte escapes
        r"|\x1b",                            // stray ESC
        r"|\r",
    ))
    .ok()
});

/// Removes ANSI escape sequences and carriage returns.
///
/// Every ESC byte and every `\r` is removed, so the result never contains
/// anything this function would strip again.
///
/// # Examples
///
/// ```
/// use prism_capture::strip_ansi;
///
/// assert_eq!(strip_ansi("\x1b[1mOK\x1b[0m\r\n"), "OK\n");
/// ```
#[must_use]
pub fn strip_ansi(input: &str) -> String {
    match ANSI.as_ref() {
        Some(re) => re.replace_all(input, "").into_owned(),
        None => input.replace(['\x1b', '\r'], ""),
    }
}

/// The CLI prompt for one server, with any database suffix.
///
/// Matches `host:port>` for database 0 and `host:port[n]>` otherwise.
#[derive(Debug, Clone)]
pub struct PromptPattern {
    literal: String,
    anywhere: Regex,
    bare: Regex,
}

impl PromptPattern {
    /// Builds the pattern for `host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let literal = format!("{host}:{port}");
        let escaped = regex::escape(&literal);
        Ok(Self {
            anywhere: Regex::new(&format!(r"{escaped}(?:\[(\d+)\])?>"))?,
            bare: Regex::new(&format!(r"^{escaped}(?:\[(\d+)\])?>\s*$"))?,
            literal,
        })
    }

    /// The `host:port` part of the prompt.
    #[must_use]
    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// If `line` is exactly a prompt (trailing whitespace allowed), returns
    /// its database index.
    #[must_use]
    pub fn bare_database(&self, line: &str) -> Option<u8> {
        self.bare.captures(line).map(|caps| database_of(&caps))
    }

    /// Splits `line` on its last prompt occurrence, returning the database
    /// index and the trimmed text after it.
    #[must_use]
    pub fn split_command<'a>(&self, line: &'a str) -> Option<(u8, &'a str)> {
        let caps = self.anywhere.captures_iter(line).last()?;
        let end = caps.get(0)?.end();
        Some((database_of(&caps), line[end..].trim()))
    }

    /// Returns `true` if `line` contains a prompt anywhere.
    #[must_use]
    pub fn contains_prompt(&self, line: &str) -> bool {
        self.anywhere.is_match(line)
    }

    fn last_match_start(&self, text: &str) -> Option<usize> {
        self.anywhere.find_iter(text).last().map(|m| m.start())
    }
}

fn database_of(caps: &regex::Captures<'_>) -> u8 {
    caps.get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// What a chunk of terminal output produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A command line was submitted.
    Captured(String),
    /// The command finished and the prompt is back.
    Completed {
        /// Command text, ANSI stripped.
        command: String,
        /// Non-empty, non-prompt lines printed by the command.
        output: String,
        /// Database the command ran against.
        database: u8,
    },
}

/// Rolling-buffer parser for one terminal session.
///
/// Single owner; the buffer needs no synchronization.
#[derive(Debug)]
pub struct CommandParser {
    prompt: PromptPattern,
    buffer: String,
    partial_utf8: Vec<u8>,
    pending: Option<String>,
    active_database: u8,
    max_buffer: usize,
}

impl CommandParser {
    /// Creates a parser that evicts once the buffer exceeds `max_buffer`
    /// bytes without completing a cycle.
    #[must_use]
    pub const fn new(prompt: PromptPattern, max_buffer: usize) -> Self {
        Self {
            prompt,
            buffer: String::new(),
            partial_utf8: Vec::new(),
            pending: None,
            active_database: 0,
            max_buffer,
        }
    }

    /// Database shown by the most recent bare prompt.
    #[must_use]
    pub const fn active_database(&self) -> u8 {
        self.active_database
    }

    /// Current size of the rolling buffer in bytes.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discards all buffered state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.partial_utf8.clear();
        self.pending = None;
    }

    /// Feeds raw PTY bytes. A UTF-8 sequence split across chunks is held
    /// back until its remaining bytes arrive.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<ParserEvent> {
        self.partial_utf8.extend_from_slice(chunk);
        let complete = complete_utf8_prefix(&self.partial_utf8);
        let rest = self.partial_utf8.split_off(complete);
        let text = String::from_utf8_lossy(&self.partial_utf8).into_owned();
        self.partial_utf8 = rest;
        self.feed(&text)
    }

    /// Feeds decoded terminal text.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        let cleaned = strip_ansi(&self.buffer);
        let (complete_lines, tail) = match cleaned.rfind('\n') {
            Some(i) => (&cleaned[..i], &cleaned[i + 1..]),
            None => ("", cleaned.as_str()),
        };

        // Last submitted command line wins
        let submitted = complete_lines
            .split('\n')
            .enumerate()
            .filter_map(|(i, line)| {
                self.prompt
                    .split_command(line)
                    .filter(|(_, cmd)| !cmd.is_empty())
                    .map(|(db, cmd)| (i, db, cmd.to_string()))
            })
            .last();

        if let Some((_, _, command)) = &submitted {
            if self.pending.as_deref() != Some(command.as_str()) {
                debug!(command = %command, "Command captured");
                events.push(ParserEvent::Captured(command.clone()));
                self.pending = Some(command.clone());
            }
        }

        if let Some(db) = self.prompt.bare_database(tail) {
            self.active_database = db;
            match submitted {
                Some((index, database, command)) => {
                    let output = complete_lines
                        .split('\n')
                        .skip(index + 1)
                        .filter(|line| !line.trim().is_empty())
                        .filter(|line| !self.prompt.contains_prompt(line))
                        .collect::<Vec<_>>()
                        .join("\n");
                    debug!(command = %command, database, "Command completed");
                    events.push(ParserEvent::Completed {
                        command,
                        output,
                        database,
                    });
                }
                None => {
                    // Empty submissions or startup banner; nothing to report
                }
            }
            // Keep the prompt so the next command line is recognised
            self.buffer = tail.to_string();
            self.pending = None;
            return events;
        }

        if self.buffer.len() > self.max_buffer {
            self.evict(&cleaned);
        }
        events
    }

    fn evict(&mut self, cleaned: &str) {
        let before = self.buffer.len();
        let kept = self.prompt.last_match_start(cleaned).map_or("", |start| {
            // Back up to the start of the prompt's line
            let line_start = cleaned[..start].rfind('\n').map_or(0, |i| i + 1);
            &cleaned[line_start..]
        });
        self.buffer = self.bounded(kept);
        if self.buffer.is_empty() {
            self.pending = None;
        }
        warn!(
            before,
            after = self.buffer.len(),
            limit = self.max_buffer,
            "Parser buffer over limit without a completed command, evicted"
        );
    }

    /// Fits `kept` into the buffer limit: the command line stays, followed by
    /// the newest whole output lines that fit. Empty when the command line
    /// alone is over the limit.
    fn bounded(&self, kept: &str) -> String {
        if kept.len() <= self.max_buffer {
            return kept.to_string();
        }
        let Some(newline) = kept.find('\n') else {
            return String::new();
        };
        let (command_line, output) = kept.split_at(newline + 1);
        let Some(room) = self.max_buffer.checked_sub(command_line.len()) else {
            return String::new();
        };

        let mut cut = output.len().saturating_sub(room);
        while !output.is_char_boundary(cut) {
            cut += 1;
        }
        let newest = &output[cut..];
        // Drop the partial line left at the cut
        let newest = if cut == 0 || output[..cut].ends_with('\n') {
            newest
        } else {
            newest.find('\n').map_or("", |i| &newest[i + 1..])
        };
        format!("{command_line}{newest}")
    }
}

/// Length of the longest prefix of `bytes` that does not end inside an
/// incomplete UTF-8 sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes mid-stream are replaced by the lossy decode
        Err(_) => bytes.len(),
    }
}

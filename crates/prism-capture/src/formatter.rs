//! Canonical output for completed commands.
//!
//! Read-only commands are run a second time out of band with `--csv`, which
//! gives an unambiguous rendering. Mutating commands are never re-run; their
//! canonical form is derived from the terminal text instead.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{CaptureError, Result};

const READ_ONLY_COMMANDS: &[&str] = &[
    "GET", "MGET", "HGET", "HGETALL", "HEXISTS", "HLEN", "HKEYS", "HVALS", "LRANGE", "LLEN",
    "LINDEX", "ZRANGE", "ZRANGEBYSCORE", "ZREVRANGE", "ZCARD", "ZRANK", "ZREVRANK", "SCARD",
    "SMEMBERS", "SISMEMBER", "SDIFF", "SINTER", "SUNION", "EXISTS", "TYPE", "TTL", "PTTL",
    "KEYS", "SCAN", "GETRANGE", "STRLEN", "PING",
];

static INTEGER_REPLY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\(integer\)\s+(-?\d+)").ok());
static ARRAY_ITEM: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\d+\)\s*").ok());

/// Returns `true` if re-running `command` cannot change any data.
#[must_use]
pub fn is_read_only(command: &str) -> bool {
    command.split_whitespace().next().is_some_and(|op| {
        READ_ONLY_COMMANDS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(op))
    })
}

/// Best-effort canonical form of a reply, from its terminal rendering.
///
/// | Terminal | Canonical |
/// |----------|-----------|
/// | `(integer) 5` | `5` |
/// | `OK` | `OK` |
/// | `(nil)` | empty |
/// | `"text"` | `"text"` |
/// | `1) "a"` / `2) "b"` | `"a","b"` |
#[must_use]
pub fn derive_csv_from_terminal(output: &str) -> String {
    let trimmed = output.trim();

    if let Some(caps) = INTEGER_REPLY.as_ref().and_then(|re| re.captures(trimmed)) {
        if let Some(n) = caps.get(1) {
            return n.as_str().to_string();
        }
    }
    if trimmed.eq_ignore_ascii_case("OK") {
        return "OK".to_string();
    }
    if trimmed.eq_ignore_ascii_case("(nil)") {
        return String::new();
    }
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        return trimmed.to_string();
    }

    if let Some(item) = ARRAY_ITEM.as_ref() {
        if trimmed.lines().any(|line| item.is_match(line)) {
            return trimmed
                .lines()
                .map(|line| {
                    let value = item.replace(line.trim(), "");
                    let value = value.strip_prefix('"').unwrap_or(&value);
                    let value = value.strip_suffix('"').unwrap_or(value);
                    format!("\"{value}\"")
                })
                .collect::<Vec<_>>()
                .join(",");
        }
    }

    trimmed.to_string()
}

/// Splits a command line into arguments the way the CLI does: whitespace
/// separated, with single or double quotes grouping words and `\` escaping
/// inside double quotes.
#[must_use]
pub fn split_command_args(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Produces canonical output by querying the server a second time.
#[derive(Debug, Clone)]
pub struct ResultFormatter {
    program: String,
    host: String,
    port: u16,
    timeout: Duration,
}

impl ResultFormatter {
    /// Creates a formatter that runs `program` against `host:port`, giving
    /// each query at most `timeout`.
    pub fn new(
        program: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Canonical output for a completed command.
    ///
    /// Never fails: a query that errors or times out yields an empty string.
    pub async fn canonical_output(
        &self,
        command: &str,
        terminal_output: &str,
        database: u8,
    ) -> String {
        if !is_read_only(command) {
            return derive_csv_from_terminal(terminal_output);
        }
        match self.query_csv(command, database).await {
            Ok(csv) => csv,
            Err(e) => {
                warn!(command = %command, "{}", e);
                String::new()
            }
        }
    }

    /// Runs `command` with `--csv` against `database`.
    pub async fn query_csv(&self, command: &str, database: u8) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-n")
            .arg(database.to_string())
            .arg("--csv")
            .args(split_command_args(command))
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CaptureError::FormatterTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        if !output.status.success() {
            debug!(command = %command, status = ?output.status, "CSV query exited unsuccessfully");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

//! Interactive choices made on the operator's console.
//!
//! Course selection, resume or start fresh, and save or discard at the end of
//! a lesson are all a pick from a short list. [`ConsolePrompt`] is that
//! contract; [`StdinPrompt`] asks on the terminal and [`ScriptedPrompt`]
//! answers from a fixed script.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PrismError, Result};

/// Picks one of a list of labeled options.
#[async_trait]
pub trait ConsolePrompt: Send + Sync {
    /// Shows `prompt` and `options` and returns the index of the chosen one.
    async fn choose_option(&self, prompt: &str, options: &[String]) -> Result<usize>;
}

/// Asks on stdin/stdout, re-asking until a valid number is entered.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl ConsolePrompt for StdinPrompt {
    async fn choose_option(&self, prompt: &str, options: &[String]) -> Result<usize> {
        if options.is_empty() {
            return Err(PrismError::transport("no options to choose from"));
        }
        let prompt = prompt.to_string();
        let options = options.to_vec();
        tokio::task::spawn_blocking(move || ask_blocking(&prompt, &options))
            .await
            .map_err(|e| PrismError::transport(format!("console prompt failed: {e}")))?
    }
}

fn ask_blocking(prompt: &str, options: &[String]) -> Result<usize> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        writeln!(stdout, "\n{prompt}")?;
        for (i, option) in options.iter().enumerate() {
            writeln!(stdout, "  {}. {option}", i + 1)?;
        }
        write!(stdout, "> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(PrismError::transport("console closed"));
        }
        match parse_choice(&line, options.len()) {
            Some(index) => return Ok(index),
            None => writeln!(stdout, "Please enter a number from 1 to {}", options.len())?,
        }
    }
}

/// Parses a 1-based choice into a 0-based index.
fn parse_choice(input: &str, count: usize) -> Option<usize> {
    input
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=count).contains(n))
        .map(|n| n - 1)
}

/// Answers from a queue of pre-recorded choices; used for tests and
/// non-interactive runs.
///
/// Once the script runs out every question gets `fallback`.
#[derive(Debug)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<usize>>,
    fallback: usize,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    /// A prompt answering `answers` in order, then `0`.
    pub fn new(answers: impl IntoIterator<Item = usize>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            fallback: 0,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Sets the answer used once the script is exhausted.
    #[must_use]
    pub const fn with_fallback(mut self, fallback: usize) -> Self {
        self.fallback = fallback;
        self
    }

    /// Prompts asked so far, in order.
    pub async fn asked(&self) -> Vec<String> {
        self.asked.lock().await.clone()
    }
}

#[async_trait]
impl ConsolePrompt for ScriptedPrompt {
    async fn choose_option(&self, prompt: &str, options: &[String]) -> Result<usize> {
        self.asked.lock().await.push(prompt.to_string());
        let answer = self.answers.lock().await.pop_front().unwrap_or(self.fallback);
        debug!(prompt = %prompt, answer, "Scripted answer");
        if answer < options.len() {
            Ok(answer)
        } else {
            Err(PrismError::transport(format!(
                "scripted answer {answer} out of range for {} options",
                options.len()
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options() -> Vec<String> {
        vec!["Save".to_string(), "Discard".to_string()]
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1\n", 2), Some(0));
        assert_eq!(parse_choice(" 2 ", 2), Some(1));
        assert_eq!(parse_choice("0", 2), None);
        assert_eq!(parse_choice("3", 2), None);
        assert_eq!(parse_choice("save", 2), None);
    }

    #[tokio::test]
    async fn test_scripted_prompt() {
        let prompt = ScriptedPrompt::new([1]).with_fallback(0);
        assert_eq!(prompt.choose_option("Keep?", &options()).await.unwrap(), 1);
        assert_eq!(prompt.choose_option("Again?", &options()).await.unwrap(), 0);
        assert_eq!(prompt.asked().await, vec!["Keep?", "Again?"]);
    }

    #[tokio::test]
    async fn test_scripted_prompt_out_of_range() {
        let prompt = ScriptedPrompt::new([5]);
        assert!(prompt.choose_option("Keep?", &options()).await.is_err());
    }
}

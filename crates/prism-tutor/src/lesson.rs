//! Lesson plans and the lesson catalog.
//!
//! A [`LessonPlan`] is an ordered list of [`Exercise`]s. Exercises are a closed
//! sum type: a single command to type, a guided sequence of commands, or a
//! worked example with an optional follow-up. Plans come from the built-in
//! catalog and, optionally, from a JSON lessons file.

use std::collections::HashSet;
use std::path::Path;

use prism_store::resolve_lesson_id;
use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

/// Maximum allowed lessons file size in bytes (100KB).
pub const MAX_LESSON_FILE_SIZE: u64 = 100 * 1024;

// ============================================================================
// Exercises
// ============================================================================

/// One command in a guided `teach` exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidedStep {
    /// Command the learner should type.
    pub command: String,
    /// What the command does.
    pub explanation: String,
}

/// What the learner has to do for an exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExerciseKind {
    /// Type one command.
    #[serde(rename_all = "camelCase")]
    Command {
        /// Expected command, compared case-insensitively.
        command: String,
        /// Regex the terminal output must match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_pattern: Option<String>,
        /// Canonical output the result must equal.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_output: Option<String>,
    },
    /// Type a sequence of commands in order.
    Teach {
        /// The guided steps.
        steps: Vec<GuidedStep>,
    },
    /// Read a demonstration, then optionally type one command.
    #[serde(rename_all = "camelCase")]
    WorkedExample {
        /// The demonstration shown to the learner.
        demonstration: String,
        /// Command to type afterwards; without one the exercise completes
        /// on its own.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow_up: Option<String>,
    },
}

/// One exercise in a lesson plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    /// Type-specific fields.
    #[serde(flatten)]
    pub kind: ExerciseKind,
    /// Shown when the exercise is completed.
    pub feedback: String,
    /// Author-provided hint, used at hint level 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// The idea the exercise teaches, used at hint level 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
}

impl Exercise {
    /// A `command` exercise.
    pub fn command(command: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            kind: ExerciseKind::Command {
                command: command.into(),
                expected_pattern: None,
                expected_output: None,
            },
            feedback: feedback.into(),
            hint: None,
            concept: None,
        }
    }

    /// Sets the hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Sets the concept.
    #[must_use]
    pub fn with_concept(mut self, concept: impl Into<String>) -> Self {
        self.concept = Some(concept.into());
        self
    }

    /// The command the learner is expected to type next, given how many
    /// guided steps are already done.
    #[must_use]
    pub fn expected_command(&self, step: usize) -> Option<&str> {
        match &self.kind {
            ExerciseKind::Command { command, .. } => Some(command),
            ExerciseKind::Teach { steps } => steps.get(step).map(|s| s.command.as_str()),
            ExerciseKind::WorkedExample { follow_up, .. } => follow_up.as_deref(),
        }
    }

    /// Text presenting the exercise at guided step `step`.
    #[must_use]
    pub fn prompt(&self, step: usize) -> String {
        match &self.kind {
            ExerciseKind::Command { command, .. } => format!("Try: {command}"),
            ExerciseKind::Teach { steps } => match steps.get(step) {
                Some(s) => format!(
                    "Step {} of {}: {}\nType: {}",
                    step + 1,
                    steps.len(),
                    s.explanation,
                    s.command
                ),
                None => "All steps done.".to_string(),
            },
            ExerciseKind::WorkedExample {
                demonstration,
                follow_up,
            } => match follow_up {
                Some(cmd) => format!("{demonstration}\n\nNow you try: {cmd}"),
                None => demonstration.clone(),
            },
        }
    }

    /// Short label for progress displays.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.kind {
            ExerciseKind::Command { command, .. } => command.clone(),
            ExerciseKind::Teach { steps } => {
                format!("Guided: {}", steps.first().map_or("", |s| s.command.as_str()))
            }
            ExerciseKind::WorkedExample { follow_up, .. } => follow_up
                .clone()
                .unwrap_or_else(|| "Worked example".to_string()),
        }
    }
}

/// Compares a typed command with an expected one: surrounding whitespace is
/// ignored and case is folded, nothing else.
#[must_use]
pub fn commands_match(typed: &str, expected: &str) -> bool {
    typed.trim().to_uppercase() == expected.trim().to_uppercase()
}

// ============================================================================
// Lesson plans
// ============================================================================

/// Difficulty of a lesson plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// First contact with the topic.
    #[default]
    Beginner,
    /// Knows the basics.
    Intermediate,
    /// Comfortable with the topic.
    Advanced,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Beginner => write!(f, "beginner"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

/// What happens to a lesson's database when the lesson completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatePolicy {
    /// Ask the learner (default).
    #[default]
    Ask,
    /// Always save.
    Persist,
    /// Always flush and forget.
    Discard,
}

/// An ordered set of exercises on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonPlan {
    /// Explicit stable id; derived from the topic when absent or malformed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
    /// Display topic.
    pub topic: String,
    /// Difficulty.
    #[serde(default)]
    pub level: Level,
    /// What the learner will get out of it.
    pub summary: String,
    /// Exercises in order.
    pub exercises: Vec<Exercise>,
    /// What to do with the database on completion.
    #[serde(default)]
    pub state_policy: StatePolicy,
    /// Words in a learner's goal that point at this plan.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Commands suggested during the diagnostic phase.
    #[serde(default)]
    pub diagnostic: Vec<String>,
}

impl LessonPlan {
    /// The stable id keying this plan's saved state.
    #[must_use]
    pub fn stable_id(&self) -> String {
        resolve_lesson_id(self.lesson_id.as_deref(), &self.topic)
    }

    /// Diagnostic suggestion number `n` (0-based), if the plan has one.
    #[must_use]
    pub fn diagnostic_suggestion(&self, n: usize) -> Option<&str> {
        self.diagnostic.get(n).map(String::as_str)
    }

    /// How well `goal` matches this plan's keywords.
    #[must_use]
    pub fn keyword_score(&self, goal: &str) -> usize {
        let goal = goal.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| !k.is_empty() && goal.contains(&k.to_lowercase()))
            .count()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("a lesson has an empty topic".to_string());
        }
        if self.exercises.is_empty() {
            return Err(format!("lesson '{}' has no exercises", self.topic));
        }
        for (i, exercise) in self.exercises.iter().enumerate() {
            let empty = match &exercise.kind {
                ExerciseKind::Command { command, .. } => command.trim().is_empty(),
                ExerciseKind::Teach { steps } => {
                    steps.is_empty() || steps.iter().any(|s| s.command.trim().is_empty())
                }
                ExerciseKind::WorkedExample { demonstration, .. } => {
                    demonstration.trim().is_empty()
                }
            };
            if empty {
                return Err(format!(
                    "exercise {} of lesson '{}' is empty",
                    i + 1,
                    self.topic
                ));
            }
            if let ExerciseKind::Command {
                expected_pattern: Some(pattern),
                ..
            } = &exercise.kind
            {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(format!(
                        "exercise {} of lesson '{}' has an invalid pattern: {e}",
                        i + 1,
                        self.topic
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// The lesson plans available to a session.
#[derive(Debug, Clone)]
pub struct LessonCatalog {
    plans: Vec<LessonPlan>,
}

impl LessonCatalog {
    /// Creates a catalog from `plans`, which must not be empty.
    pub fn new(plans: Vec<LessonPlan>) -> Result<Self> {
        if plans.is_empty() {
            return Err(PrismError::NoLessonPlans);
        }
        Ok(Self { plans })
    }

    /// The built-in catalog.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            plans: builtin_plans(),
        }
    }

    /// The built-in catalog extended with plans from a JSON file.
    ///
    /// The file holds an array of plans. A plan whose stable id matches a
    /// built-in plan replaces it.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::LessonFileNotFound` if the file doesn't exist,
    /// `PrismError::LessonFileTooLarge` if it exceeds 100KB,
    /// `PrismError::LessonFileEncoding` if it is not UTF-8, and
    /// `PrismError::LessonFileInvalid` if a plan is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PrismError::lesson_file_not_found(path)
            } else {
                PrismError::Io(e)
            }
        })?;

        let file_size = metadata.len();
        if file_size > MAX_LESSON_FILE_SIZE {
            return Err(PrismError::lesson_file_too_large(path, file_size / 1024));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                PrismError::lesson_file_encoding(path)
            } else {
                PrismError::Io(e)
            }
        })?;

        let extra: Vec<LessonPlan> = serde_json::from_str(&content)
            .map_err(|e| PrismError::lesson_file_invalid(path, e.to_string()))?;
        for plan in &extra {
            plan.validate()
                .map_err(|message| PrismError::lesson_file_invalid(path, message))?;
        }

        let mut catalog = Self::builtin();
        catalog.merge(extra);
        Ok(catalog)
    }

    fn merge(&mut self, extra: Vec<LessonPlan>) {
        let replaced: HashSet<String> = extra.iter().map(LessonPlan::stable_id).collect();
        self.plans.retain(|plan| !replaced.contains(&plan.stable_id()));
        let mut merged = extra;
        merged.append(&mut self.plans);
        self.plans = merged;
    }

    /// All plans, in selection order.
    #[must_use]
    pub fn plans(&self) -> &[LessonPlan] {
        &self.plans
    }

    /// Topic of every plan, for a course menu.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.plans.iter().map(|p| p.topic.clone()).collect()
    }

    /// Picks the plan whose keywords best overlap `goal`.
    ///
    /// Ties go to the earlier plan; with no overlap at all the first plan is
    /// used.
    #[must_use]
    pub fn select(&self, goal: &str) -> &LessonPlan {
        let mut best = &self.plans[0];
        let mut best_score = 0;
        for plan in &self.plans {
            let score = plan.keyword_score(goal);
            if score > best_score {
                best = plan;
                best_score = score;
            }
        }
        best
    }

    /// Finds a plan by stable id or by topic slug.
    #[must_use]
    pub fn find(&self, id_or_topic: &str) -> Option<&LessonPlan> {
        let wanted = id_or_topic.trim();
        let as_topic = prism_store::stable_lesson_id(wanted);
        self.plans.iter().find(|plan| {
            let id = plan.stable_id();
            id.eq_ignore_ascii_case(wanted) || id == as_topic
        })
    }
}

impl Default for LessonCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn step(command: &str, explanation: &str) -> GuidedStep {
    GuidedStep {
        command: command.to_string(),
        explanation: explanation.to_string(),
    }
}

fn builtin_plans() -> Vec<LessonPlan> {
    vec![
        LessonPlan {
            lesson_id: Some("redis-hashes".to_string()),
            topic: "Redis Hashes - Basics".to_string(),
            level: Level::Beginner,
            summary: "Learn to store and retrieve fields in Redis hashes".to_string(),
            exercises: vec![
                Exercise::command(
                    "HSET user:2 email alice@example.com",
                    "Perfect! You stored another field in the hash.",
                )
                .with_concept("HSET writes one or more field/value pairs into the hash at a key.")
                .with_hint("The key is user:2, the field is email."),
                Exercise::command("HGET user:2 email", "Great! You retrieved the email field.")
                    .with_concept("HGET reads a single field from a hash.")
                    .with_hint("Give HGET the key and then the field name."),
                Exercise::command(
                    "HGETALL user:2",
                    "Excellent! You retrieved all fields from the hash.",
                )
                .with_concept("HGETALL returns every field and value of a hash.")
                .with_hint("HGETALL only needs the key."),
                Exercise::command(
                    "HSET product:1 name \"Laptop\" price 999",
                    "Nice! You can set multiple fields at once.",
                )
                .with_concept("HSET accepts several field/value pairs in one call.")
                .with_hint("Write name first, then price, on product:1."),
                Exercise::command(
                    "HINCRBY product:1 price 50",
                    "Perfect! You incremented a numeric field.",
                )
                .with_concept("HINCRBY adds an integer to a numeric hash field.")
                .with_hint("Increment the price field of product:1 by 50."),
            ],
            state_policy: StatePolicy::Ask,
            keywords: vec!["hash".to_string(), "hset".to_string(), "field".to_string()],
            diagnostic: vec![
                "HSET user:1 name Alice".to_string(),
                "HGET user:1 name".to_string(),
            ],
        },
        LessonPlan {
            lesson_id: Some("redis-lists".to_string()),
            topic: "Redis Lists - Basics".to_string(),
            level: Level::Beginner,
            summary: "Learn to work with Redis lists".to_string(),
            exercises: vec![
                Exercise::command("LPUSH queue \"task2\"", "Great! Added to the left of the list.")
                    .with_concept("LPUSH inserts at the head of a list."),
                Exercise::command("RPUSH queue \"task3\"", "Perfect! Added to the right of the list.")
                    .with_concept("RPUSH appends at the tail of a list."),
                Exercise::command("LRANGE queue 0 -1", "Nice! You viewed all items in the list.")
                    .with_concept("LRANGE returns a slice; 0 -1 means the whole list.")
                    .with_hint("Negative indexes count from the end."),
                Exercise::command("LPOP queue", "Excellent! Removed from the left.")
                    .with_concept("LPOP removes and returns the head of a list."),
            ],
            state_policy: StatePolicy::Ask,
            keywords: vec!["list".to_string(), "queue".to_string(), "push".to_string()],
            diagnostic: vec![
                "LPUSH queue \"task1\"".to_string(),
                "LLEN queue".to_string(),
            ],
        },
        LessonPlan {
            lesson_id: Some("redis-strings".to_string()),
            topic: "Redis Strings - Counters".to_string(),
            level: Level::Beginner,
            summary: "Learn to use strings as values and counters".to_string(),
            exercises: vec![
                Exercise {
                    kind: ExerciseKind::WorkedExample {
                        demonstration: "Strings hold any value up to 512MB. \
                                        SET greeting \"hello\" stores it, GET greeting reads it back."
                            .to_string(),
                        follow_up: Some("SET greeting \"hello\"".to_string()),
                    },
                    feedback: "Stored!".to_string(),
                    hint: None,
                    concept: Some("SET stores a value at a key.".to_string()),
                },
                Exercise {
                    kind: ExerciseKind::Teach {
                        steps: vec![
                            step("SET counter 10", "Start a counter at 10."),
                            step("INCR counter", "INCR adds one atomically."),
                            step("INCRBY counter 5", "INCRBY adds any amount."),
                        ],
                    },
                    feedback: "You built an atomic counter.".to_string(),
                    hint: Some("Follow the steps in order.".to_string()),
                    concept: Some(
                        "Strings holding integers can be incremented in place.".to_string(),
                    ),
                },
                Exercise {
                    kind: ExerciseKind::Command {
                        command: "GET counter".to_string(),
                        expected_pattern: Some("16".to_string()),
                        expected_output: Some("\"16\"".to_string()),
                    },
                    feedback: "10 + 1 + 5 = 16.".to_string(),
                    hint: Some("Read the counter back.".to_string()),
                    concept: Some("GET returns the current value.".to_string()),
                },
            ],
            state_policy: StatePolicy::Ask,
            keywords: vec![
                "string".to_string(),
                "counter".to_string(),
                "incr".to_string(),
            ],
            diagnostic: vec!["SET counter 0".to_string(), "GET counter".to_string()],
        },
        LessonPlan {
            lesson_id: Some("redis-sets".to_string()),
            topic: "Redis Sets - Basics".to_string(),
            level: Level::Beginner,
            summary: "Learn to keep unique members in sets".to_string(),
            exercises: vec![
                Exercise::command("SADD tags \"rust\"", "Added a member.")
                    .with_concept("SADD adds members; duplicates are ignored."),
                Exercise::command("SMEMBERS tags", "Those are all the members.")
                    .with_concept("SMEMBERS lists every member, in no particular order."),
                Exercise::command("SISMEMBER tags \"redis\"", "Membership checks are O(1).")
                    .with_concept("SISMEMBER answers 1 or 0."),
            ],
            state_policy: StatePolicy::Ask,
            keywords: vec!["set".to_string(), "unique".to_string(), "tag".to_string()],
            diagnostic: vec!["SADD tags \"redis\"".to_string(), "SCARD tags".to_string()],
        },
    ]
}

//! In-memory tutoring state for one session.
//!
//! A session starts in [`Mode::Diagnostic`], watching a couple of commands
//! before a lesson plan is chosen, and then moves to [`Mode::Lesson`] where it
//! walks the plan's exercises in order. The lesson is complete once the
//! exercise index runs past the last exercise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};
use crate::lesson::{Exercise, LessonPlan};

/// Highest hint level; requests past it repeat it.
pub const MAX_HINT_LEVEL: u8 = 3;

/// Number of diagnostic commands observed before a plan is chosen.
pub const DIAGNOSTIC_COMMANDS: usize = 2;

// ============================================================================
// Mode and ExerciseState
// ============================================================================

/// Phase of the tutoring state machine.
///
/// The only transition is `Diagnostic` -> `Lesson`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Observing commands to pick a lesson plan.
    #[default]
    Diagnostic,
    /// Working through a lesson plan.
    Lesson,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diagnostic => write!(f, "diagnostic"),
            Self::Lesson => write!(f, "lesson"),
        }
    }
}

/// Where one exercise stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseState {
    /// Not reached yet.
    #[default]
    Untouched,
    /// The exercise being worked on.
    Current,
    /// Answered correctly.
    Completed,
    /// Skipped without evaluation.
    Skipped,
}

impl ExerciseState {
    /// Returns `true` once the exercise will not be revisited.
    ///
    /// # Examples
    ///
    /// ```
    /// use prism_tutor::ExerciseState;
    ///
    /// assert!(ExerciseState::Completed.is_finished());
    /// assert!(ExerciseState::Skipped.is_finished());
    /// assert!(!ExerciseState::Current.is_finished());
    /// ```
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

// ============================================================================
// SessionContext and ProgressUpdate
// ============================================================================

/// Who the session is for and what they want to learn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    /// Identifier stamped on every captured command of this session.
    pub session_id: String,
    /// The learner's stated goal, matched against plan keywords.
    pub goal: String,
    /// A course picked explicitly (lesson id or topic); wins over the goal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    /// A context starting now.
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            goal: goal.into(),
            course: None,
            started_at: Utc::now(),
        }
    }

    /// Pins the course.
    #[must_use]
    pub fn with_course(mut self, course: impl Into<String>) -> Self {
        self.course = Some(course.into());
        self
    }
}

/// Snapshot of lesson progress sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Topic and level, e.g. `Redis Lists - Basics (beginner)`.
    pub topic: String,
    /// Index of the current exercise.
    pub exercise_index: usize,
    /// Number of exercises in the plan.
    pub total_exercises: usize,
    /// Label of the current exercise, or `Complete!`.
    pub current_exercise: String,
    /// State of every exercise, in order.
    pub exercise_states: Vec<ExerciseState>,
}

// ============================================================================
// SessionState
// ============================================================================

/// The evaluator's view of one tutoring session.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identity and goal.
    pub context: SessionContext,
    /// Topic shown to the learner.
    pub current_topic: String,
    /// Commands seen during the diagnostic phase.
    pub diagnostic_commands: Vec<String>,
    /// Lesson database, always in 1..=15.
    pub redis_db: u8,
    /// Stable id keying this lesson's saved state.
    pub lesson_id: String,
    mode: Mode,
    lesson_plan: Option<LessonPlan>,
    current_exercise_index: usize,
    exercise_states: Vec<ExerciseState>,
    hint_level: u8,
    teach_step: usize,
}

impl SessionState {
    /// A session in the diagnostic phase.
    pub fn new(
        context: SessionContext,
        topic: impl Into<String>,
        redis_db: u8,
        lesson_id: impl Into<String>,
    ) -> Self {
        Self {
            context,
            current_topic: topic.into(),
            diagnostic_commands: Vec::new(),
            redis_db,
            lesson_id: lesson_id.into(),
            mode: Mode::Diagnostic,
            lesson_plan: None,
            current_exercise_index: 0,
            exercise_states: Vec::new(),
            hint_level: 1,
            teach_step: 0,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// The plan, once chosen.
    #[must_use]
    pub const fn lesson_plan(&self) -> Option<&LessonPlan> {
        self.lesson_plan.as_ref()
    }

    /// Index of the current exercise; equals the exercise count when done.
    #[must_use]
    pub const fn current_exercise_index(&self) -> usize {
        self.current_exercise_index
    }

    /// State of every exercise.
    #[must_use]
    pub fn exercise_states(&self) -> &[ExerciseState] {
        &self.exercise_states
    }

    /// Level the next hint request will get.
    #[must_use]
    pub const fn hint_level(&self) -> u8 {
        self.hint_level
    }

    /// Guided steps already done in the current `teach` exercise.
    #[must_use]
    pub const fn teach_step(&self) -> usize {
        self.teach_step
    }

    /// Records a diagnostic command and returns how many have been seen.
    pub fn record_diagnostic(&mut self, command: impl Into<String>) -> usize {
        self.diagnostic_commands.push(command.into());
        self.diagnostic_commands.len()
    }

    /// Returns `true` once enough diagnostic commands have been seen.
    #[must_use]
    pub fn diagnostic_done(&self) -> bool {
        self.diagnostic_commands.len() >= DIAGNOSTIC_COMMANDS
    }

    /// Leaves the diagnostic phase with `plan`, at its first exercise.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::InvalidStateTransition` if a lesson already began.
    pub fn begin_lesson(&mut self, plan: LessonPlan) -> Result<()> {
        if self.mode != Mode::Diagnostic {
            return Err(PrismError::invalid_transition(self.mode, Mode::Lesson));
        }
        self.exercise_states = vec![ExerciseState::Untouched; plan.exercises.len()];
        if let Some(first) = self.exercise_states.first_mut() {
            *first = ExerciseState::Current;
        }
        self.current_topic = plan.topic.clone();
        self.lesson_plan = Some(plan);
        self.mode = Mode::Lesson;
        self.current_exercise_index = 0;
        self.hint_level = 1;
        self.teach_step = 0;
        Ok(())
    }

    /// The exercise being worked on, if a lesson is running and not done.
    #[must_use]
    pub fn current_exercise(&self) -> Option<&Exercise> {
        self.lesson_plan
            .as_ref()
            .and_then(|plan| plan.exercises.get(self.current_exercise_index))
    }

    /// Marks the current exercise completed and moves on.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::InvalidStateTransition` if there is no current
    /// exercise.
    pub fn complete_current(&mut self) -> Result<()> {
        self.finish_current(ExerciseState::Completed)
    }

    /// Marks the current exercise skipped and moves on.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::InvalidStateTransition` if there is no current
    /// exercise.
    pub fn skip_current(&mut self) -> Result<()> {
        self.finish_current(ExerciseState::Skipped)
    }

    fn finish_current(&mut self, outcome: ExerciseState) -> Result<()> {
        let index = self.current_exercise_index;
        match self.exercise_states.get_mut(index) {
            Some(state) if self.mode == Mode::Lesson => *state = outcome,
            _ => {
                return Err(PrismError::invalid_transition(
                    format!("{} at exercise {index}", self.mode),
                    outcome_name(outcome),
                ))
            }
        }
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.current_exercise_index += 1;
        if let Some(next) = self.exercise_states.get_mut(self.current_exercise_index) {
            if *next == ExerciseState::Untouched {
                *next = ExerciseState::Current;
            }
        }
        self.hint_level = 1;
        self.teach_step = 0;
    }

    /// Marks one guided step of a `teach` exercise done.
    ///
    /// Returns the number of steps done so far.
    pub fn advance_teach_step(&mut self) -> usize {
        self.teach_step += 1;
        self.teach_step
    }

    /// Takes the hint level for a hint request: levels climb 1, 2, 3 and
    /// then stay at 3.
    pub fn next_hint_level(&mut self) -> u8 {
        let level = self.hint_level;
        self.hint_level = (self.hint_level + 1).min(MAX_HINT_LEVEL);
        level
    }

    /// Returns `true` once every exercise is completed or skipped.
    #[must_use]
    pub fn is_lesson_complete(&self) -> bool {
        self.mode == Mode::Lesson && self.current_exercise_index >= self.exercise_states.len()
    }

    /// Progress snapshot, or `None` before a lesson begins.
    #[must_use]
    pub fn progress(&self) -> Option<ProgressUpdate> {
        let plan = self.lesson_plan.as_ref()?;
        Some(ProgressUpdate {
            topic: format!("{} ({})", plan.topic, plan.level),
            exercise_index: self.current_exercise_index,
            total_exercises: plan.exercises.len(),
            current_exercise: self
                .current_exercise()
                .map_or_else(|| "Complete!".to_string(), Exercise::label),
            exercise_states: self.exercise_states.clone(),
        })
    }
}

const fn outcome_name(state: ExerciseState) -> &'static str {
    match state {
        ExerciseState::Untouched => "untouched",
        ExerciseState::Current => "current",
        ExerciseState::Completed => "completed",
        ExerciseState::Skipped => "skipped",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lesson::{LessonCatalog, Level, StatePolicy};

    fn ping_plan() -> LessonPlan {
        LessonPlan {
            lesson_id: Some("ping-pong".to_string()),
            topic: "Ping".to_string(),
            level: Level::Beginner,
            summary: "Say hello".to_string(),
            exercises: vec![
                Exercise::command("PING", "Pong!"),
                Exercise::command("ECHO hi", "Echoed."),
                Exercise::command("TIME", "Tick."),
            ],
            state_policy: StatePolicy::Ask,
            keywords: vec!["ping".to_string()],
            diagnostic: Vec::new(),
        }
    }

    fn session() -> SessionState {
        SessionState::new(SessionContext::new("s1", "ping"), "Ping", 3, "ping-pong")
    }

    fn current_count(state: &SessionState) -> usize {
        state
            .exercise_states()
            .iter()
            .filter(|s| **s == ExerciseState::Current)
            .count()
    }

    #[test]
    fn test_new_session_is_diagnostic() {
        let mut state = session();
        assert_eq!(state.mode(), Mode::Diagnostic);
        assert!(state.current_exercise().is_none());
        assert!(state.progress().is_none());
        assert!(!state.is_lesson_complete());

        assert_eq!(state.record_diagnostic("SET a 1"), 1);
        assert!(!state.diagnostic_done());
        assert_eq!(state.record_diagnostic("GET a"), 2);
        assert!(state.diagnostic_done());
    }

    #[test]
    fn test_begin_lesson_once() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        assert_eq!(state.mode(), Mode::Lesson);
        assert_eq!(
            state.exercise_states(),
            &[
                ExerciseState::Current,
                ExerciseState::Untouched,
                ExerciseState::Untouched
            ]
        );

        let err = state.begin_lesson(ping_plan()).unwrap_err();
        assert!(matches!(err, PrismError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_complete_advances_and_resets_hint() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        assert_eq!(state.next_hint_level(), 1);
        assert_eq!(state.next_hint_level(), 2);
        assert_eq!(state.hint_level(), 3);

        state.complete_current().unwrap();
        assert_eq!(state.current_exercise_index(), 1);
        assert_eq!(state.hint_level(), 1);
        assert_eq!(state.exercise_states()[0], ExerciseState::Completed);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn test_hint_level_clamps_at_three() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        let levels: Vec<u8> = (0..5).map(|_| state.next_hint_level()).collect();
        assert_eq!(levels, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn test_skip_is_distinct_from_complete() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        state.advance_teach_step();
        state.skip_current().unwrap();
        assert_eq!(state.exercise_states()[0], ExerciseState::Skipped);
        assert_eq!(state.teach_step(), 0);
        assert_eq!(state.current_exercise_index(), 1);
    }

    #[test]
    fn test_exactly_one_current_until_complete() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        while !state.is_lesson_complete() {
            assert_eq!(current_count(&state), 1);
            state.complete_current().unwrap();
        }
        assert_eq!(current_count(&state), 0);
        assert!(state.current_exercise().is_none());
        assert!(state.complete_current().is_err());
        assert!(state.skip_current().is_err());
    }

    #[test]
    fn test_progress_snapshot() {
        let mut state = session();
        state.begin_lesson(ping_plan()).unwrap();
        state.skip_current().unwrap();

        let progress = state.progress().unwrap();
        assert_eq!(progress.topic, "Ping (beginner)");
        assert_eq!(progress.exercise_index, 1);
        assert_eq!(progress.total_exercises, 3);
        assert_eq!(progress.current_exercise, "ECHO hi");

        state.complete_current().unwrap();
        state.complete_current().unwrap();
        let progress = state.progress().unwrap();
        assert_eq!(progress.current_exercise, "Complete!");
        assert_eq!(
            serde_json::to_value(&progress).unwrap()["exerciseStates"],
            serde_json::json!(["skipped", "completed", "completed"])
        );
    }

    #[test]
    fn test_builtin_plan_walkthrough() {
        let catalog = LessonCatalog::builtin();
        let plan = catalog.select("lists").clone();
        let total = plan.exercises.len();
        let mut state = session();
        state.begin_lesson(plan).unwrap();
        assert_eq!(state.current_topic, "Redis Lists - Basics");
        for _ in 0..total {
            state.complete_current().unwrap();
        }
        assert!(state.is_lesson_complete());
    }
}

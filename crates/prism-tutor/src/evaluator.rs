//! The lesson evaluator.
//!
//! Consumes captured commands from a [`CommandStream`], drives the
//! diagnostic -> lesson state machine, and answers through the
//! [`TutorBridge`]. It shares nothing with the capture side except the
//! command channel, so it runs (and is tested) without a terminal.
//!
//! Store failures never stop a lesson: they are logged and shown to the
//! learner as error messages, and the lesson carries on without
//! persistence.

use std::sync::Arc;
use std::time::Duration;

use prism_capture::{strip_ansi, CapturedCommand};
use prism_store::{CommandStream, SessionStateManager};
use regex::RegexBuilder;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeRequest, MessageKind, TutorBridge};
use crate::error::{PrismError, Result};
use crate::lesson::{commands_match, Exercise, ExerciseKind, LessonCatalog, LessonPlan, StatePolicy};
use crate::prompt::ConsolePrompt;
use crate::questions::{answer_question, is_question};
use crate::session::{Mode, SessionContext, SessionState, MAX_HINT_LEVEL};

/// Delay before a worked example without a follow-up completes on its own.
pub const DEFAULT_AUTO_COMPLETE_DELAY: Duration = Duration::from_secs(4);

const MISMATCH_MESSAGE: &str = "🤔 That's not what I expected. Try the suggested command!";
const GENERIC_CONCEPT_HINT: &str =
    "Think about what data structure you're working with. What operations does it support?";
const GENERIC_SYNTAX_HINT: &str =
    "Review the command syntax. Are you using the right order of arguments?";

/// What one captured command did to the current exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// The exercise is done.
    Completed,
    /// A guided step is done and more remain.
    StepDone,
    /// The right command, but its result is off.
    WrongOutput,
    /// Not the command the exercise expects.
    Mismatch,
    /// The exercise does not take commands.
    NotExpected,
}

/// Picks the lesson plan for a session: an explicit course wins, otherwise
/// the goal is matched against plan keywords.
#[must_use]
pub fn select_plan<'a>(catalog: &'a LessonCatalog, context: &SessionContext) -> &'a LessonPlan {
    context
        .course
        .as_deref()
        .and_then(|course| catalog.find(course))
        .unwrap_or_else(|| catalog.select(&context.goal))
}

/// Runs one tutoring session.
pub struct LessonEvaluator {
    catalog: LessonCatalog,
    manager: Arc<SessionStateManager>,
    bridge: TutorBridge,
    prompt: Arc<dyn ConsolePrompt>,
    state: SessionState,
    auto_complete_delay: Duration,
    auto_complete_at: Option<Instant>,
    persistence_degraded: bool,
    finished: bool,
}

impl std::fmt::Debug for LessonEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LessonEvaluator")
            .field("state", &self.state)
            .field("auto_complete_at", &self.auto_complete_at)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl LessonEvaluator {
    /// Prepares a session: picks the plan, resolves its lesson id and settles
    /// the lesson database.
    ///
    /// When saved state exists for the lesson the console is asked whether
    /// to resume in the saved database or start fresh. Starting fresh flushes
    /// the old database, forgets its metadata and allocates a new one.
    pub async fn start(
        context: SessionContext,
        catalog: LessonCatalog,
        manager: Arc<SessionStateManager>,
        bridge: TutorBridge,
        prompt: Arc<dyn ConsolePrompt>,
    ) -> Result<Self> {
        let plan = select_plan(&catalog, &context);
        let topic = plan.topic.clone();
        let lesson_id = plan.stable_id();

        let (database, persistence_degraded) =
            match settle_database(&manager, prompt.as_ref(), &lesson_id, &topic).await {
                Ok(database) => (database, false),
                Err(e) => {
                    warn!(lesson_id = %lesson_id, "Lesson state unavailable: {}", e);
                    (manager.allocate_database(), true)
                }
            };

        info!(
            session_id = %context.session_id,
            lesson_id = %lesson_id,
            database,
            "Session ready"
        );

        Ok(Self {
            state: SessionState::new(context, topic, database, lesson_id),
            catalog,
            manager,
            bridge,
            prompt,
            auto_complete_delay: DEFAULT_AUTO_COMPLETE_DELAY,
            auto_complete_at: None,
            persistence_degraded,
            finished: false,
        })
    }

    /// Sets how long a worked example without a follow-up stays on screen.
    #[must_use]
    pub fn with_auto_complete_delay(mut self, delay: Duration) -> Self {
        self.auto_complete_delay = delay;
        self
    }

    /// The session state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// The lesson database.
    #[must_use]
    pub const fn database(&self) -> u8 {
        self.state.redis_db
    }

    /// When the current worked example will complete on its own.
    #[must_use]
    pub const fn auto_complete_at(&self) -> Option<Instant> {
        self.auto_complete_at
    }

    /// Returns `true` once the lesson is complete and its state settled.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Processes captured commands and bridge requests until the command
    /// stream ends, then returns the final state.
    pub async fn run(
        mut self,
        mut stream: CommandStream,
        mut requests: mpsc::UnboundedReceiver<BridgeRequest>,
    ) -> SessionState {
        info!(session_id = %self.state.context.session_id, "Tutor watching for commands");
        loop {
            let deadline = self.auto_complete_at;
            tokio::select! {
                captured = stream.next() => match captured {
                    Some(captured) => self.handle_command(&captured).await,
                    None => {
                        info!("Command stream closed");
                        break;
                    }
                },
                Some(request) = requests.recv() => self.handle_request(request).await,
                () = wait_until(deadline) => self.handle_auto_complete().await,
            }
        }
        self.state
    }

    /// Dispatches one bridge request.
    pub async fn handle_request(&mut self, request: BridgeRequest) {
        match request {
            BridgeRequest::Hint => self.handle_hint().await,
            BridgeRequest::Skip => self.handle_skip().await,
            BridgeRequest::ClearState => self.handle_clear_state().await,
            BridgeRequest::Chat(message) => self.handle_chat(&message).await,
            BridgeRequest::ClientAttached => self.handle_client_attached().await,
        }
    }

    // ========================================================================
    // Captured commands
    // ========================================================================

    /// Evaluates one captured command.
    pub async fn handle_command(&mut self, captured: &CapturedCommand) {
        let command = strip_ansi(&captured.command);
        let command = command.trim();
        if command.is_empty() {
            return;
        }
        debug!(command = %command, mode = %self.state.mode(), "Evaluating command");

        if is_question(command) {
            self.bridge
                .send_message(answer_question(command), MessageKind::Info)
                .await;
            return;
        }

        match self.state.mode() {
            Mode::Diagnostic => self.handle_diagnostic(command).await,
            Mode::Lesson => self.handle_lesson_command(command, captured).await,
        }
    }

    async fn handle_diagnostic(&mut self, command: &str) {
        let seen = self.state.record_diagnostic(command);
        if !self.state.diagnostic_done() {
            let suggestion = self
                .preliminary_plan()
                .diagnostic_suggestion(seen)
                .unwrap_or("another command")
                .to_string();
            self.bridge
                .send_message(
                    format!("Good! One more to calibrate your level. Try: {suggestion}"),
                    MessageKind::Info,
                )
                .await;
            return;
        }

        info!(commands = seen, "Calibrating lesson");
        self.begin_lesson().await;
    }

    async fn begin_lesson(&mut self) {
        let plan = select_plan(&self.catalog, &self.state.context).clone();
        if let Err(e) = self.state.begin_lesson(plan) {
            error!("{}", e);
            self.bridge
                .send_message(e.to_string(), MessageKind::Error)
                .await;
            return;
        }
        self.bridge
            .send_message(self.lesson_banner("Let's start"), MessageKind::Info)
            .await;
        self.send_progress().await;
        self.arm_auto_complete();
    }

    async fn handle_lesson_command(&mut self, command: &str, captured: &CapturedCommand) {
        let Some(exercise) = self.state.current_exercise().cloned() else {
            self.bridge
                .send_message(
                    format!(
                        "You've finished {}. Start a new session to keep learning.",
                        self.state.current_topic
                    ),
                    MessageKind::Info,
                )
                .await;
            return;
        };

        match self.evaluate(&exercise, command, captured) {
            Outcome::Completed => self.complete_exercise(&exercise).await,
            Outcome::StepDone => {
                let step = self.state.advance_teach_step();
                self.bridge
                    .send_message(format!("✓ Good.\n\n{}", exercise.prompt(step)), MessageKind::Success)
                    .await;
            }
            Outcome::WrongOutput => {
                let hint = exercise.hint.as_deref().unwrap_or("Try again!");
                self.bridge
                    .send_message(
                        format!("Hmm, the output doesn't look right. {hint}"),
                        MessageKind::Info,
                    )
                    .await;
            }
            Outcome::Mismatch => {
                let message = match &exercise.kind {
                    ExerciseKind::Teach { .. } => format!(
                        "Not quite, let's retry this step.\n\n{}",
                        exercise.prompt(self.state.teach_step())
                    ),
                    ExerciseKind::Command { .. } | ExerciseKind::WorkedExample { .. } => {
                        MISMATCH_MESSAGE.to_string()
                    }
                };
                self.bridge.send_message(message, MessageKind::Info).await;
            }
            Outcome::NotExpected => {
                self.bridge
                    .send_message(
                        "Take a moment with the example above; we'll move on shortly.",
                        MessageKind::Info,
                    )
                    .await;
            }
        }
    }

    fn evaluate(&self, exercise: &Exercise, command: &str, captured: &CapturedCommand) -> Outcome {
        match &exercise.kind {
            ExerciseKind::Command {
                command: expected,
                expected_pattern,
                expected_output,
            } => {
                if !commands_match(command, expected) {
                    return Outcome::Mismatch;
                }
                if let Some(pattern) = expected_pattern {
                    match RegexBuilder::new(pattern).case_insensitive(true).build() {
                        Ok(re) if !re.is_match(&captured.terminal_output) => {
                            return Outcome::WrongOutput;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(pattern = %pattern, "Ignoring invalid pattern: {}", e),
                    }
                }
                if let Some(expected) = expected_output {
                    if !captured.csv_output.is_empty() && captured.csv_output != *expected {
                        return Outcome::WrongOutput;
                    }
                }
                Outcome::Completed
            }
            ExerciseKind::Teach { steps } => {
                let step = self.state.teach_step();
                match steps.get(step) {
                    Some(expected) if commands_match(command, &expected.command) => {
                        if step + 1 >= steps.len() {
                            Outcome::Completed
                        } else {
                            Outcome::StepDone
                        }
                    }
                    Some(_) => Outcome::Mismatch,
                    None => Outcome::Completed,
                }
            }
            ExerciseKind::WorkedExample { follow_up, .. } => match follow_up {
                Some(expected) if commands_match(command, expected) => Outcome::Completed,
                Some(_) => Outcome::Mismatch,
                None => Outcome::NotExpected,
            },
        }
    }

    async fn complete_exercise(&mut self, exercise: &Exercise) {
        if let Err(e) = self.state.complete_current() {
            error!("{}", e);
            return;
        }
        self.auto_complete_at = None;

        if self.state.is_lesson_complete() {
            self.bridge
                .send_message(
                    format!(
                        "🎉 {}\n\nYou've completed this lesson! Great work on {}.",
                        exercise.feedback, self.state.current_topic
                    ),
                    MessageKind::Success,
                )
                .await;
            self.send_progress().await;
            self.finish_lesson().await;
            return;
        }

        let next = self
            .state
            .current_exercise()
            .map(|next| next.prompt(0))
            .unwrap_or_default();
        self.bridge
            .send_message(
                format!("✓ {}\n\nNext: {next}", exercise.feedback),
                MessageKind::Success,
            )
            .await;
        self.send_progress().await;
        self.arm_auto_complete();
    }

    /// Completes a worked example whose delay has passed.
    pub async fn handle_auto_complete(&mut self) {
        self.auto_complete_at = None;
        let Some(exercise) = self.state.current_exercise().cloned() else {
            return;
        };
        if matches!(
            exercise.kind,
            ExerciseKind::WorkedExample {
                follow_up: None,
                ..
            }
        ) {
            debug!("Worked example auto-completed");
            self.complete_exercise(&exercise).await;
        }
    }

    fn arm_auto_complete(&mut self) {
        self.auto_complete_at = match self.state.current_exercise().map(|e| &e.kind) {
            Some(ExerciseKind::WorkedExample {
                follow_up: None, ..
            }) => Some(Instant::now() + self.auto_complete_delay),
            _ => None,
        };
    }

    // ========================================================================
    // Bridge requests
    // ========================================================================

    /// Shows the next hint for the current exercise.
    ///
    /// Levels climb 1, 2, 3; the third reveals the command to type and later
    /// requests repeat it.
    pub async fn handle_hint(&mut self) {
        if self.state.mode() == Mode::Diagnostic {
            let seen = self.state.diagnostic_commands.len();
            let suggestion = self
                .preliminary_plan()
                .diagnostic_suggestion(seen)
                .unwrap_or("any command you know")
                .to_string();
            self.bridge
                .send_message(format!("💡 Try: {suggestion}"), MessageKind::Hint)
                .await;
            return;
        }

        let Some(exercise) = self.state.current_exercise().cloned() else {
            self.bridge
                .send_message("This lesson is complete, no hints needed!", MessageKind::Info)
                .await;
            return;
        };
        let level = self.state.next_hint_level();
        let text = hint_text(&exercise, level, self.state.teach_step());
        self.bridge
            .send_message(
                format!("💡 Hint {level}/{MAX_HINT_LEVEL}: {text}"),
                MessageKind::Hint,
            )
            .await;
    }

    /// Skips the current exercise without evaluating it.
    ///
    /// During the diagnostic phase this jumps straight into the lesson.
    pub async fn handle_skip(&mut self) {
        if self.state.mode() == Mode::Diagnostic {
            info!("Diagnostic skipped");
            self.begin_lesson().await;
            return;
        }
        if let Err(e) = self.state.skip_current() {
            debug!("Nothing to skip: {}", e);
            return;
        }
        self.auto_complete_at = None;

        if self.state.is_lesson_complete() {
            self.bridge
                .send_message(
                    format!("🎉 Lesson complete! You've finished {}.", self.state.current_topic),
                    MessageKind::Success,
                )
                .await;
            self.send_progress().await;
            self.finish_lesson().await;
            return;
        }

        let next = self
            .state
            .current_exercise()
            .map(|next| next.prompt(0))
            .unwrap_or_default();
        self.bridge
            .send_message(format!("⏭️ Skipped.\n\nNext: {next}"), MessageKind::Info)
            .await;
        self.send_progress().await;
        self.arm_auto_complete();
    }

    /// Flushes the lesson database and forgets its saved state.
    pub async fn handle_clear_state(&mut self) {
        match self.discard_state().await {
            Ok(()) => {
                self.bridge
                    .send_message(
                        format!(
                            "🧹 Cleared saved progress for {}. Database {} is empty again.",
                            self.state.current_topic, self.state.redis_db
                        ),
                        MessageKind::Success,
                    )
                    .await;
            }
            Err(e) => self.report("Could not clear lesson state", e).await,
        }
    }

    /// Answers a chat message from the question table.
    pub async fn handle_chat(&mut self, message: &str) {
        if message.trim().is_empty() {
            return;
        }
        self.bridge
            .send_message(answer_question(message), MessageKind::Info)
            .await;
    }

    /// Greets a newly attached client with where the session stands.
    pub async fn handle_client_attached(&mut self) {
        match self.state.mode() {
            Mode::Diagnostic => {
                let plan = self.preliminary_plan();
                let first = plan
                    .diagnostic_suggestion(0)
                    .unwrap_or("any command you know");
                let message = format!(
                    "📚 {}\n\nLet's see what you know! Try: {first}",
                    plan.topic
                );
                self.bridge.send_message(message, MessageKind::Info).await;
            }
            Mode::Lesson => {
                let banner = self.lesson_banner("Current exercise");
                self.bridge.send_message(banner, MessageKind::Info).await;
                self.send_progress().await;
            }
        }
        if self.persistence_degraded {
            self.bridge
                .send_message(
                    "Lesson state is unavailable; progress in this session will not be saved.",
                    MessageKind::Warning,
                )
                .await;
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    async fn finish_lesson(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let policy = self
            .state
            .lesson_plan()
            .map(|plan| plan.state_policy)
            .unwrap_or_default();
        let persist = match policy {
            StatePolicy::Persist => true,
            StatePolicy::Discard => false,
            StatePolicy::Ask => {
                let options = vec!["Save progress".to_string(), "Discard".to_string()];
                let prompt = format!(
                    "Lesson complete! Save your progress for {}?",
                    self.state.current_topic
                );
                match self.prompt.choose_option(&prompt, &options).await {
                    Ok(choice) => choice == 0,
                    Err(e) => {
                        warn!("Save prompt failed, keeping progress: {}", e);
                        true
                    }
                }
            }
        };

        if persist {
            let saved = self
                .manager
                .save_lesson_state(
                    &self.state.lesson_id,
                    &self.state.current_topic,
                    self.state.redis_db,
                    &self.state.context.session_id,
                )
                .await;
            match saved {
                Ok(metadata) => {
                    info!(lesson_id = %metadata.lesson_id, database = metadata.database, "Lesson state saved");
                    self.bridge
                        .send_message(
                            format!(
                                "💾 Progress saved. Pick {} again to continue in database {}.",
                                metadata.lesson_topic, metadata.database
                            ),
                            MessageKind::Success,
                        )
                        .await;
                }
                Err(e) => self.report("Could not save lesson state", e).await,
            }
        } else {
            match self.discard_state().await {
                Ok(()) => {
                    info!(lesson_id = %self.state.lesson_id, "Lesson state discarded");
                    self.bridge
                        .send_message("🗑️ Progress discarded.", MessageKind::Info)
                        .await;
                }
                Err(e) => self.report("Could not discard lesson state", e).await,
            }
        }
    }

    async fn discard_state(&self) -> prism_store::Result<()> {
        self.manager.flush_database(self.state.redis_db).await?;
        self.manager.clear_lesson_state(&self.state.lesson_id).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn preliminary_plan(&self) -> &LessonPlan {
        self.state
            .lesson_plan()
            .unwrap_or_else(|| select_plan(&self.catalog, &self.state.context))
    }

    fn lesson_banner(&self, lead: &str) -> String {
        let Some(plan) = self.state.lesson_plan() else {
            return self.state.current_topic.clone();
        };
        let current = self
            .state
            .current_exercise()
            .map_or_else(|| "Complete!".to_string(), |e| e.prompt(self.state.teach_step()));
        format!(
            "📚 {} ({})\n{}\n\n{lead}: {current}",
            plan.topic, plan.level, plan.summary
        )
    }

    async fn send_progress(&self) {
        if let Some(progress) = self.state.progress() {
            self.bridge.send_progress(progress).await;
        }
    }

    async fn report(&self, context: &str, err: prism_store::StoreError) {
        let err = PrismError::from(err);
        error!(lesson_id = %self.state.lesson_id, "{}: {}", context, err);
        self.bridge
            .send_message(failure_message(context, &err), MessageKind::Error)
            .await;
    }
}

/// Finds the lesson database, asking whether to resume when saved state
/// exists.
async fn settle_database(
    manager: &SessionStateManager,
    prompt: &dyn ConsolePrompt,
    lesson_id: &str,
    topic: &str,
) -> prism_store::Result<u8> {
    let Some(saved) = manager.get_lesson_state(lesson_id).await? else {
        return manager.get_database_for_lesson(lesson_id).await;
    };

    let options = vec![
        format!("Resume where I left off (database {})", saved.database),
        "Start fresh".to_string(),
    ];
    let question = format!(
        "Found saved progress for {topic} from {}.",
        saved.saved_at.format("%Y-%m-%d %H:%M")
    );
    let resume = match prompt.choose_option(&question, &options).await {
        Ok(choice) => choice == 0,
        Err(e) => {
            warn!("Resume prompt failed, resuming: {}", e);
            true
        }
    };

    if resume {
        info!(lesson_id = %lesson_id, database = saved.database, "Resuming saved lesson");
        return manager.get_database_for_lesson(lesson_id).await;
    }

    info!(lesson_id = %lesson_id, database = saved.database, "Starting fresh");
    manager.flush_database(saved.database).await?;
    manager.clear_lesson_state(lesson_id).await?;
    manager.allocate_unclaimed_database().await
}

/// Tutor text for a failed store operation.
fn failure_message(context: &str, err: &PrismError) -> String {
    if err.is_transient() {
        format!("{context}: {err}\nThis looks temporary; try again in a moment.")
    } else {
        format!("{context}: {err}")
    }
}

/// Hint text for `exercise` at `level` (1..=3).
fn hint_text(exercise: &Exercise, level: u8, step: usize) -> String {
    match level {
        1 => exercise
            .concept
            .clone()
            .unwrap_or_else(|| GENERIC_CONCEPT_HINT.to_string()),
        2 => exercise
            .hint
            .clone()
            .unwrap_or_else(|| GENERIC_SYNTAX_HINT.to_string()),
        _ => exercise.expected_command(step).map_or_else(
            || match exercise.kind {
                ExerciseKind::WorkedExample { .. } => {
                    "Just read the example; it completes on its own.".to_string()
                }
                ExerciseKind::Command { .. } | ExerciseKind::Teach { .. } => {
                    "Follow the steps in order.".to_string()
                }
            },
            |command| format!("Type exactly: {command}"),
        ),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Integration tests for the capture-to-tutor pipeline.
//!
//! Terminal text goes through the prompt parser, is published on an
//! in-process command channel and drives a lesson evaluator, exactly as the
//! capture server and the tutor task do at runtime. No CLI or key/value
//! server is needed.

use std::sync::Arc;
use std::time::Duration;

use prism_capture::{
    derive_csv_from_terminal, CapturedCommand, CommandParser, ParserEvent, PromptPattern,
};
use prism_store::{
    CommandChannel, CommandPublisher, CommandStream, DatabaseAllocator, LocalChannel,
    MemoryStateStore, SessionStateManager, StateStore,
};
use prism_tutor::{
    ConsolePrompt, Exercise, ExerciseKind, LessonCatalog, LessonEvaluator, LessonPlan, Level,
    OutboundFrame, ScriptedPrompt, SessionContext, SessionState, StatePolicy, TutorBridge,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CHANNEL: &str = "prism:commands";
const SESSION: &str = "session-it";

fn echo_plan(policy: StatePolicy) -> LessonPlan {
    LessonPlan {
        lesson_id: Some("echo-basics".to_string()),
        topic: "Echo basics".to_string(),
        level: Level::Beginner,
        summary: "Talk to the server.".to_string(),
        exercises: vec![
            Exercise::command("PING", "The server answered."),
            Exercise {
                kind: ExerciseKind::Command {
                    command: "ECHO hi".to_string(),
                    expected_pattern: Some("hi".to_string()),
                    expected_output: Some("\"hi\"".to_string()),
                },
                feedback: "Echoed back.".to_string(),
                hint: None,
                concept: None,
            },
        ],
        state_policy: policy,
        keywords: vec!["echo".to_string()],
        diagnostic: vec!["PING".to_string(), "ECHO test".to_string()],
    }
}

struct Pipeline {
    parser: CommandParser,
    publisher: CommandPublisher,
    manager: Arc<SessionStateManager>,
    prompt: Arc<ScriptedPrompt>,
    frames: mpsc::UnboundedReceiver<String>,
    tutor: JoinHandle<SessionState>,
}

impl Pipeline {
    async fn start(policy: StatePolicy, answers: Vec<usize>) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let manager = Arc::new(SessionStateManager::new(
            store,
            DatabaseAllocator::new(),
            "prism",
        ));
        let prompt = Arc::new(ScriptedPrompt::new(answers));
        let transport: Arc<dyn CommandChannel> = Arc::new(LocalChannel::new());

        let bridge = TutorBridge::new();
        let (tx, frames) = mpsc::unbounded_channel();
        bridge.set_sender(tx).await;
        let requests = bridge.request_channel().await;

        let catalog = LessonCatalog::new(vec![echo_plan(policy)]).expect("valid catalog");
        let evaluator = LessonEvaluator::start(
            SessionContext::new(SESSION, "echo"),
            catalog,
            Arc::clone(&manager),
            bridge,
            Arc::clone(&prompt) as Arc<dyn ConsolePrompt>,
        )
        .await
        .expect("evaluator starts");

        let stream = CommandStream::subscribe(transport.as_ref(), CHANNEL, SESSION)
            .await
            .expect("subscribe");
        let tutor = tokio::spawn(evaluator.run(stream, requests));

        let prompt_pattern = PromptPattern::new("127.0.0.1", 6379).expect("prompt pattern");
        Self {
            parser: CommandParser::new(prompt_pattern, 64 * 1024),
            publisher: CommandPublisher::new(transport, CHANNEL),
            manager,
            prompt,
            frames,
            tutor,
        }
    }

    /// Feeds terminal text and publishes every completed command.
    async fn type_text(&mut self, text: &str) {
        for event in self.parser.feed(text) {
            if let ParserEvent::Completed {
                command, output, ..
            } = event
            {
                let csv = derive_csv_from_terminal(&output);
                self.publisher
                    .emit(&CapturedCommand::new(command, output, csv, SESSION))
                    .await;
            }
        }
    }

    /// Waits for a tutor message containing `needle`, returning it.
    async fn wait_for_message(&mut self, needle: &str) -> String {
        loop {
            let raw = timeout(Duration::from_secs(5), self.frames.recv())
                .await
                .unwrap_or_else(|_| panic!("Timeout waiting for message containing {needle:?}"))
                .expect("Bridge closed");
            if let Ok(OutboundFrame::TutorMessage { message, .. }) = serde_json::from_str(&raw) {
                if message.contains(needle) {
                    return message;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_terminal_session_completes_lesson() {
    let mut pipeline = Pipeline::start(StatePolicy::Persist, vec![]).await;

    pipeline
        .type_text("127.0.0.1:6379> SET x 1\r\nOK\r\n127.0.0.1:6379> ")
        .await;
    pipeline.wait_for_message("One more to calibrate").await;

    pipeline.type_text("GET x\r\n\"1\"\r\n127.0.0.1:6379> ").await;
    let banner = pipeline.wait_for_message("Echo basics").await;
    assert!(banner.contains("Let's start: Try: PING"));

    pipeline.type_text("PING\r\nPONG\r\n127.0.0.1:6379> ").await;
    let next = pipeline.wait_for_message("The server answered.").await;
    assert!(next.contains("Next: Try: ECHO hi"));

    pipeline.type_text("ECHO hi\r\n\"hi\"\r\n127.0.0.1:6379> ").await;
    pipeline.wait_for_message("completed this lesson").await;
    pipeline.wait_for_message("Progress saved").await;

    let saved = pipeline
        .manager
        .get_lesson_state("echo-basics")
        .await
        .expect("store reachable")
        .expect("lesson saved");
    assert_eq!(saved.session_id, SESSION);
    assert_eq!(saved.database, 1);
    assert!(pipeline.prompt.asked().await.is_empty());

    pipeline.tutor.abort();
}

#[tokio::test]
async fn test_wrong_output_keeps_exercise() {
    let mut pipeline = Pipeline::start(StatePolicy::Discard, vec![]).await;

    pipeline
        .type_text("127.0.0.1:6379> PING\r\nPONG\r\n127.0.0.1:6379> ECHO a\r\n\"a\"\r\n127.0.0.1:6379> ")
        .await;
    pipeline.wait_for_message("Let's start").await;

    pipeline.type_text("PING\r\nPONG\r\n127.0.0.1:6379> ").await;
    pipeline.wait_for_message("Next: Try: ECHO hi").await;

    // Right command, wrong reply
    pipeline.type_text("echo hi\r\n\"bye\"\r\n127.0.0.1:6379> ").await;
    let unfinished = timeout(
        Duration::from_millis(300),
        pipeline.wait_for_message("completed this lesson"),
    )
    .await;
    assert!(unfinished.is_err());

    pipeline.type_text("echo hi\r\n\"hi\"\r\n127.0.0.1:6379> ").await;
    pipeline.wait_for_message("completed this lesson").await;
    pipeline.wait_for_message("Progress discarded").await;

    assert!(!pipeline
        .manager
        .check_lesson_has_state("echo-basics")
        .await
        .expect("store reachable"));

    pipeline.tutor.abort();
}

#[tokio::test]
async fn test_questions_are_answered_not_graded() {
    let mut pipeline = Pipeline::start(StatePolicy::Discard, vec![]).await;

    pipeline
        .type_text("127.0.0.1:6379> PING\r\nPONG\r\n127.0.0.1:6379> ECHO a\r\n\"a\"\r\n127.0.0.1:6379> ")
        .await;
    pipeline.wait_for_message("Let's start").await;

    pipeline
        .type_text("what is a list\r\n(error) ERR unknown command\r\n127.0.0.1:6379> ")
        .await;
    let answer = pipeline.wait_for_message("").await;
    assert!(!answer.contains("Next:"));

    // The first exercise is still current
    pipeline.type_text("PING\r\nPONG\r\n127.0.0.1:6379> ").await;
    pipeline.wait_for_message("Next: Try: ECHO hi").await;

    pipeline.tutor.abort();
}

#[tokio::test]
async fn test_other_sessions_are_ignored() {
    let mut pipeline = Pipeline::start(StatePolicy::Discard, vec![]).await;

    pipeline
        .publisher
        .emit(&CapturedCommand::new("PING", "PONG", "PONG", "someone-else"))
        .await;
    let nothing = timeout(Duration::from_millis(200), pipeline.frames.recv()).await;
    assert!(nothing.is_err());

    pipeline
        .type_text("127.0.0.1:6379> PING\r\nPONG\r\n127.0.0.1:6379> ")
        .await;
    pipeline.wait_for_message("One more to calibrate").await;

    pipeline.tutor.abort();
}

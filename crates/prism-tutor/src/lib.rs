//! Prism Tutor
//!
//! The tutoring side of Prism: configuration, lesson plans, the lesson
//! evaluator state machine, the tutor bridge and the capture server that
//! hosts a learner's terminal.

pub mod bridge;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod lesson;
pub mod prompt;
pub mod questions;
pub mod server;
pub mod session;

pub use bridge::{Attachment, BridgeRequest, ClientFrame, MessageKind, OutboundFrame, TutorBridge};
pub use config::{
    CliConfig, Config, RedisConfig, ServerConfig, Transport, ENV_COMMAND_CHANNEL, ENV_REDIS_HOST,
    ENV_REDIS_PORT,
};
pub use error::{PrismError, Result};
pub use evaluator::{select_plan, LessonEvaluator, DEFAULT_AUTO_COMPLETE_DELAY};
pub use lesson::{
    commands_match, Exercise, ExerciseKind, GuidedStep, LessonCatalog, LessonPlan, Level,
    StatePolicy, MAX_LESSON_FILE_SIZE,
};
pub use prompt::{ConsolePrompt, ScriptedPrompt, StdinPrompt};
pub use questions::{answer_question, is_question};
pub use server::{create_router, serve, AppState, HealthResponse};
pub use session::{
    ExerciseState, Mode, ProgressUpdate, SessionContext, SessionState, MAX_HINT_LEVEL,
};

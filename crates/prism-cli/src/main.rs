//! Prism CLI
//!
//! Starts a tutoring session (capture server plus lesson evaluator) and
//! manages saved lesson state.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use prism_store::{
    stable_lesson_id, CommandChannel, CommandPublisher, CommandStream, DatabaseAllocator,
    LocalChannel, MemoryStateStore, RedisChannel, RedisStateStore, SessionStateManager,
    StateStore,
};
use prism_tutor::{
    serve, AppState, Config, ConsolePrompt, LessonCatalog, LessonEvaluator, SessionContext,
    StdinPrompt, Transport, TutorBridge,
};
use tracing_subscriber::EnvFilter;

/// Prism - interactive database tutor
///
/// Hosts a live CLI session in the browser and coaches the learner through
/// lesson plans as they type.
#[derive(Parser, Debug)]
#[command(name = "prism")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: prism.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a tutoring session (default)
    Run {
        /// What you want to learn, e.g. "lists for a job queue"
        #[arg(short, long)]
        goal: Option<String>,
    },
    /// List lessons with saved progress
    Lessons,
    /// Forget a lesson's saved progress and flush its database
    Clear {
        /// Lesson id or topic
        #[arg(value_name = "LESSON")]
        lesson: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?args.config, "Config file");

    let result = match args.command.unwrap_or(Command::Run { goal: None }) {
        Command::Run { goal } => run_session(args.config, goal).await,
        Command::Lessons => list_lessons(args.config).await,
        Command::Clear { lesson } => clear_lesson(args.config, &lesson).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(&path)?,
        None => Config::load()?,
    };
    tracing::debug!(transport = ?config.transport, channel = %config.channel, "Config loaded");
    Ok(config)
}

fn load_catalog(config: &Config) -> anyhow::Result<LessonCatalog> {
    Ok(match &config.lessons_file {
        Some(path) => LessonCatalog::load(path)?,
        None => LessonCatalog::builtin(),
    })
}

/// Backing store and command channel for the configured transport.
fn connect(config: &Config) -> anyhow::Result<(Arc<dyn StateStore>, Arc<dyn CommandChannel>)> {
    Ok(match config.transport {
        Transport::Redis => (
            Arc::new(RedisStateStore::new(&config.redis.host, config.redis.port)?),
            Arc::new(RedisChannel::new(&config.redis.host, config.redis.port)?),
        ),
        Transport::Local => (
            Arc::new(MemoryStateStore::new()),
            Arc::new(LocalChannel::new()),
        ),
    })
}

fn state_manager(config: &Config, store: Arc<dyn StateStore>) -> Arc<SessionStateManager> {
    Arc::new(SessionStateManager::new(
        store,
        DatabaseAllocator::new(),
        config.namespace.clone(),
    ))
}

/// Runs one tutoring session until Ctrl+C or the server stops.
///
/// 1. Load config and lessons
/// 2. Pick a course (goal or console menu)
/// 3. Settle the lesson database (resume or start fresh)
/// 4. Subscribe the evaluator to the command channel
/// 5. Start the capture server and the evaluator as separate tasks
async fn run_session(config_path: Option<PathBuf>, goal: Option<String>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = load_catalog(&config)?;
    let (store, channel) = connect(&config)?;
    let manager = state_manager(&config, store);
    let prompt: Arc<dyn ConsolePrompt> = Arc::new(StdinPrompt);

    println!("{}", "━".repeat(60));
    println!("🎓 Prism Tutor");
    println!("{}", "━".repeat(60));

    let session_id = format!("session-{}", uuid::Uuid::new_v4());
    let context = match goal {
        Some(goal) => SessionContext::new(&session_id, goal),
        None => {
            let index = prompt
                .choose_option("What would you like to work on today?", &catalog.topics())
                .await?;
            let plan = catalog
                .plans()
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("no lesson at menu position {}", index + 1))?;
            SessionContext::new(&session_id, plan.topic.clone()).with_course(plan.stable_id())
        }
    };

    let bridge = TutorBridge::new();
    let requests = bridge.request_channel().await;

    let evaluator = LessonEvaluator::start(
        context,
        catalog,
        Arc::clone(&manager),
        bridge.clone(),
        Arc::clone(&prompt),
    )
    .await?
    .with_auto_complete_delay(config.auto_complete_delay());
    let database = evaluator.database();

    // Subscribe before the server starts so no captured command is missed
    let stream = CommandStream::subscribe(channel.as_ref(), &config.channel, &session_id).await?;
    let publisher = CommandPublisher::new(Arc::clone(&channel), config.channel.clone());

    println!();
    println!("📚 {}", evaluator.state().current_topic);
    println!("Lesson database: {database}");
    println!(
        "Open http://{}:{} to start",
        config.server.host, config.server.port
    );
    println!("Press Ctrl+C to stop");
    println!();

    let app_state = AppState::new(config, session_id, database, bridge, publisher);
    let mut server_handle = tokio::spawn(serve(app_state));
    let mut tutor_handle = tokio::spawn(evaluator.run(stream, requests));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
            Ok(())
        }
        result = &mut server_handle => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!(e)),
            Err(e) => Err(anyhow::anyhow!("capture server task failed: {e}")),
        },
        result = &mut tutor_handle => match result {
            Ok(state) => {
                tracing::info!(lesson_id = %state.lesson_id, "Tutor finished");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("tutor task failed: {e}")),
        },
    };

    server_handle.abort();
    tutor_handle.abort();
    outcome
}

/// Prints every lesson with saved progress, newest first.
async fn list_lessons(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (store, _) = connect(&config)?;
    let manager = state_manager(&config, store);

    let lessons = manager.get_all_saved_lessons().await?;
    if lessons.is_empty() {
        println!("No saved lessons.");
        return Ok(());
    }

    println!("{:<24} {:<32} {:>3}  Saved", "Lesson", "Topic", "DB");
    for lesson in lessons {
        println!(
            "{:<24} {:<32} {:>3}  {}",
            lesson.lesson_id,
            lesson.lesson_topic,
            lesson.database,
            lesson.saved_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Flushes a lesson's database and deletes its saved state.
///
/// `lesson` may be a saved lesson id, a catalog lesson id or a topic.
async fn clear_lesson(config_path: Option<PathBuf>, lesson: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = load_catalog(&config)?;
    let (store, _) = connect(&config)?;
    let manager = state_manager(&config, store);

    let lesson_id = if manager.check_lesson_has_state(lesson).await? {
        lesson.to_string()
    } else {
        catalog
            .find(lesson)
            .map_or_else(|| stable_lesson_id(lesson), |plan| plan.stable_id())
    };

    let Some(saved) = manager.get_lesson_state(&lesson_id).await? else {
        println!("No saved progress for '{lesson}'.");
        return Ok(());
    };

    manager.flush_database(saved.database).await?;
    manager.clear_lesson_state(&lesson_id).await?;
    println!(
        "Cleared {} (database {} flushed).",
        saved.lesson_topic, saved.database
    );
    Ok(())
}

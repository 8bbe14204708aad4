//! Message passing between the lesson evaluator and a connected client.
//!
//! The [`TutorBridge`] knows nothing about sockets. A transport attaches a
//! sender once a client connects; until then outbound calls do nothing.
//! Inbound requests (hint, skip, clear state, chat) are delivered to
//! registered handlers.
//!
//! # Frames
//!
//! Outbound frames are JSON objects tagged by `type`:
//!
//! - `tutor-message` - `{message, messageType}`
//! - `progress-update` - `{topic, exerciseIndex, totalExercises, currentExercise, exerciseStates}`
//!
//! Inbound frames from the client:
//!
//! - `resize` - `{cols, rows}`
//! - `hint-request`, `skip-request`, `clear-state`
//! - `chat-message` - `{message}`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::session::ProgressUpdate;

// ============================================================================
// Frames
// ============================================================================

/// How a tutor message should be presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain guidance.
    #[default]
    Info,
    /// Something went right.
    Success,
    /// A hint.
    Hint,
    /// Something the learner should look at.
    Warning,
    /// Something failed.
    Error,
}

impl MessageKind {
    /// Prefix marking the severity of a message, if any.
    #[must_use]
    pub const fn severity_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Warning => Some("⚠️ "),
            Self::Error => Some("❌ "),
            Self::Info | Self::Success | Self::Hint => None,
        }
    }
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    /// A chat message from the tutor.
    #[serde(rename_all = "camelCase")]
    TutorMessage {
        /// Text to show.
        message: String,
        /// Presentation hint.
        message_type: MessageKind,
    },
    /// Lesson progress.
    ProgressUpdate(ProgressUpdate),
}

/// A JSON frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// The client's terminal viewport changed.
    Resize {
        /// Width in columns.
        cols: u16,
        /// Height in rows.
        rows: u16,
    },
    /// The learner asked for a hint.
    HintRequest,
    /// The learner wants to skip the current exercise.
    SkipRequest,
    /// The learner wants to forget this lesson's saved state.
    ClearState,
    /// A free-text chat message.
    ChatMessage {
        /// What the learner wrote.
        message: String,
    },
}

impl ClientFrame {
    /// Parses a text frame.
    ///
    /// `None` means it is not a control frame and should be treated as
    /// terminal input. Anything shaped like `{"type": ...}` is a control
    /// frame, so one that fails to parse is an error rather than keystrokes.
    pub fn parse(text: &str) -> Option<serde_json::Result<Self>> {
        let body = text.trim_start().strip_prefix('{')?;
        if !body.trim_start().starts_with("\"type\"") {
            return None;
        }
        Some(serde_json::from_str(text))
    }

    /// The evaluator request carried by this frame, if any.
    #[must_use]
    pub fn into_request(self) -> Option<BridgeRequest> {
        match self {
            Self::Resize { .. } => None,
            Self::HintRequest => Some(BridgeRequest::Hint),
            Self::SkipRequest => Some(BridgeRequest::Skip),
            Self::ClearState => Some(BridgeRequest::ClearState),
            Self::ChatMessage { message } => Some(BridgeRequest::Chat(message)),
        }
    }
}

/// An inbound request for the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    /// Show the next hint.
    Hint,
    /// Skip the current exercise.
    Skip,
    /// Flush and forget saved state.
    ClearState,
    /// Answer a chat message.
    Chat(String),
    /// A client connected.
    ClientAttached,
}

// ============================================================================
// TutorBridge
// ============================================================================

type Handler = Box<dyn Fn() + Send + Sync>;
type ChatHandler = Box<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    hint: Option<Handler>,
    skip: Option<Handler>,
    clear_state: Option<Handler>,
    chat: Option<ChatHandler>,
    client_attached: Option<Handler>,
}

/// One client's hold on the bridge, returned by [`TutorBridge::set_sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment(u64);

#[derive(Default)]
struct BridgeInner {
    sender: Mutex<Option<(Attachment, mpsc::UnboundedSender<String>)>>,
    attachments: AtomicU64,
    handlers: Mutex<Handlers>,
}

/// Transport-agnostic link between the evaluator and one client.
///
/// Cloning is cheap; every clone shares the same sender and handlers.
#[derive(Clone, Default)]
pub struct TutorBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for TutorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorBridge").finish_non_exhaustive()
    }
}

impl TutorBridge {
    /// A bridge with no client attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the client sender and notifies the client-attached handler.
    ///
    /// The newest client wins: an earlier sender is dropped, which closes
    /// that client's receiving end.
    pub async fn set_sender(&self, sender: mpsc::UnboundedSender<String>) -> Attachment {
        let attachment = Attachment(self.inner.attachments.fetch_add(1, Ordering::SeqCst));
        let previous = self.inner.sender.lock().await.replace((attachment, sender));
        if let Some((replaced, _)) = previous {
            info!(
                replaced = replaced.0,
                attached = attachment.0,
                "Newer client replaced attached client"
            );
        }
        self.dispatch(BridgeRequest::ClientAttached).await;
        attachment
    }

    /// Drops the client sender if `attachment` is still the attached client;
    /// outbound calls become no-ops again.
    ///
    /// Returns `false` when a newer client has taken over, which is left
    /// attached.
    pub async fn detach(&self, attachment: Attachment) -> bool {
        let mut guard = self.inner.sender.lock().await;
        match guard.as_ref() {
            Some((current, _)) if *current == attachment => {
                guard.take();
                true
            }
            _ => false,
        }
    }

    /// Returns `true` while a client is attached.
    pub async fn is_attached(&self) -> bool {
        self.inner.sender.lock().await.is_some()
    }

    /// Sends a tutor message, prefixed by its severity.
    pub async fn send_message(&self, text: impl Into<String>, kind: MessageKind) {
        let text = text.into();
        let message = match kind.severity_prefix() {
            Some(prefix) if !text.starts_with(prefix) => format!("{prefix}{text}"),
            _ => text,
        };
        self.send_frame(&OutboundFrame::TutorMessage {
            message,
            message_type: kind,
        })
        .await;
    }

    /// Sends a progress update.
    pub async fn send_progress(&self, update: ProgressUpdate) {
        self.send_frame(&OutboundFrame::ProgressUpdate(update)).await;
    }

    async fn send_frame(&self, frame: &OutboundFrame) {
        let guard = self.inner.sender.lock().await;
        let Some((_, sender)) = guard.as_ref() else {
            debug!("No client attached, dropping tutor frame");
            return;
        };
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize tutor frame: {}", e);
                return;
            }
        };
        if sender.send(json).is_err() {
            debug!("Client went away, dropping tutor frame");
        }
    }

    /// Registers the hint-request handler.
    pub async fn on_hint_request(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().await.hint = Some(Box::new(handler));
    }

    /// Registers the skip-request handler.
    pub async fn on_skip_request(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().await.skip = Some(Box::new(handler));
    }

    /// Registers the clear-state handler.
    pub async fn on_clear_state_request(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().await.clear_state = Some(Box::new(handler));
    }

    /// Registers the chat-message handler.
    pub async fn on_chat_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.inner.handlers.lock().await.chat = Some(Box::new(handler));
    }

    /// Registers the client-attached handler.
    pub async fn on_client_attached(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().await.client_attached = Some(Box::new(handler));
    }

    /// Registers handlers that forward every request into a channel.
    pub async fn request_channel(&self) -> mpsc::UnboundedReceiver<BridgeRequest> {
        let (tx, rx) = mpsc::unbounded_channel();

        let forward = |request: BridgeRequest, tx: &mpsc::UnboundedSender<BridgeRequest>| {
            let tx = tx.clone();
            move || {
                let _ = tx.send(request.clone());
            }
        };
        self.on_hint_request(forward(BridgeRequest::Hint, &tx)).await;
        self.on_skip_request(forward(BridgeRequest::Skip, &tx)).await;
        self.on_clear_state_request(forward(BridgeRequest::ClearState, &tx))
            .await;
        self.on_client_attached(forward(BridgeRequest::ClientAttached, &tx))
            .await;
        self.on_chat_message(move |message| {
            let _ = tx.send(BridgeRequest::Chat(message));
        })
        .await;

        rx
    }

    /// Delivers an inbound request to its handler.
    ///
    /// Returns `false` when no handler is registered for it.
    pub async fn dispatch(&self, request: BridgeRequest) -> bool {
        let handlers = self.inner.handlers.lock().await;
        let handler = match request {
            BridgeRequest::Hint => handlers.hint.as_ref(),
            BridgeRequest::Skip => handlers.skip.as_ref(),
            BridgeRequest::ClearState => handlers.clear_state.as_ref(),
            BridgeRequest::ClientAttached => handlers.client_attached.as_ref(),
            BridgeRequest::Chat(message) => {
                return match handlers.chat.as_ref() {
                    Some(chat) => {
                        chat(message);
                        true
                    }
                    None => false,
                };
            }
        };
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

//! Reply pipeline: one task per finalized utterance.
//!
//! Runs the text-generation step (with a bounded tool loop), then streams
//! the reply through the TTS transducer. Cancellation is cooperative: the
//! token is checked before every external call and before every emitted
//! chunk, and a cancelled task simply stops — already-dispatched capability
//! invocations are never rolled back.

use crate::events::ChatMessage;
use crate::llm::{GenerateOutcome, LlmError, TextGenerator};
use crate::tools::CapabilityRegistry;
use crate::tts::{TextToSpeech, TtsError};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Error type for reply pipeline failures. None of these are fatal to the
/// call; the turn controller answers with the fallback apology instead.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("text generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("speech synthesis failed: {0}")]
    Synthesis(#[from] TtsError),

    #[error("reply step exceeded its time budget")]
    Timeout,

    #[error("tool loop exceeded its iteration budget")]
    ToolLoopExceeded,
}

/// Cooperative cancellation flag shared between the session and its
/// in-flight reply task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Ordered events produced by a reply task.
#[derive(Debug)]
pub enum ReplyEvent {
    /// The final reply text, emitted once before synthesis starts.
    Text(String),
    /// One chunk of synthesized samples, in production order.
    Audio(Vec<i16>),
    /// All audio delivered.
    Finished,
    /// The pipeline failed; the session speaks the fallback.
    Failed(ReplyError),
}

/// The collaborators a reply task needs, shared across a call.
pub struct ReplyContext {
    pub generator: Arc<dyn TextGenerator>,
    pub tts: Arc<dyn TextToSpeech>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub system_prompt: String,
    pub tool_loop_limit: usize,
    pub reply_timeout: Duration,
}

/// Handle to one in-flight reply task.
pub struct ReplyTask {
    pub generation: u64,
    pub events: mpsc::Receiver<ReplyEvent>,
    cancel: CancelToken,
    _handle: JoinHandle<()>,
}

impl ReplyTask {
    /// Spawn the pipeline for one utterance. `context` is the bounded
    /// short-term history, oldest first.
    pub fn spawn(
        ctx: Arc<ReplyContext>,
        utterance_text: String,
        context: Vec<ChatMessage>,
        generation: u64,
    ) -> Self {
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel(32);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            match run(ctx, utterance_text, context, task_cancel, &tx).await {
                Ok(Outcome::Completed) => {
                    let _ = tx.send(ReplyEvent::Finished).await;
                }
                Ok(Outcome::Cancelled) => {
                    debug!(generation, "reply task cancelled, ending silently");
                }
                Err(e) => {
                    warn!(generation, error = %e, "reply task failed");
                    let _ = tx.send(ReplyEvent::Failed(e)).await;
                }
            }
        });
        Self { generation, events: rx, cancel, _handle: handle }
    }

    /// Flag the task cancelled; it stops at its next check point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

async fn run(
    ctx: Arc<ReplyContext>,
    utterance_text: String,
    context: Vec<ChatMessage>,
    cancel: CancelToken,
    tx: &mpsc::Sender<ReplyEvent>,
) -> Result<Outcome, ReplyError> {
    let mut messages = Vec::with_capacity(context.len() + 2);
    messages.push(ChatMessage::system(ctx.system_prompt.clone()));
    messages.extend(context);
    messages.push(ChatMessage::user(utterance_text));

    let specs = ctx.capabilities.specs();
    let mut tool_iterations = 0;

    let reply_text = loop {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let outcome = timeout(ctx.reply_timeout, ctx.generator.generate(&messages, &specs))
            .await
            .map_err(|_| ReplyError::Timeout)??;

        match outcome {
            GenerateOutcome::Reply(text) => break text,
            GenerateOutcome::ToolCall { id, name, args, raw } => {
                tool_iterations += 1;
                if tool_iterations > ctx.tool_loop_limit {
                    return Err(ReplyError::ToolLoopExceeded);
                }
                if cancel.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
                // A capability failure becomes the tool result; the
                // generator decides whether to retry or answer without it.
                let result = match ctx.capabilities.invoke(&name, &args).await {
                    Ok(value) => value.to_string(),
                    Err(e) => json!({ "error": e.to_string() }).to_string(),
                };
                messages.push(ChatMessage::assistant_tool_calls(raw));
                messages.push(ChatMessage::tool(result, id));
            }
        }
    };

    info!(len = reply_text.len(), "reply text ready, synthesizing");
    if tx.send(ReplyEvent::Text(reply_text.clone())).await.is_err() {
        return Ok(Outcome::Cancelled);
    }

    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    let mut audio = timeout(ctx.reply_timeout, ctx.tts.synthesize(&reply_text))
        .await
        .map_err(|_| ReplyError::Timeout)??;

    loop {
        // A stalled synthesis stream counts against the same budget as the
        // call that started it.
        let chunk = match timeout(ctx.reply_timeout, audio.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => return Err(ReplyError::Timeout),
        };
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if tx.send(ReplyEvent::Audio(chunk)).await.is_err() {
            return Ok(Outcome::Cancelled);
        }
    }

    Ok(Outcome::Completed)
}

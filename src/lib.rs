//! wirelive - telephone voice agent relay
//!
//! Connects a live phone call (Twilio Media Streams) to a speech
//! understanding/response loop: caller audio is relayed to a streaming
//! speech-to-text transducer, finalized utterances drive a text-generation
//! step with optional tool use, and the synthesized reply is streamed back
//! to the caller. Each call is owned by one session worker with a
//! turn-taking state machine that handles barge-in.

#![forbid(unsafe_code)]

/// μ-law / linear PCM conversion for the telephony leg
pub mod codec;
/// Environment-driven configuration
pub mod config;
/// Shared data types for the session's event flows
pub mod events;
/// Text-generation collaborator (chat completions with tool calls)
pub mod llm;
/// Process-wide registry of active calls
pub mod registry;
/// Reply pipeline: generation, tool loop, synthesis, cancellation
pub mod reply;
/// Per-call session worker
pub mod session;
/// Speech-to-text transducer
pub mod stt;
/// Twilio media-stream wire protocol and REST triggers
pub mod telephony;
/// External capabilities the generator may invoke
pub mod tools;
/// Transcript aggregation into finalized utterances
pub mod transcript;
/// Text-to-speech transducer
pub mod tts;
/// Turn-taking state machine
pub mod turn;

//! Call session: one worker per call, binding the telephony stream, the
//! STT transducer, the turn controller and the reply pipeline.
//!
//! The worker is a single select loop over three flows: inbound telephony
//! frames, transcript events, and the active reply task's output. The
//! turn controller decides; the loop executes. It runs against plain
//! channels so the transport (an axum WebSocket in production) stays a
//! thin adapter.

use crate::codec;
use crate::config::Config;
use crate::events::{ConversationHistory, TranscriptEvent};
use crate::llm::{MockGenerator, OpenRouterGenerator, TextGenerator};
use crate::registry::{CallSession, SessionRegistry};
use crate::reply::{ReplyContext, ReplyEvent, ReplyTask};
use crate::stt::{DeepgramStt, MockStt, SpeechToText};
use crate::telephony::{self, InboundFrame};
use crate::tools::{CapabilityRegistry, CurrentTime, SendSms};
use crate::transcript::TranscriptAggregator;
use crate::tts::{ElevenLabsTts, MockTts, TextToSpeech};
use crate::turn::{TurnAction, TurnEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The per-call collaborator bundle: one STT transducer with its event
/// stream, plus the shared reply-side collaborators.
pub struct CallCollaborators {
    pub stt: Box<dyn SpeechToText>,
    pub stt_events: mpsc::Receiver<TranscriptEvent>,
    pub generator: Arc<dyn TextGenerator>,
    pub tts: Arc<dyn TextToSpeech>,
    pub capabilities: Arc<CapabilityRegistry>,
}

/// Lines the mock transducer "hears", cycled per utterance.
const MOCK_SCRIPT: &[&str] = &["Hello there.", "What can you do?", "Goodbye."];

async fn build_collaborators(config: &Config) -> anyhow::Result<CallCollaborators> {
    if config.mock_mode {
        let (stt, stt_events) =
            MockStt::start(MOCK_SCRIPT.iter().map(|s| s.to_string()).collect());
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Box::new(CurrentTime));
        return Ok(CallCollaborators {
            stt: Box::new(stt),
            stt_events,
            generator: Arc::new(MockGenerator),
            tts: Arc::new(MockTts),
            capabilities: Arc::new(capabilities),
        });
    }

    let (stt, stt_events) =
        DeepgramStt::connect(&config.deepgram_api_key, &config.stt_model).await?;
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(Box::new(CurrentTime));
    capabilities.register(Box::new(SendSms::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_phone_number.clone(),
    )));
    Ok(CallCollaborators {
        stt: Box::new(stt),
        stt_events,
        generator: Arc::new(OpenRouterGenerator::new(
            config.openrouter_api_key.clone(),
            config.openrouter_model.clone(),
        )),
        tts: Arc::new(ElevenLabsTts::new(
            config.elevenlabs_api_key.clone(),
            config.elevenlabs_voice_id.clone(),
        )),
        capabilities: Arc::new(capabilities),
    })
}

/// Entry point for one telephony connection: waits for the `start`
/// handshake, registers the call, builds the collaborators and drives the
/// session until the stream closes.
pub async fn run_call(
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
) {
    let (stream_sid, call_sid) = loop {
        match inbound.recv().await {
            None => return,
            Some(text) => match InboundFrame::parse(&text) {
                Some(InboundFrame::Start { stream_sid, start }) => {
                    break (stream_sid, start.call_sid)
                }
                Some(InboundFrame::Connected {}) => continue,
                // Anything before `start` has no session to land in.
                _ => continue,
            },
        }
    };
    info!(%stream_sid, %call_sid, "📞 media stream started");

    let session = match registry.create(&stream_sid) {
        Ok(session) => session,
        Err(e) => {
            warn!(%stream_sid, error = %e, "refusing call");
            return;
        }
    };
    let collaborators = match build_collaborators(&config).await {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!(%stream_sid, error = %e, "failed to set up collaborators");
            registry.remove(&stream_sid);
            return;
        }
    };

    run_established(config, registry, session, stream_sid, collaborators, inbound, outbound)
        .await;
}

/// Drive an already-registered call to completion.
pub async fn run_established(
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    session: Arc<CallSession>,
    stream_sid: String,
    collaborators: CallCollaborators,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
) {
    let CallCollaborators { mut stt, mut stt_events, generator, tts, capabilities } =
        collaborators;
    let reply_ctx = Arc::new(ReplyContext {
        generator,
        tts: tts.clone(),
        capabilities,
        system_prompt: config.system_prompt.clone(),
        tool_loop_limit: config.tool_loop_limit,
        reply_timeout: config.reply_timeout,
    });

    let mut aggregator = TranscriptAggregator::new();
    let mut history = ConversationHistory::new(config.max_context_turns);
    let mut active_task: Option<ReplyTask> = None;
    let mut current_utterance = String::new();
    let mut audio_started = false;
    let mut heard_caller = false;
    let mut stt_stream_open = true;

    if !config.greeting.is_empty() {
        speak_direct(&tts, &config.greeting, &stream_sid, &outbound, &config).await;
    }

    loop {
        let mut actions = Vec::new();

        tokio::select! {
            frame = inbound.recv() => match frame {
                None => {
                    info!(%stream_sid, "telephony socket dropped");
                    actions = session.turn().lock().await.on_event(TurnEvent::StreamClosed);
                }
                Some(text) => match InboundFrame::parse(&text) {
                    Some(InboundFrame::Media { sequence_number, media }) => {
                        match telephony::chunk_from_media(&sequence_number, &media) {
                            Ok(chunk) => {
                                if !heard_caller {
                                    heard_caller = true;
                                    actions = session
                                        .turn()
                                        .lock()
                                        .await
                                        .on_event(TurnEvent::CallerAudio);
                                }
                                let samples = codec::decode_mulaw(&chunk.payload);
                                if let Err(e) = stt.send_audio(&samples).await {
                                    warn!(%stream_sid, error = %e, "STT forward failed");
                                }
                            }
                            Err(e) => {
                                // Malformed chunk: drop it, the call goes on.
                                warn!(%stream_sid, error = %e, "dropping media frame");
                            }
                        }
                    }
                    Some(InboundFrame::Mark { mark }) => {
                        debug!(%stream_sid, mark = %mark.name, "mark received");
                    }
                    Some(InboundFrame::Stop {}) => {
                        info!(%stream_sid, "stop frame received");
                        actions = session.turn().lock().await.on_event(TurnEvent::StreamClosed);
                    }
                    Some(InboundFrame::Start { .. }) | Some(InboundFrame::Connected {}) => {
                        debug!(%stream_sid, "duplicate handshake frame ignored");
                    }
                    None => {
                        warn!(%stream_sid, "unrecognized telephony frame");
                    }
                },
            },

            event = stt_events.recv(), if stt_stream_open => match event {
                None => {
                    // Transducer stream ended; the call continues deaf
                    // rather than dying mid-sentence.
                    warn!(%stream_sid, "STT event stream ended");
                    stt_stream_open = false;
                }
                Some(event) => {
                    if let Some(utterance) = aggregator.on_event(event) {
                        info!(%stream_sid, text = %utterance.text, "🎤 utterance finalized");
                        actions = session
                            .turn()
                            .lock()
                            .await
                            .on_event(TurnEvent::UtteranceFinal(utterance));
                    }
                }
            },

            reply_event = next_reply_event(&mut active_task), if active_task.is_some() => {
                let generation = active_task.as_ref().map(|t| t.generation).unwrap_or(0);
                match reply_event {
                    Some(ReplyEvent::Text(text)) => {
                        history.push(current_utterance.clone(), text);
                    }
                    Some(ReplyEvent::Audio(samples)) => {
                        if !audio_started {
                            audio_started = true;
                            actions = session
                                .turn()
                                .lock()
                                .await
                                .on_event(TurnEvent::ReplyAudioStarted { generation });
                        }
                        let frame =
                            telephony::media_frame(&stream_sid, &codec::encode_mulaw(&samples));
                        if outbound.send(frame).await.is_err() {
                            warn!(%stream_sid, "outbound sink closed");
                        }
                    }
                    Some(ReplyEvent::Finished) => {
                        active_task = None;
                        actions = session
                            .turn()
                            .lock()
                            .await
                            .on_event(TurnEvent::ReplyCompleted { generation });
                    }
                    Some(ReplyEvent::Failed(e)) => {
                        warn!(%stream_sid, error = %e, "reply pipeline failed");
                        active_task = None;
                        actions = session
                            .turn()
                            .lock()
                            .await
                            .on_event(TurnEvent::ReplyFailed { generation });
                    }
                    None => {
                        debug!(%stream_sid, "reply task ended silently");
                        active_task = None;
                    }
                }
            },
        }

        let mut teardown = false;
        for action in actions {
            match action {
                TurnAction::CancelReply => {
                    if let Some(task) = active_task.take() {
                        debug!(%stream_sid, generation = task.generation, "cancelling reply");
                        task.cancel();
                    }
                    // Flush audio Twilio has already buffered so the old
                    // reply stops promptly.
                    let _ = outbound.send(telephony::clear_frame(&stream_sid)).await;
                }
                TurnAction::DispatchReply { utterance, generation } => {
                    info!(%stream_sid, generation, "💬 dispatching reply");
                    current_utterance = utterance.text.clone();
                    audio_started = false;
                    active_task = Some(ReplyTask::spawn(
                        reply_ctx.clone(),
                        utterance.text,
                        history.as_messages(),
                        generation,
                    ));
                    let confirm = session
                        .turn()
                        .lock()
                        .await
                        .on_event(TurnEvent::ReplyDispatched { generation });
                    debug_assert!(confirm.is_empty());
                }
                TurnAction::SpeakFallback => {
                    speak_direct(&tts, &config.fallback_text, &stream_sid, &outbound, &config)
                        .await;
                }
                TurnAction::Teardown => {
                    if let Some(task) = active_task.take() {
                        task.cancel();
                    }
                    if let Err(e) = stt.close().await {
                        warn!(%stream_sid, error = %e, "STT close failed");
                    }
                    registry.remove(&stream_sid);
                    teardown = true;
                }
            }
        }
        if teardown {
            break;
        }
    }
    info!(%stream_sid, "✅ call session finished");
}

/// Await the active task's next event. Guarded by `active_task.is_some()`
/// at the select site; the `None` branch only satisfies the borrow.
async fn next_reply_event(active_task: &mut Option<ReplyTask>) -> Option<ReplyEvent> {
    match active_task.as_mut() {
        Some(task) => task.events.recv().await,
        None => std::future::pending().await,
    }
}

/// One-shot synthesis outside the reply-task machinery, used for the
/// greeting and the fallback apology. If synthesis is unavailable the
/// agent stays silent; the call survives either way.
async fn speak_direct(
    tts: &Arc<dyn TextToSpeech>,
    text: &str,
    stream_sid: &str,
    outbound: &mpsc::Sender<String>,
    config: &Config,
) {
    let mut audio = match tokio::time::timeout(config.reply_timeout, tts.synthesize(text)).await
    {
        Ok(Ok(audio)) => audio,
        Ok(Err(e)) => {
            warn!(%stream_sid, error = %e, "direct synthesis failed, staying silent");
            return;
        }
        Err(_) => {
            warn!(%stream_sid, "direct synthesis timed out, staying silent");
            return;
        }
    };
    loop {
        match tokio::time::timeout(config.reply_timeout, audio.recv()).await {
            Ok(Some(samples)) => {
                let frame = telephony::media_frame(stream_sid, &codec::encode_mulaw(&samples));
                if outbound.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(_) => {
                warn!(%stream_sid, "direct synthesis stalled, staying silent");
                return;
            }
        }
    }
}

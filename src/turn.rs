//! Turn controller: the per-call state machine.
//!
//! Synchronous core in the same shape as the rest of the session plumbing:
//! the async worker feeds it events and executes the actions it returns.
//! Reply tasks are identified by a generation counter; only events carrying
//! the current generation can move the machine, so a cancelled task's
//! late completion or audio can never regress state or reach the caller.

use crate::events::Utterance;
use tracing::{debug, info};

/// Call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Call connected, no speech yet.
    Idle,
    /// Caller audio arriving, transcript aggregating.
    Listening,
    /// Utterance finalized, reply pipeline running.
    Thinking,
    /// Synthesized audio streaming to the caller.
    Speaking,
    /// Barge-in: previous reply cancelled, replacement not yet dispatched.
    Interrupted,
    /// Terminal. Late events are dropped silently.
    Ended,
}

/// Events fed to the controller by the session worker.
#[derive(Debug)]
pub enum TurnEvent {
    /// Inbound caller audio observed.
    CallerAudio,
    /// The aggregator finalized an utterance.
    UtteranceFinal(Utterance),
    /// The session spawned the reply task for `generation`.
    ReplyDispatched { generation: u64 },
    /// First audio chunk produced by the reply task.
    ReplyAudioStarted { generation: u64 },
    /// Reply task drained all audio.
    ReplyCompleted { generation: u64 },
    /// Reply task failed (generation, synthesis, timeout, tool loop).
    ReplyFailed { generation: u64 },
    /// Telephony stream closed.
    StreamClosed,
}

/// Actions for the session worker to execute, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum TurnAction {
    /// Cancel the in-flight reply task and discard its remaining output.
    CancelReply,
    /// Spawn a reply task for this utterance under this generation.
    DispatchReply { utterance: Utterance, generation: u64 },
    /// Deliver the fallback apology (or silence if TTS is down).
    SpeakFallback,
    /// Release all owned resources; the call is over.
    Teardown,
}

#[derive(Debug)]
pub struct TurnController {
    state: CallState,
    /// Generation of the most recently dispatched reply task.
    generation: u64,
    /// Whether a reply task is in flight for `generation`.
    active_task: bool,
    /// Finalization sequence of the last dispatched utterance.
    last_final_sequence: u64,
}

impl TurnController {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            generation: 0,
            active_task: false,
            last_final_sequence: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Process one event, returning the actions the session must execute.
    pub fn on_event(&mut self, event: TurnEvent) -> Vec<TurnAction> {
        if self.state == CallState::Ended {
            debug!(?event, "dropping event after call end");
            return vec![];
        }

        match (self.state, event) {
            (_, TurnEvent::StreamClosed) => {
                info!(from = ?self.state, "📞 call ended, tearing down");
                self.state = CallState::Ended;
                self.active_task = false;
                vec![TurnAction::Teardown]
            }

            (CallState::Idle, TurnEvent::CallerAudio) => {
                debug!("caller audio arriving, listening");
                self.state = CallState::Listening;
                vec![]
            }

            (_, TurnEvent::UtteranceFinal(utterance)) => self.on_final(utterance),

            (CallState::Interrupted, TurnEvent::ReplyDispatched { generation })
                if generation == self.generation =>
            {
                self.state = CallState::Thinking;
                vec![]
            }

            (CallState::Thinking, TurnEvent::ReplyAudioStarted { generation })
                if generation == self.generation =>
            {
                info!(generation, "🔊 reply audio started, speaking");
                self.state = CallState::Speaking;
                vec![]
            }

            (CallState::Thinking | CallState::Speaking, TurnEvent::ReplyCompleted { generation })
                if generation == self.generation =>
            {
                info!(generation, "✅ reply finished, back to listening");
                self.state = CallState::Listening;
                self.active_task = false;
                vec![]
            }

            (
                CallState::Thinking | CallState::Speaking | CallState::Interrupted,
                TurnEvent::ReplyFailed { generation },
            ) if generation == self.generation => {
                info!(generation, "⚠️ reply failed, speaking fallback");
                self.state = CallState::Listening;
                self.active_task = false;
                vec![TurnAction::SpeakFallback]
            }

            // Everything else: stale generations, duplicate confirmations,
            // audio while already listening.
            (state, event) => {
                debug!(?state, ?event, "ignoring event");
                vec![]
            }
        }
    }

    /// The barge-in rule: the most recent finalized utterance always wins.
    fn on_final(&mut self, utterance: Utterance) -> Vec<TurnAction> {
        if utterance.sequence <= self.last_final_sequence {
            debug!(
                sequence = utterance.sequence,
                last = self.last_final_sequence,
                "dropping stale finalized utterance"
            );
            return vec![];
        }
        self.last_final_sequence = utterance.sequence;
        self.generation += 1;

        let mut actions = Vec::with_capacity(2);
        if self.active_task {
            actions.push(TurnAction::CancelReply);
        }
        actions.push(TurnAction::DispatchReply { utterance, generation: self.generation });

        self.state = match self.state {
            // Interrupting the agent mid-speech parks the machine until the
            // replacement dispatch is confirmed.
            CallState::Speaking => {
                info!(generation = self.generation, "🚫 barge-in: caller preempts agent speech");
                CallState::Interrupted
            }
            CallState::Interrupted => CallState::Interrupted,
            _ => CallState::Thinking,
        };
        self.active_task = true;
        actions
    }
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str, sequence: u64) -> Utterance {
        Utterance { text: text.into(), sequence }
    }

    fn dispatch(actions: &[TurnAction]) -> u64 {
        match actions.last() {
            Some(TurnAction::DispatchReply { generation, .. }) => *generation,
            other => panic!("expected DispatchReply, got {:?}", other),
        }
    }

    #[test]
    fn happy_path_full_cycle() {
        let mut turn = TurnController::new();
        assert_eq!(turn.state(), CallState::Idle);

        assert!(turn.on_event(TurnEvent::CallerAudio).is_empty());
        assert_eq!(turn.state(), CallState::Listening);

        let actions = turn.on_event(TurnEvent::UtteranceFinal(utterance("what's the weather", 6)));
        assert_eq!(actions.len(), 1);
        let generation = dispatch(&actions);
        assert_eq!(turn.state(), CallState::Thinking);

        assert!(turn.on_event(TurnEvent::ReplyDispatched { generation }).is_empty());
        assert!(turn.on_event(TurnEvent::ReplyAudioStarted { generation }).is_empty());
        assert_eq!(turn.state(), CallState::Speaking);

        assert!(turn.on_event(TurnEvent::ReplyCompleted { generation }).is_empty());
        assert_eq!(turn.state(), CallState::Listening);
    }

    #[test]
    fn barge_in_cancels_and_redispatches() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        let first = dispatch(&turn.on_event(TurnEvent::UtteranceFinal(utterance("first", 1))));
        turn.on_event(TurnEvent::ReplyDispatched { generation: first });
        turn.on_event(TurnEvent::ReplyAudioStarted { generation: first });
        assert_eq!(turn.state(), CallState::Speaking);

        let actions = turn.on_event(TurnEvent::UtteranceFinal(utterance("actually wait", 2)));
        assert_eq!(actions[0], TurnAction::CancelReply);
        let second = dispatch(&actions);
        assert!(second > first);
        assert_eq!(turn.state(), CallState::Interrupted);

        turn.on_event(TurnEvent::ReplyDispatched { generation: second });
        assert_eq!(turn.state(), CallState::Thinking);

        // The cancelled task's late events are stale and change nothing.
        assert!(turn.on_event(TurnEvent::ReplyCompleted { generation: first }).is_empty());
        assert_eq!(turn.state(), CallState::Thinking);
        assert!(turn.on_event(TurnEvent::ReplyAudioStarted { generation: first }).is_empty());
        assert_eq!(turn.state(), CallState::Thinking);

        turn.on_event(TurnEvent::ReplyAudioStarted { generation: second });
        assert_eq!(turn.state(), CallState::Speaking);
    }

    #[test]
    fn new_final_while_thinking_replaces_task() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        let first = dispatch(&turn.on_event(TurnEvent::UtteranceFinal(utterance("one", 1))));

        let actions = turn.on_event(TurnEvent::UtteranceFinal(utterance("two", 2)));
        assert_eq!(actions[0], TurnAction::CancelReply);
        let second = dispatch(&actions);
        assert_eq!(turn.state(), CallState::Thinking);

        // Stale failure from the replaced task does not trigger fallback.
        assert!(turn.on_event(TurnEvent::ReplyFailed { generation: first }).is_empty());
        assert_eq!(turn.state(), CallState::Thinking);

        turn.on_event(TurnEvent::ReplyAudioStarted { generation: second });
        assert_eq!(turn.state(), CallState::Speaking);
    }

    #[test]
    fn stale_finalization_sequence_is_dropped() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        turn.on_event(TurnEvent::UtteranceFinal(utterance("current", 5)));
        assert!(turn.on_event(TurnEvent::UtteranceFinal(utterance("stale resend", 5))).is_empty());
        assert!(turn.on_event(TurnEvent::UtteranceFinal(utterance("older", 3))).is_empty());
    }

    #[test]
    fn failure_speaks_fallback_and_returns_to_listening() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        let generation = dispatch(&turn.on_event(TurnEvent::UtteranceFinal(utterance("hi", 1))));
        let actions = turn.on_event(TurnEvent::ReplyFailed { generation });
        assert_eq!(actions, vec![TurnAction::SpeakFallback]);
        assert_eq!(turn.state(), CallState::Listening);

        // The call is still alive and can take another turn.
        let actions = turn.on_event(TurnEvent::UtteranceFinal(utterance("hello?", 2)));
        assert!(matches!(actions.last(), Some(TurnAction::DispatchReply { .. })));
    }

    #[test]
    fn stream_close_tears_down_from_any_state_and_ends() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        let generation = dispatch(&turn.on_event(TurnEvent::UtteranceFinal(utterance("hi", 1))));
        turn.on_event(TurnEvent::ReplyDispatched { generation });
        turn.on_event(TurnEvent::ReplyAudioStarted { generation });
        assert_eq!(turn.state(), CallState::Speaking);

        let actions = turn.on_event(TurnEvent::StreamClosed);
        assert_eq!(actions, vec![TurnAction::Teardown]);
        assert_eq!(turn.state(), CallState::Ended);

        // Everything after the end is dropped, including another close.
        assert!(turn.on_event(TurnEvent::StreamClosed).is_empty());
        assert!(turn.on_event(TurnEvent::UtteranceFinal(utterance("late", 9))).is_empty());
        assert!(turn.on_event(TurnEvent::ReplyCompleted { generation }).is_empty());
        assert_eq!(turn.state(), CallState::Ended);
    }

    #[test]
    fn double_barge_in_before_dispatch_confirm() {
        let mut turn = TurnController::new();
        turn.on_event(TurnEvent::CallerAudio);
        let first = dispatch(&turn.on_event(TurnEvent::UtteranceFinal(utterance("a", 1))));
        turn.on_event(TurnEvent::ReplyDispatched { generation: first });
        turn.on_event(TurnEvent::ReplyAudioStarted { generation: first });

        turn.on_event(TurnEvent::UtteranceFinal(utterance("b", 2)));
        assert_eq!(turn.state(), CallState::Interrupted);
        // A third utterance lands before the second dispatch is confirmed.
        let actions = turn.on_event(TurnEvent::UtteranceFinal(utterance("c", 3)));
        assert_eq!(actions[0], TurnAction::CancelReply);
        let third = dispatch(&actions);
        assert_eq!(turn.state(), CallState::Interrupted);

        turn.on_event(TurnEvent::ReplyDispatched { generation: third });
        assert_eq!(turn.state(), CallState::Thinking);
    }
}

use std::time::Duration;

use echo_llm::StreamTarget;
use echo_storage::{MessageRecord, RoomId};

use crate::error::{ChatError, ChatResult};

/// Lifecycle of one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    UserMessagePersisted,
    ContextBuilt,
    ModelInvoked,
    AssistantMessagePersisted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransition {
    PersistUser,
    BuildContext,
    InvokeModel,
    PersistAssistant,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    /// The turn already ended; start a new one.
    Terminal(TurnState),
    OutOfOrder {
        from: TurnState,
        transition: TurnTransition,
    },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AssistantMessagePersisted | Self::Failed)
    }

    /// Applies one transition. Steps must run in protocol order. `Fail` is accepted from
    /// any step after the user message was stored.
    pub fn apply(self, transition: TurnTransition) -> TurnTransitionResult {
        if self.is_terminal() {
            return Err(TurnTransitionRejection::Terminal(self));
        }

        let next = match (self, transition) {
            (Self::Idle, TurnTransition::PersistUser) => Self::UserMessagePersisted,
            (Self::UserMessagePersisted, TurnTransition::BuildContext) => Self::ContextBuilt,
            (Self::ContextBuilt, TurnTransition::InvokeModel) => Self::ModelInvoked,
            (Self::ModelInvoked, TurnTransition::PersistAssistant) => {
                Self::AssistantMessagePersisted
            }
            (
                Self::UserMessagePersisted | Self::ContextBuilt | Self::ModelInvoked,
                TurnTransition::Fail,
            ) => Self::Failed,
            (from, transition) => {
                return Err(TurnTransitionRejection::OutOfOrder { from, transition });
            }
        };
        Ok(next)
    }
}

/// Tracks one turn through [`TurnState`], logging each step.
#[derive(Debug)]
pub(crate) struct TurnTracker {
    room_id: RoomId,
    target: StreamTarget,
    state: TurnState,
}

impl TurnTracker {
    pub(crate) fn new(room_id: RoomId, target: StreamTarget) -> Self {
        Self {
            room_id,
            target,
            state: TurnState::Idle,
        }
    }

    pub(crate) fn state(&self) -> TurnState {
        self.state
    }

    pub(crate) fn advance(&mut self, transition: TurnTransition) -> ChatResult<()> {
        match self.state.apply(transition) {
            Ok(next) => {
                tracing::debug!(
                    room_id = %self.room_id,
                    target = ?self.target,
                    from = ?self.state,
                    to = ?next,
                    "turn transition"
                );
                self.state = next;
                Ok(())
            }
            Err(rejection) => {
                tracing::error!(
                    room_id = %self.room_id,
                    target = ?self.target,
                    rejection = ?rejection,
                    "turn transition rejected"
                );
                Err(ChatError::IllegalTransition {
                    stage: "turn-advance",
                    from: self.state,
                    transition,
                })
            }
        }
    }

    /// Marks the turn failed and hands the error back. Failures before the user
    /// message was stored leave the tracker idle.
    pub(crate) fn fail(&mut self, error: ChatError) -> ChatError {
        if let Ok(next) = self.state.apply(TurnTransition::Fail) {
            tracing::error!(
                room_id = %self.room_id,
                target = ?self.target,
                from = ?self.state,
                error = %error,
                "turn failed"
            );
            self.state = next;
        }
        error
    }
}

/// Per-call overrides. Unset fields fall back to room settings, then provider defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub streaming: bool,
    /// Deadline for the model call, fallback included.
    pub timeout: Option<Duration>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            streaming: true,
            timeout: None,
        }
    }
}

impl TurnOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Progress reported to a turn observer while the model answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnProgress<'a> {
    Fragment(&'a str),
    /// The stream failed and a single non-streaming retry started; drop shown fragments.
    FallbackStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub user_message: MessageRecord,
    pub assistant_message: MessageRecord,
    pub used_fallback: bool,
}

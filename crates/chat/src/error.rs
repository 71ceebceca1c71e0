use std::time::Duration;

use echo_llm::{FailureKind, ProviderError};
use echo_storage::StorageError;
use snafu::Snafu;

use crate::turn::{TurnState, TurnTransition};

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("invalid argument '{argument}': {details}"))]
    InvalidArgument {
        stage: &'static str,
        argument: &'static str,
        details: String,
    },
    #[snafu(display("could not reach the model service: {message}"))]
    ApiConnection {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model '{model}' was rejected by the service: {message}"))]
    InvalidModel {
        stage: &'static str,
        model: String,
        message: String,
    },
    #[snafu(display("turn cannot start: {details}"))]
    PreconditionFailed {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("storage failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("model call did not finish within {timeout:?}"))]
    TurnTimedOut {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("turn cannot move from {from:?} via {transition:?}"))]
    IllegalTransition {
        stage: &'static str,
        from: TurnState,
        transition: TurnTransition,
    },
}

impl ChatError {
    /// Storage precondition failures keep their `InvalidArgument` meaning; anything
    /// else is an opaque storage failure.
    pub(crate) fn from_storage(stage: &'static str, source: StorageError) -> Self {
        if source.is_invalid_argument() {
            return Self::InvalidArgument {
                stage,
                argument: "input",
                details: source.to_string(),
            };
        }
        Self::Storage { stage, source }
    }

    pub(crate) fn from_provider(stage: &'static str, model: &str, error: &ProviderError) -> Self {
        match error.kind() {
            FailureKind::InvalidModel => Self::InvalidModel {
                stage,
                model: model.to_string(),
                message: error.to_string(),
            },
            FailureKind::Connection => Self::ApiConnection {
                stage,
                message: error.to_string(),
            },
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// True for failures of the remote call, which the user may retry by resubmitting.
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            Self::ApiConnection { .. } | Self::InvalidModel { .. } | Self::TurnTimedOut { .. }
        )
    }
}

//! Conversation context assembly and the persisted turn protocol.
//!
//! Stored records flow through [`format::to_wire_format`], [`trim::trim_history`] and
//! [`sanitize::sanitize`] before reaching the model; [`ContextManager`] owns the
//! sequence around them.

pub mod error;
pub mod format;
pub mod manager;
pub mod sanitize;
pub mod session;
pub mod trim;
pub mod turn;

pub use error::{ChatError, ChatResult};
pub use format::{UnknownRolePolicy, from_wire_format, to_wire_format};
pub use manager::{ContextManager, DEFAULT_SYSTEM_PROMPT, ModelStatus, RoomStats, RoomSummary};
pub use sanitize::{sanitize, sanitize_json, validate};
pub use session::{ChatSession, RoomSettings};
pub use trim::{PairBudget, trim_history};
pub use turn::{
    TurnOptions, TurnOutcome, TurnProgress, TurnState, TurnTransition, TurnTransitionRejection,
};

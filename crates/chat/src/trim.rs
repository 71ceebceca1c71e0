use std::num::NonZeroUsize;

use echo_llm::{WireMessage, WireRole};

/// Number of user/assistant exchanges kept in model context.
///
/// This counts exchanges, not tokens: a very long message costs the same as a short one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairBudget(NonZeroUsize);

impl PairBudget {
    pub const DEFAULT: PairBudget = PairBudget(NonZeroUsize::MIN.saturating_add(9));
    pub const MAX: usize = 50;

    pub fn new(max_pairs: usize) -> Option<Self> {
        NonZeroUsize::new(max_pairs).map(Self)
    }

    /// Clamps into `1..=MAX`.
    pub fn clamped(max_pairs: usize) -> Self {
        Self::new(max_pairs.min(Self::MAX)).unwrap_or(Self(NonZeroUsize::MIN))
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for PairBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct Exchange<'a> {
    user: &'a WireMessage,
    reply: Option<&'a WireMessage>,
}

/// Keeps every system message (moved to the front, order preserved) followed by the
/// most recent `budget` exchanges. An exchange is a user message plus the assistant
/// message directly after it, if any. Assistant messages with no user message in
/// front of them are discarded.
pub fn trim_history(messages: &[WireMessage], budget: PairBudget) -> Vec<WireMessage> {
    let (system, conversation): (Vec<&WireMessage>, Vec<&WireMessage>) =
        messages.iter().partition(|message| message.is_system());

    let mut exchanges = Vec::new();
    let mut orphaned = 0usize;
    let mut cursor = conversation.into_iter().peekable();
    while let Some(message) = cursor.next() {
        match message.role {
            WireRole::User => {
                let reply = cursor.next_if(|next| next.role == WireRole::Assistant);
                exchanges.push(Exchange {
                    user: message,
                    reply,
                });
            }
            WireRole::Assistant => orphaned += 1,
            WireRole::System => {}
        }
    }

    let dropped = exchanges.len().saturating_sub(budget.get());
    if dropped > 0 || orphaned > 0 {
        tracing::debug!(
            max_pairs = budget.get(),
            dropped_pairs = dropped,
            orphaned_assistant_messages = orphaned,
            "trimmed conversation history"
        );
    }

    system
        .into_iter()
        .cloned()
        .chain(exchanges.into_iter().skip(dropped).flat_map(|exchange| {
            std::iter::once(exchange.user.clone()).chain(exchange.reply.cloned())
        }))
        .collect()
}

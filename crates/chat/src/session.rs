use std::collections::HashMap;
use std::sync::Arc;

use echo_llm::{LlmProvider, StreamTarget};
use echo_storage::RoomId;

use crate::format::UnknownRolePolicy;
use crate::trim::PairBudget;

/// Per-room overrides. Unset fields fall back to session and provider defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSettings {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub history_pairs: Option<PairBudget>,
}

/// Explicit state for one interactive session. Created at session start and
/// passed to every turn; nothing here is process-global.
pub struct ChatSession {
    provider: Option<Arc<dyn LlmProvider>>,
    active_room: Option<RoomId>,
    default_budget: PairBudget,
    unknown_role_policy: UnknownRolePolicy,
    rooms: HashMap<RoomId, RoomSettings>,
    next_target: u64,
}

impl ChatSession {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, default_budget: PairBudget) -> Self {
        Self {
            provider,
            active_room: None,
            default_budget,
            unknown_role_policy: UnknownRolePolicy::default(),
            rooms: HashMap::new(),
            next_target: 1,
        }
    }

    pub fn with_unknown_role_policy(mut self, policy: UnknownRolePolicy) -> Self {
        self.unknown_role_policy = policy;
        self
    }

    pub fn provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        self.provider.as_ref()
    }

    pub fn set_provider(&mut self, provider: Option<Arc<dyn LlmProvider>>) {
        self.provider = provider;
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.active_room
    }

    pub fn set_active_room(&mut self, room_id: Option<RoomId>) {
        self.active_room = room_id;
    }

    pub fn default_budget(&self) -> PairBudget {
        self.default_budget
    }

    pub fn unknown_role_policy(&self) -> UnknownRolePolicy {
        self.unknown_role_policy
    }

    pub fn room_settings(&self, room_id: RoomId) -> RoomSettings {
        self.rooms.get(&room_id).cloned().unwrap_or_default()
    }

    pub fn room_settings_mut(&mut self, room_id: RoomId) -> &mut RoomSettings {
        self.rooms.entry(room_id).or_default()
    }

    pub fn budget_for(&self, room_id: RoomId) -> PairBudget {
        self.rooms
            .get(&room_id)
            .and_then(|settings| settings.history_pairs)
            .unwrap_or(self.default_budget)
    }

    /// Model and temperature a turn in this room would use, explicit arguments first.
    pub fn resolve_parameters(
        &self,
        room_id: RoomId,
        model: Option<&str>,
        temperature: Option<f64>,
    ) -> Option<(String, f64)> {
        let provider = self.provider.as_ref()?;
        let settings = self.rooms.get(&room_id);
        let model = model.or_else(|| settings.and_then(|settings| settings.model.as_deref()));
        let temperature =
            temperature.or_else(|| settings.and_then(|settings| settings.temperature));
        Some(provider.resolve_parameters(model, temperature))
    }

    /// Drops state for a deleted room.
    pub fn forget_room(&mut self, room_id: RoomId) {
        self.rooms.remove(&room_id);
        if self.active_room == Some(room_id) {
            self.active_room = None;
        }
    }

    pub(crate) fn next_target(&mut self) -> StreamTarget {
        let target = StreamTarget(self.next_target);
        self.next_target = self.next_target.wrapping_add(1);
        target
    }
}

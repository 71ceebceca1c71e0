use std::sync::Arc;

use echo_llm::{
    Completion, CompletionRequest, FailureKind, LlmProvider, ProviderError, ProviderResult,
    ProviderStreamHandle, StreamEventPayload, WireMessage,
};
use echo_storage::{MessageRecord, MessageRole, NewMessage, RoomId, RoomRecord, Storage};
use snafu::{OptionExt, ensure};

use crate::error::{
    ApiConnectionSnafu, ChatError, ChatResult, InvalidArgumentSnafu, PreconditionFailedSnafu,
};
use crate::format::to_wire_format;
use crate::sanitize::sanitize;
use crate::session::ChatSession;
use crate::trim::{PairBudget, trim_history};
use crate::turn::{TurnOptions, TurnOutcome, TurnProgress, TurnTracker, TurnTransition};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a smart, friendly, and reliable AI assistant.
Your job is to help users by providing accurate, concise, and thoughtful responses.
Communicate clearly and respectfully, adapt your tone to the user's style, and aim to be as helpful as possible.
When needed, ask clarifying questions to better understand what the user wants.
If you're unsure about something, say so honestly. Avoid speculation, and prioritize usefulness, safety, and clarity in your responses.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room: RoomRecord,
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub total: u64,
    /// Non-system messages with non-blank content.
    pub visible: u64,
    pub human: u64,
    pub assistant: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelStatus {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub connected: bool,
}

/// Orchestrates rooms and turns on top of a [`Storage`] implementation.
pub struct ContextManager<S> {
    store: Arc<S>,
}

impl<S> Clone for ContextManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Storage> ContextManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a room, seeding it with `system_prompt` when one is given and non-blank.
    pub fn create_room(&self, name: &str, system_prompt: Option<&str>) -> ChatResult<RoomRecord> {
        let name = name.trim();
        ensure!(
            !name.is_empty(),
            InvalidArgumentSnafu {
                stage: "create-room",
                argument: "name",
                details: "room name cannot be empty".to_string(),
            }
        );

        let room = self
            .store
            .create_room(name)
            .map_err(|source| ChatError::from_storage("create-room", source))?;

        if let Some(prompt) = system_prompt.map(str::trim).filter(|prompt| !prompt.is_empty())
            && let Err(source) = self
                .store
                .append_message(room.room_id, NewMessage::system(prompt))
        {
            tracing::error!(
                room_id = %room.room_id,
                error = %source,
                "failed to seed system prompt; removing room"
            );
            if let Err(cleanup) = self.store.delete_room(room.room_id) {
                tracing::warn!(room_id = %room.room_id, error = %cleanup, "room cleanup failed");
            }
            return Err(ChatError::from_storage("create-room-system-prompt", source));
        }

        tracing::info!(room_id = %room.room_id, name = %room.name, "room created");
        Ok(room)
    }

    pub fn get_room(&self, room_id: RoomId) -> ChatResult<Option<RoomRecord>> {
        self.store
            .get_room(room_id)
            .map_err(|source| ChatError::from_storage("get-room", source))
    }

    pub fn list_rooms(&self) -> ChatResult<Vec<RoomRecord>> {
        self.store
            .list_rooms()
            .map_err(|source| ChatError::from_storage("list-rooms", source))
    }

    /// Removes the room and its messages. `Ok(false)` when the room did not exist.
    pub fn delete_room(&self, room_id: &str) -> ChatResult<bool> {
        let room_id = parse_room_id("delete-room", room_id)?;
        let deleted = self
            .store
            .delete_room(room_id)
            .map_err(|source| ChatError::from_storage("delete-room", source))?;
        tracing::info!(room_id = %room_id, deleted, "room delete requested");
        Ok(deleted)
    }

    pub fn messages(&self, room_id: RoomId) -> ChatResult<Vec<MessageRecord>> {
        self.store
            .list_messages(room_id)
            .map_err(|source| ChatError::from_storage("list-messages", source))
    }

    pub fn count_messages(&self, room_id: RoomId) -> ChatResult<u64> {
        self.store
            .count_messages(room_id)
            .map_err(|source| ChatError::from_storage("count-messages", source))
    }

    /// Deletes every message in the room, system prompt included.
    pub fn clear_room_messages(&self, room_id: &str) -> ChatResult<u64> {
        let room_id = parse_room_id("clear-room-messages", room_id)?;
        self.store
            .delete_all_messages(room_id)
            .map_err(|source| ChatError::from_storage("clear-room-messages", source))
    }

    /// Deletes human and assistant messages, keeping system prompts.
    pub fn clear_room_chat_history(&self, room_id: &str) -> ChatResult<u64> {
        let room_id = parse_room_id("clear-room-chat-history", room_id)?;
        let deleted = self
            .store
            .delete_non_system_messages(room_id)
            .map_err(|source| ChatError::from_storage("clear-room-chat-history", source))?;
        tracing::info!(room_id = %room_id, deleted, "room chat history cleared");
        Ok(deleted)
    }

    /// Rooms with message counts. Counts are informational and read as 0 on failure.
    pub fn room_summaries(&self) -> ChatResult<Vec<RoomSummary>> {
        let rooms = self.list_rooms()?;
        Ok(rooms
            .into_iter()
            .map(|room| {
                let message_count = self
                    .store
                    .count_messages(room.room_id)
                    .unwrap_or_else(|error| {
                        tracing::warn!(
                            room_id = %room.room_id,
                            error = %error,
                            "message count unavailable"
                        );
                        0
                    });
                RoomSummary {
                    room,
                    message_count,
                }
            })
            .collect())
    }

    /// Informational counters; all zero when the room cannot be read.
    pub fn room_stats(&self, room_id: RoomId) -> RoomStats {
        let messages = match self.store.list_messages(room_id) {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(room_id = %room_id, error = %error, "room stats unavailable");
                return RoomStats::default();
            }
        };

        messages.iter().fold(RoomStats::default(), |mut stats, message| {
            stats.total += 1;
            match message.role {
                MessageRole::Human => stats.human += 1,
                MessageRole::Assistant => stats.assistant += 1,
                MessageRole::System | MessageRole::Other(_) => {}
            }
            if !message.role.is_system() && !message.content.trim().is_empty() {
                stats.visible += 1;
            }
            stats
        })
    }

    /// Plain-text transcript of the room's visible conversation.
    pub fn export_transcript(&self, room_id: RoomId) -> ChatResult<String> {
        let room = self.get_room(room_id)?.context(InvalidArgumentSnafu {
            stage: "export-transcript",
            argument: "room_id",
            details: format!("room {room_id} does not exist"),
        })?;
        let messages = self.messages(room_id)?;

        let mut transcript = format!("Chat Export: {}\n{}\n\n", room.name, "=".repeat(50));
        for message in messages.iter().filter(|message| !message.role.is_system()) {
            let speaker = match message.role {
                MessageRole::Human => "You".to_string(),
                _ => format!("AI ({})", message.model_tag),
            };
            transcript.push_str(&format!("{speaker}:\n{}\n\n", message.content));
        }
        Ok(transcript)
    }

    /// Reads the room, makes sure `pending` is at the tail, then formats, trims and sanitizes.
    pub fn build_context(
        &self,
        session: &ChatSession,
        room_id: RoomId,
        pending: &MessageRecord,
    ) -> ChatResult<Vec<WireMessage>> {
        let mut history = self.messages(room_id)?;
        if !history.iter().any(|message| message.id == pending.id) {
            tracing::debug!(room_id = %room_id, "pending message missing from read; appending");
            history.push(pending.clone());
        }

        let wire = to_wire_format(&history, session.unknown_role_policy());
        let budget: PairBudget = session.budget_for(room_id);
        Ok(sanitize(trim_history(&wire, budget)))
    }

    /// Runs one turn: store the user text, build context, call the model, store the reply.
    pub async fn submit(
        &self,
        session: &mut ChatSession,
        room_id: RoomId,
        text: &str,
        options: TurnOptions,
    ) -> ChatResult<TurnOutcome> {
        self.submit_with_observer(session, room_id, text, options, |_| {})
            .await
    }

    /// Like [`Self::submit`], reporting streamed fragments to `observer`.
    ///
    /// Dropping the returned future cancels the model call; nothing is stored for
    /// the assistant in that case.
    pub async fn submit_with_observer<F>(
        &self,
        session: &mut ChatSession,
        room_id: RoomId,
        text: &str,
        options: TurnOptions,
        mut observer: F,
    ) -> ChatResult<TurnOutcome>
    where
        F: FnMut(TurnProgress<'_>) + Send,
    {
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            InvalidArgumentSnafu {
                stage: "submit",
                argument: "text",
                details: "message cannot be empty".to_string(),
            }
        );
        let provider = session
            .provider()
            .cloned()
            .context(PreconditionFailedSnafu {
                stage: "submit",
                details: "no model is configured for this session".to_string(),
            })?;
        let (model, temperature) = session
            .resolve_parameters(room_id, options.model.as_deref(), options.temperature)
            .context(PreconditionFailedSnafu {
                stage: "submit-resolve-model",
                details: "no model is configured for this session".to_string(),
            })?;

        let target = session.next_target();
        let mut turn = TurnTracker::new(room_id, target);

        let user_message = self
            .store
            .append_message(room_id, NewMessage::human(text))
            .map_err(|source| ChatError::from_storage("submit-persist-user", source))?;
        turn.advance(TurnTransition::PersistUser)?;

        let context = match self.build_context(session, room_id, &user_message) {
            Ok(context) => context,
            Err(error) => return Err(turn.fail(error)),
        };
        turn.advance(TurnTransition::BuildContext)?;

        tracing::debug!(
            room_id = %room_id,
            model = %model,
            temperature,
            context_len = context.len(),
            streaming = options.streaming,
            "invoking model"
        );
        let request = CompletionRequest::new(target, model.clone(), temperature, context);
        turn.advance(TurnTransition::InvokeModel)?;

        let invocation = invoke_model(provider.as_ref(), request, options.streaming, &mut observer);
        let result = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::TurnTimedOut {
                    stage: "submit-model-call",
                    timeout,
                }),
            },
            None => invocation.await,
        };
        let (completion, used_fallback) = match result {
            Ok(done) => done,
            Err(error) => return Err(turn.fail(error)),
        };

        let content = completion.content.trim();
        if content.is_empty() {
            let error = ApiConnectionSnafu {
                stage: "submit-empty-reply",
                message: format!("model '{}' returned an empty reply", completion.model),
            }
            .build();
            return Err(turn.fail(error));
        }

        let model_tag = if completion.model.trim().is_empty() {
            model
        } else {
            completion.model.clone()
        };
        let assistant_message = match self
            .store
            .append_message(room_id, NewMessage::assistant(content, model_tag))
        {
            Ok(message) => message,
            Err(source) => {
                return Err(turn.fail(ChatError::from_storage(
                    "submit-persist-assistant",
                    source,
                )));
            }
        };
        turn.advance(TurnTransition::PersistAssistant)?;

        tracing::info!(
            room_id = %room_id,
            model = %assistant_message.model_tag,
            used_fallback,
            state = ?turn.state(),
            "turn completed"
        );
        Ok(TurnOutcome {
            user_message,
            assistant_message,
            used_fallback,
        })
    }

    /// Active model for the session's current room plus a live connection probe.
    pub async fn model_status(&self, session: &ChatSession) -> ModelStatus {
        let Some(provider) = session.provider() else {
            return ModelStatus {
                provider: None,
                model: None,
                temperature: None,
                connected: false,
            };
        };

        let (model, temperature) = match session.active_room() {
            Some(room_id) => session
                .resolve_parameters(room_id, None, None)
                .unwrap_or_else(|| provider.resolve_parameters(None, None)),
            None => provider.resolve_parameters(None, None),
        };
        let connected = echo_llm::test_connection(provider.as_ref()).await;
        ModelStatus {
            provider: Some(provider.name().to_string()),
            model: Some(model),
            temperature: Some(temperature),
            connected,
        }
    }
}

fn parse_room_id(stage: &'static str, raw: &str) -> ChatResult<RoomId> {
    RoomId::parse(raw).map_err(|source| ChatError::from_storage(stage, source))
}

/// Streams when asked to; a connection-class stream failure gets one non-streaming retry.
async fn invoke_model<F>(
    provider: &dyn LlmProvider,
    request: CompletionRequest,
    streaming: bool,
    observer: &mut F,
) -> ChatResult<(Completion, bool)>
where
    F: FnMut(TurnProgress<'_>) + Send,
{
    let model = request.model_id.clone();
    if !streaming {
        return provider
            .complete(request)
            .await
            .map(|completion| (completion, false))
            .map_err(|error| ChatError::from_provider("complete", &model, &error));
    }

    match stream_completion(provider, request.clone(), observer).await {
        Ok(completion) => Ok((completion, false)),
        Err(error) if error.kind() == FailureKind::Connection => {
            tracing::warn!(
                target = ?request.target,
                model = %model,
                error = %error,
                "stream failed; retrying once without streaming"
            );
            observer(TurnProgress::FallbackStarted);
            provider
                .complete(request)
                .await
                .map(|completion| (completion, true))
                .map_err(|error| ChatError::from_provider("complete-fallback", &model, &error))
        }
        Err(error) => Err(ChatError::from_provider("stream", &model, &error)),
    }
}

/// Drains the stream into one string. Returns only once `Done` arrives.
async fn stream_completion<F>(
    provider: &dyn LlmProvider,
    request: CompletionRequest,
    observer: &mut F,
) -> ProviderResult<Completion>
where
    F: FnMut(TurnProgress<'_>) + Send,
{
    let model = request.model_id.clone();
    let ProviderStreamHandle { mut stream, worker } = provider.stream_complete(request)?;
    let target = stream.target();
    tokio::spawn(worker);

    let mut content = String::new();
    loop {
        let Some(event) = stream.recv().await else {
            return Err(ProviderError::StreamClosed {
                stage: "stream-recv",
                target,
            });
        };
        if event.target != target {
            tracing::debug!(
                expected = ?target,
                received = ?event.target,
                "ignoring stale stream event"
            );
            continue;
        }

        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                observer(TurnProgress::Fragment(&fragment));
                content.push_str(&fragment);
            }
            StreamEventPayload::Done => break,
            StreamEventPayload::Error(failure) => {
                return Err(ProviderError::StreamInterrupted {
                    stage: "stream-event",
                    target,
                    failure,
                });
            }
        }
    }

    Ok(Completion { content, model })
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use echo_chat::{
    ChatError, ChatSession, ContextManager, PairBudget, TurnOptions, TurnProgress,
};
use echo_llm::{
    BoxFuture, Completion, CompletionRequest, LlmProvider, Model, ModelCatalog, ProviderError,
    ProviderFailure, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEventMapped,
    StreamEventPayload, WireMessage, make_event_stream,
};
use echo_storage::{MessageRole, MessageStore, NewMessage, RoomId, SqliteStorage};
use tempfile::TempDir;

const DEFAULT_MODEL: &str = "scripted/default";

enum StreamScript {
    Reply(Vec<&'static str>),
    FailAfter(Vec<&'static str>, ProviderFailure),
    CloseEarly(Vec<&'static str>),
    Hang,
}

enum CompleteScript {
    Reply(&'static str, &'static str),
    Fail(ProviderFailure),
}

#[derive(Default)]
struct ScriptedProvider {
    streams: Mutex<VecDeque<StreamScript>>,
    completes: Mutex<VecDeque<CompleteScript>>,
    stream_requests: Mutex<Vec<CompletionRequest>>,
    complete_requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    fn with_streams(self, scripts: impl IntoIterator<Item = StreamScript>) -> Self {
        self.streams.lock().expect("lock").extend(scripts);
        self
    }

    fn with_completes(self, scripts: impl IntoIterator<Item = CompleteScript>) -> Self {
        self.completes.lock().expect("lock").extend(scripts);
        self
    }

    fn stream_requests(&self) -> Vec<CompletionRequest> {
        self.stream_requests.lock().expect("lock").clone()
    }

    fn complete_requests(&self) -> Vec<CompletionRequest> {
        self.complete_requests.lock().expect("lock").clone()
    }
}

fn scripted_error(request: &CompletionRequest, failure: ProviderFailure) -> ProviderError {
    ProviderError::StreamInterrupted {
        stage: "scripted",
        target: request.target,
        failure,
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn default_temperature(&self) -> f64 {
        0.7
    }

    fn fallback_models(&self) -> &[Model] {
        &[]
    }

    fn list_available_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async { Ok(ModelCatalog::from_provider_api(vec![Model::from_id(DEFAULT_MODEL)])) })
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, ProviderResult<Completion>> {
        Box::pin(async move {
            self.complete_requests.lock().expect("lock").push(request.clone());
            let script = self
                .completes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(CompleteScript::Fail(ProviderFailure::connection("no script")));
            match script {
                CompleteScript::Reply(content, model) => Ok(Completion {
                    content: content.to_string(),
                    model: model.to_string(),
                }),
                CompleteScript::Fail(failure) => Err(scripted_error(&request, failure)),
            }
        })
    }

    fn stream_complete(&self, request: CompletionRequest) -> ProviderResult<ProviderStreamHandle> {
        self.stream_requests.lock().expect("lock").push(request.clone());
        let script = self
            .streams
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(StreamScript::FailAfter(
                Vec::new(),
                ProviderFailure::connection("no script"),
            ));

        let target = request.target;
        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let send = move |payload| {
            let _ = event_tx.send(StreamEventMapped { target, payload });
        };
        let worker: ProviderWorker = Box::pin(async move {
            match script {
                StreamScript::Reply(fragments) => {
                    for fragment in fragments {
                        send(StreamEventPayload::Delta(fragment.to_string()));
                    }
                    send(StreamEventPayload::Done);
                }
                StreamScript::FailAfter(fragments, failure) => {
                    for fragment in fragments {
                        send(StreamEventPayload::Delta(fragment.to_string()));
                    }
                    send(StreamEventPayload::Error(failure));
                }
                StreamScript::CloseEarly(fragments) => {
                    for fragment in fragments {
                        send(StreamEventPayload::Delta(fragment.to_string()));
                    }
                }
                StreamScript::Hang => {
                    let _ = cancel_rx.await;
                    drop(send);
                }
            }
        });
        Ok(ProviderStreamHandle { stream, worker })
    }
}

struct Harness {
    store: Arc<SqliteStorage>,
    manager: ContextManager<SqliteStorage>,
    provider: Arc<ScriptedProvider>,
    session: ChatSession,
    _dir: TempDir,
}

fn harness(provider: ScriptedProvider) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("chat_history.db").display().to_string();
    let store = Arc::new(SqliteStorage::open_blocking(&path).expect("open store"));
    let provider = Arc::new(provider);
    let session = ChatSession::new(
        Some(provider.clone() as Arc<dyn LlmProvider>),
        PairBudget::default(),
    );
    Harness {
        manager: ContextManager::new(store.clone()),
        store,
        provider,
        session,
        _dir: dir,
    }
}

fn roles_and_content(store: &SqliteStorage, room_id: RoomId) -> Vec<(MessageRole, String)> {
    store
        .list_messages(room_id)
        .expect("list")
        .into_iter()
        .map(|message| (message.role, message.content))
        .collect()
}

#[tokio::test]
async fn streamed_reply_is_stored_with_resolved_model() {
    let mut h = harness(ScriptedProvider::default().with_streams([StreamScript::Reply(vec![
        "Hel", "lo", "!",
    ])]));
    let room = h.manager.create_room("Test", Some("Be terse.")).expect("room");

    let mut fragments = Vec::new();
    let outcome = h
        .manager
        .submit_with_observer(
            &mut h.session,
            room.room_id,
            "  Hi  ",
            TurnOptions::default(),
            |progress| {
                if let TurnProgress::Fragment(text) = progress {
                    fragments.push(text.to_string());
                }
            },
        )
        .await
        .expect("turn");

    assert_eq!(fragments, vec!["Hel", "lo", "!"]);
    assert!(!outcome.used_fallback);
    assert_eq!(outcome.user_message.content, "Hi");
    assert_eq!(outcome.assistant_message.content, "Hello!");
    assert_eq!(outcome.assistant_message.model_tag, DEFAULT_MODEL);

    let requests = h.provider.stream_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].messages,
        vec![WireMessage::system("Be terse."), WireMessage::user("Hi")]
    );
    assert_eq!(requests[0].temperature, 0.7);

    assert_eq!(
        roles_and_content(&h.store, room.room_id),
        vec![
            (MessageRole::System, "Be terse.".to_string()),
            (MessageRole::Human, "Hi".to_string()),
            (MessageRole::Assistant, "Hello!".to_string()),
        ]
    );
}

#[tokio::test]
async fn failing_model_keeps_only_the_user_message() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_streams([StreamScript::FailAfter(
                vec!["partial"],
                ProviderFailure::connection("connection reset"),
            )])
            .with_completes([CompleteScript::Fail(ProviderFailure::connection("unreachable"))]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let error = h
        .manager
        .submit(&mut h.session, room.room_id, "hello", TurnOptions::default())
        .await
        .expect_err("turn must fail");

    assert!(matches!(error, ChatError::ApiConnection { .. }), "{error:?}");
    assert_eq!(
        roles_and_content(&h.store, room.room_id),
        vec![(MessageRole::Human, "hello".to_string())]
    );
    assert_eq!(h.provider.complete_requests().len(), 1);
}

#[tokio::test]
async fn stream_failure_falls_back_to_one_plain_completion() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_streams([StreamScript::FailAfter(
                vec!["half an ans"],
                ProviderFailure::connection("reset"),
            )])
            .with_completes([CompleteScript::Reply("Full answer", "routed/model-7")]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let mut fallback_seen = false;
    let outcome = h
        .manager
        .submit_with_observer(
            &mut h.session,
            room.room_id,
            "question",
            TurnOptions::default(),
            |progress| fallback_seen |= progress == TurnProgress::FallbackStarted,
        )
        .await
        .expect("fallback turn");

    assert!(fallback_seen);
    assert!(outcome.used_fallback);
    assert_eq!(outcome.assistant_message.content, "Full answer");
    assert_eq!(outcome.assistant_message.model_tag, "routed/model-7");
    assert_eq!(
        h.provider.stream_requests()[0].messages,
        h.provider.complete_requests()[0].messages
    );
}

#[tokio::test]
async fn stream_closing_without_done_is_a_connection_failure() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_streams([StreamScript::CloseEarly(vec!["trunc"])])
            .with_completes([CompleteScript::Reply("recovered", DEFAULT_MODEL)]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let outcome = h
        .manager
        .submit(&mut h.session, room.room_id, "hi", TurnOptions::default())
        .await
        .expect("turn");

    assert!(outcome.used_fallback);
    assert_eq!(outcome.assistant_message.content, "recovered");
}

#[tokio::test]
async fn rejected_model_is_not_retried() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_streams([StreamScript::FailAfter(
                Vec::new(),
                ProviderFailure::invalid_model("model_not_found"),
            )])
            .with_completes([CompleteScript::Reply("should not be used", DEFAULT_MODEL)]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let error = h
        .manager
        .submit(
            &mut h.session,
            room.room_id,
            "hi",
            TurnOptions::default().with_model("nope/missing"),
        )
        .await
        .expect_err("invalid model");

    match error {
        ChatError::InvalidModel { model, .. } => assert_eq!(model, "nope/missing"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.provider.complete_requests().is_empty());
    assert_eq!(h.store.count_messages(room.room_id).expect("count"), 1);
}

#[tokio::test]
async fn timed_out_turn_stores_no_reply() {
    let mut h = harness(ScriptedProvider::default().with_streams([StreamScript::Hang]));
    let room = h.manager.create_room("R", None).expect("room");

    let error = h
        .manager
        .submit(
            &mut h.session,
            room.room_id,
            "are you there?",
            TurnOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("timeout");

    assert!(matches!(error, ChatError::TurnTimedOut { .. }), "{error:?}");
    assert_eq!(
        roles_and_content(&h.store, room.room_id),
        vec![(MessageRole::Human, "are you there?".to_string())]
    );
}

#[tokio::test]
async fn blank_text_and_missing_provider_store_nothing() {
    let mut h = harness(ScriptedProvider::default());
    let room = h.manager.create_room("R", None).expect("room");

    let error = h
        .manager
        .submit(&mut h.session, room.room_id, " \n ", TurnOptions::default())
        .await
        .expect_err("blank");
    assert!(error.is_invalid_argument());

    h.session.set_provider(None);
    let error = h
        .manager
        .submit(&mut h.session, room.room_id, "hello", TurnOptions::default())
        .await
        .expect_err("no provider");
    assert!(matches!(error, ChatError::PreconditionFailed { .. }));

    assert_eq!(h.store.count_messages(room.room_id).expect("count"), 0);
    assert!(h.provider.stream_requests().is_empty());
}

#[tokio::test]
async fn context_respects_the_room_pair_budget() {
    let mut h =
        harness(ScriptedProvider::default().with_streams([StreamScript::Reply(vec!["ok"])]));
    let room = h.manager.create_room("R", Some("rules")).expect("room");
    for index in 1..=5 {
        h.store
            .append_message(room.room_id, NewMessage::human(format!("q{index}")))
            .expect("human");
        h.store
            .append_message(room.room_id, NewMessage::assistant(format!("a{index}"), "m"))
            .expect("assistant");
    }
    h.session.room_settings_mut(room.room_id).history_pairs = PairBudget::new(2);

    h.manager
        .submit(&mut h.session, room.room_id, "q6", TurnOptions::default())
        .await
        .expect("turn");

    assert_eq!(
        h.provider.stream_requests()[0].messages,
        vec![
            WireMessage::system("rules"),
            WireMessage::user("q5"),
            WireMessage::assistant("a5"),
            WireMessage::user("q6"),
        ]
    );
}

#[tokio::test]
async fn room_overrides_stay_in_their_room() {
    let mut h = harness(ScriptedProvider::default().with_streams([
        StreamScript::Reply(vec!["from a"]),
        StreamScript::Reply(vec!["from b"]),
    ]));
    let room_a = h.manager.create_room("A", None).expect("room a");
    let room_b = h.manager.create_room("B", None).expect("room b");
    let settings = h.session.room_settings_mut(room_a.room_id);
    settings.model = Some("vendor/special".into());
    settings.temperature = Some(0.0);

    let first = h
        .manager
        .submit(&mut h.session, room_a.room_id, "hi a", TurnOptions::default())
        .await
        .expect("turn a");
    let second = h
        .manager
        .submit(&mut h.session, room_b.room_id, "hi b", TurnOptions::default())
        .await
        .expect("turn b");

    assert_eq!(first.assistant_message.model_tag, "vendor/special");
    assert_eq!(second.assistant_message.model_tag, DEFAULT_MODEL);
    let requests = h.provider.stream_requests();
    assert_eq!(requests[0].temperature, 0.0);
    assert_eq!(requests[1].temperature, 0.7);
    assert_eq!(requests[1].messages, vec![WireMessage::user("hi b")]);
    assert_ne!(requests[0].target, requests[1].target);
}

#[tokio::test]
async fn non_streaming_turns_use_plain_completion() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_completes([CompleteScript::Reply("direct", "served/model")]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let outcome = h
        .manager
        .submit(
            &mut h.session,
            room.room_id,
            "hi",
            TurnOptions::default().with_streaming(false),
        )
        .await
        .expect("turn");

    assert!(!outcome.used_fallback);
    assert_eq!(outcome.assistant_message.model_tag, "served/model");
    assert!(h.provider.stream_requests().is_empty());
}

#[tokio::test]
async fn reply_is_stored_without_surrounding_whitespace() {
    let mut h = harness(
        ScriptedProvider::default()
            .with_streams([StreamScript::Reply(vec!["\n\n", "Sure", ", here it is.\n"])]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let outcome = h
        .manager
        .submit(&mut h.session, room.room_id, "hi", TurnOptions::default())
        .await
        .expect("turn");

    assert_eq!(outcome.assistant_message.content, "Sure, here it is.");
    assert_eq!(
        roles_and_content(&h.store, room.room_id),
        vec![
            (MessageRole::Human, "hi".to_string()),
            (MessageRole::Assistant, "Sure, here it is.".to_string()),
        ]
    );
}

#[tokio::test]
async fn empty_reply_is_a_failed_turn() {
    let mut h = harness(
        ScriptedProvider::default().with_streams([StreamScript::Reply(vec![" ", "\n"])]),
    );
    let room = h.manager.create_room("R", None).expect("room");

    let error = h
        .manager
        .submit(&mut h.session, room.room_id, "hi", TurnOptions::default())
        .await
        .expect_err("empty reply");

    assert!(error.is_model_failure());
    assert_eq!(h.store.count_messages(room.room_id).expect("count"), 1);
}

use echo_storage::{
    MessageRole, MessageStore, NewMessage, RoomId, RoomStore, SqliteStorage, StorageError,
};
use tempfile::TempDir;

fn open_store() -> (TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("nested").join("chat_history.db");
    let store = SqliteStorage::open_blocking(&path.display().to_string()).expect("open store");
    (dir, store)
}

#[test]
fn create_room_with_system_prompt_then_exchange() {
    let (_dir, store) = open_store();
    let room = store.create_room("Test").expect("create room");
    store
        .append_message(room.room_id, NewMessage::system("Be terse."))
        .expect("append system");
    assert_eq!(store.count_messages(room.room_id).expect("count"), 1);

    store
        .append_message(room.room_id, NewMessage::human("Hi"))
        .expect("append human");
    store
        .append_message(room.room_id, NewMessage::assistant("Hello", "model-x"))
        .expect("append assistant");

    let messages = store.list_messages(room.room_id).expect("list messages");
    let summary = messages
        .iter()
        .map(|message| {
            (
                message.role.clone(),
                message.content.as_str(),
                message.model_tag.as_str(),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            (MessageRole::System, "Be terse.", "system"),
            (MessageRole::Human, "Hi", "human"),
            (MessageRole::Assistant, "Hello", "model-x"),
        ]
    );
    assert!(messages[0].timestamp_unix_micros < messages[1].timestamp_unix_micros);
    assert!(messages[1].timestamp_unix_micros < messages[2].timestamp_unix_micros);
}

#[test]
fn messages_come_back_in_append_order() {
    let (_dir, store) = open_store();
    let room = store.create_room("ordering").expect("create room");

    for index in 0..25 {
        let input = if index % 2 == 0 {
            NewMessage::human(format!("question {index}"))
        } else {
            NewMessage::assistant(format!("answer {index}"), "model-x")
        };
        store.append_message(room.room_id, input).expect("append");
    }

    let messages = store.list_messages(room.room_id).expect("list");
    assert_eq!(messages.len(), 25);
    for (index, message) in messages.iter().enumerate() {
        assert!(message.content.ends_with(&index.to_string()));
    }
    assert!(
        messages
            .windows(2)
            .all(|pair| pair[0].timestamp_unix_micros < pair[1].timestamp_unix_micros
                && pair[0].id < pair[1].id)
    );
}

#[test]
fn deleting_a_room_removes_its_messages() {
    let (_dir, store) = open_store();
    let doomed = store.create_room("doomed").expect("create doomed");
    let survivor = store.create_room("survivor").expect("create survivor");
    for index in 0..4 {
        store
            .append_message(doomed.room_id, NewMessage::human(format!("m{index}")))
            .expect("append doomed");
    }
    store
        .append_message(survivor.room_id, NewMessage::human("still here"))
        .expect("append survivor");

    assert!(store.delete_room(doomed.room_id).expect("delete room"));

    assert!(store.get_room(doomed.room_id).expect("get room").is_none());
    assert!(store.list_messages(doomed.room_id).expect("list").is_empty());
    assert_eq!(store.count_messages(doomed.room_id).expect("count"), 0);
    assert_eq!(store.count_messages(survivor.room_id).expect("count"), 1);
}

#[test]
fn deleting_an_unknown_room_changes_nothing() {
    let (_dir, store) = open_store();
    store.create_room("one").expect("create");
    store.create_room("two").expect("create");
    let before = store.list_rooms().expect("list before").len();

    assert!(!store.delete_room(RoomId::new_v4()).expect("delete unknown"));

    assert_eq!(store.list_rooms().expect("list after").len(), before);
}

#[test]
fn clearing_history_keeps_system_messages() {
    let (_dir, store) = open_store();
    let room = store.create_room("clear me").expect("create");
    store
        .append_message(room.room_id, NewMessage::system("Stay on topic."))
        .expect("system");
    for index in 0..2 {
        store
            .append_message(room.room_id, NewMessage::human(format!("q{index}")))
            .expect("human");
        store
            .append_message(room.room_id, NewMessage::assistant(format!("a{index}"), "m"))
            .expect("assistant");
    }

    assert_eq!(store.delete_non_system_messages(room.room_id).expect("clear"), 4);

    let remaining = store.list_messages(room.room_id).expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].role, MessageRole::System);
    assert_eq!(remaining[0].content, "Stay on topic.");

    assert_eq!(store.delete_all_messages(room.room_id).expect("clear all"), 1);
    assert_eq!(store.count_messages(room.room_id).expect("count"), 0);
    assert!(store.get_room(room.room_id).expect("room").is_some());
}

#[test]
fn blank_names_and_content_are_rejected() {
    let (_dir, store) = open_store();
    let error = store.create_room("   ").expect_err("blank name");
    assert!(error.is_invalid_argument());

    let room = store.create_room("  padded  ").expect("create");
    assert_eq!(room.name, "padded");

    let error = store
        .append_message(room.room_id, NewMessage::human(" \n\t "))
        .expect_err("blank content");
    assert!(error.is_invalid_argument());
    assert_eq!(store.count_messages(room.room_id).expect("count"), 0);
}

#[test]
fn appending_to_a_missing_room_is_not_found() {
    let (_dir, store) = open_store();
    let error = store
        .append_message(RoomId::new_v4(), NewMessage::human("orphan"))
        .expect_err("missing room");
    assert!(matches!(error, StorageError::NotFound { entity: "room", .. }));
}

#[test]
fn rooms_are_listed_newest_first() {
    let (_dir, store) = open_store();
    let first = store.create_room("first").expect("first");
    let second = store.create_room("second").expect("second");
    let third = store.create_room("third").expect("third");

    let ids = store
        .list_rooms()
        .expect("list")
        .into_iter()
        .map(|room| room.room_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![third.room_id, second.room_id, first.room_id]);

    let loaded = store.get_room(second.room_id).expect("get").expect("exists");
    assert_eq!(loaded, second);
}

#[test]
fn foreign_roles_load_as_other() {
    let (_dir, store) = open_store();
    let room = store.create_room("tools").expect("create");
    store
        .append_message(
            room.room_id,
            NewMessage::new(MessageRole::Other("tool".to_string()), "{\"ok\":true}", "tool"),
        )
        .expect("append");

    let messages = store.list_messages(room.room_id).expect("list");
    assert_eq!(messages[0].role, MessageRole::Other("tool".to_string()));
}

#[test]
fn reopening_keeps_rows() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("chat_history.db").display().to_string();
    let room_id = {
        let store = SqliteStorage::open_blocking(&path).expect("open");
        let room = store.create_room("persistent").expect("create");
        store
            .append_message(room.room_id, NewMessage::human("remember me"))
            .expect("append");
        room.room_id
    };

    let store = SqliteStorage::open_blocking(&path).expect("reopen");
    let messages = store.list_messages(room_id).expect("list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "remember me");
}

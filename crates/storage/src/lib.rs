pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, RoomId};
pub use sqlite::SqliteStorage;
pub use types::{MessageRecord, MessageRole, NewMessage, RoomRecord};

pub trait RoomStore: Send + Sync {
    /// Fails with `InvalidArgument` when the name is blank.
    fn create_room(&self, name: &str) -> StorageResult<RoomRecord>;
    fn get_room(&self, room_id: RoomId) -> StorageResult<Option<RoomRecord>>;
    /// Newest first.
    fn list_rooms(&self) -> StorageResult<Vec<RoomRecord>>;
    /// Removes the room and all of its messages in one transaction.
    /// Returns false, leaving the store untouched, when the room does not exist.
    fn delete_room(&self, room_id: RoomId) -> StorageResult<bool>;
}

pub trait MessageStore: Send + Sync {
    /// Fails with `InvalidArgument` when the content is blank.
    fn append_message(&self, room_id: RoomId, input: NewMessage) -> StorageResult<MessageRecord>;
    /// Ascending timestamp, ties broken by id.
    fn list_messages(&self, room_id: RoomId) -> StorageResult<Vec<MessageRecord>>;
    fn delete_all_messages(&self, room_id: RoomId) -> StorageResult<u64>;
    /// Removes human and assistant rows, keeping system messages.
    fn delete_non_system_messages(&self, room_id: RoomId) -> StorageResult<u64>;
    fn count_messages(&self, room_id: RoomId) -> StorageResult<u64>;
}

pub trait Storage: RoomStore + MessageStore {}

impl<T> Storage for T where T: RoomStore + MessageStore {}

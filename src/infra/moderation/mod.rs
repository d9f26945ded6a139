pub mod in_memory;
pub mod sqlite_chat_store;

pub use in_memory::InMemoryChatStore;
pub use sqlite_chat_store::SqliteChatStore;

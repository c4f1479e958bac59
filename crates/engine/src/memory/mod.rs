pub mod short_term;
pub mod store;

pub use short_term::{ShortMemory, Turn};
pub use store::{flatten_history, FileMemoryStore, MemoryRecord, MemoryStore};

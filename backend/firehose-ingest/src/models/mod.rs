//! Domain types shared by the log adapters, the decoder and the store.

mod entry;
mod event;

pub use entry::{EntryId, LogEntry};
pub use event::{Event, EventPayload};

pub mod checkpoint;
pub mod decision;
pub mod entry;
pub mod event;

pub use checkpoint::Checkpoint;
pub use decision::{Action, Decision};
pub use entry::{dead_letter_key, stream_key, Delivery, EntryId, LogEntry, Values};
pub use event::{Event, EventKey, EventKind, EventPayload, ProdSignal};

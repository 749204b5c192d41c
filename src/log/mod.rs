mod entry;
mod replicated_log;

pub use entry::Command;
pub use entry::Index;
pub use entry::LogEntry;
pub use entry::Term;
pub use replicated_log::ReplicatedLog;

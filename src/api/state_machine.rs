use crate::log::LogEntry;
use bytes::Bytes;

/// StateMachine is the application-specific half of the engine: the engine
/// decides the order of commands, the state machine decides what they mean.
///
/// Called synchronously from the replica's event-loop task, so every method
/// must be fast and infallible. A command that is invalid for the application
/// should still "apply" (e.g. by encoding the rejection into the output);
/// consensus has already happened by the time `apply` runs, and every replica
/// must make the same decision.
pub trait StateMachine: Send + 'static {
    /// Apply a committed entry. Entries arrive exactly once, in log order.
    /// The returned blob is handed back to the client that submitted the
    /// command (when this replica is the leader it was submitted to).
    fn apply(&mut self, entry: &LogEntry) -> Bytes;

    /// Serialize the full applied state. The engine pairs the result with the
    /// apply cursor position, so the capture must reflect exactly the entries
    /// applied so far.
    fn capture_snapshot(&self) -> Bytes;

    /// Replace all applied state with a previously captured snapshot.
    fn restore_snapshot(&mut self, data: Bytes);
}

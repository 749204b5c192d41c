//! Client-facing surface of the library: configuration, the application
//! state-machine trait, engine start-up, and the running-engine handle.

mod config;
mod handle;
mod state_machine;
mod wiring;

pub use config::ConfigParams;
pub use config::RaftOptions;
pub use handle::CommitAbandoned;
pub use handle::PendingCommit;
pub use handle::RaftHandle;
pub use state_machine::StateMachine;
pub use wiring::start;
pub use wiring::EngineConfig;
pub use wiring::EngineStartError;

//! Process-level machinery: the orchestrator, its workers and the state
//! they share.

pub mod orchestrator;
pub mod pid;
pub mod signals;
pub mod spawner;
pub mod state;
pub mod worker;

pub use orchestrator::{ProcessOrchestrator, ShutdownReport};
pub use pid::{PidFile, PidRegistry};
pub use signals::{Role, SignalHandler};
pub use spawner::{CommandSpawner, WorkerExit, WorkerHandle, WorkerSpawner};
pub use state::{DaemonState, FileStore, MemoryStore, RunStatus, StateStore};

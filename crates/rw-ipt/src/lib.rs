pub mod applier;
pub mod diff;
pub mod engine;
pub mod error;
pub mod merge;
pub mod queue;
pub mod runner;
pub mod snapshot;
pub mod status;

#[cfg(test)]
mod testing;

pub use applier::{Applier, FallbackReport};
pub use diff::{FamilyPlan, render_diff};
pub use engine::Engine;
pub use error::{CommitError, ExecError};
pub use queue::{Batch, PendingQueue};
pub use runner::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use snapshot::{FamilyState, TableState};
pub use status::{StatusCollector, table_status};

// iptables-save/restore reconciliation engine

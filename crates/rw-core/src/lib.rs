pub mod config;
pub mod error;
pub mod intent;
pub mod model;
pub mod rule;
pub mod status;
pub mod wire;

pub use config::EngineConfig;
pub use error::RuleError;
pub use intent::{RuleDocument, RuleIntent, load_rule_files};
pub use model::{Family, Operation, Table};
pub use rule::{MatchClause, RuleSpec};
pub use status::{CycleReport, FamilyOutcome, FamilyReport, TableStatus};

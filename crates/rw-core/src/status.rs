use crate::model::{Family, Table};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatus {
    pub family: Family,
    pub table: Table,
    pub chains: usize,
    pub rules: usize,
    pub tombstones: usize,
}

/// What happened to one family during a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FamilyOutcome {
    Unchanged,
    Committed { lines: usize },
    FellBack { attempted: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyReport {
    pub family: Family,
    pub queued: usize,
    pub dump_ok: bool,
    pub outcome: FamilyOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub queued: usize,
    pub families: Vec<FamilyReport>,
    pub tables: Vec<TableStatus>,
}

impl CycleReport {
    pub fn family(&self, family: Family) -> Option<&FamilyReport> {
        self.families.iter().find(|r| r.family == family)
    }

    pub fn changed(&self) -> bool {
        self.families
            .iter()
            .any(|r| !matches!(r.outcome, FamilyOutcome::Unchanged))
    }

    pub fn display(&self) {
        println!("🔁 Reconciliation cycle ({} queued)", self.queued);

        for report in &self.families {
            let outcome = match &report.outcome {
                FamilyOutcome::Unchanged => "unchanged".to_string(),
                FamilyOutcome::Committed { lines } => format!("committed {} lines", lines),
                FamilyOutcome::FellBack { attempted, failed } => {
                    format!("bulk load failed, replayed {} rules ({} failed)", attempted, failed)
                }
            };
            let dump = if report.dump_ok { "" } else { " [stale dump]" };
            println!(
                "  • IPv{}: {} queued, {}{}",
                report.family, report.queued, outcome, dump
            );
        }

        display_tables(&self.tables);
    }
}

pub fn display_tables(tables: &[TableStatus]) {
    println!("\n🔥 Tables ({}):", tables.len());
    if tables.is_empty() {
        println!("  (none)");
        return;
    }
    for t in tables {
        println!(
            "  • v{} {} - {} chains, {} rules",
            t.family, t.table, t.chains, t.rules
        );
    }
}
